//! Replacing the updater itself before it touches the installation.
//!
//! The running updater downloads, verifies and extracts its successor, copies the new executable
//! next to the session, writes the handoff file and launches the successor. The session file is
//! left at `ClosingProcesses` so the successor resumes the main pipeline, while the old process
//! keeps its pipe server up and relays between the successor and any UI.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::mpsc::{Receiver, Sender};
use std::sync::{mpsc, Arc};

use anyhow::{anyhow, bail, Context, Result};
use upkeep_installer::{
    dir_writable, remove_dir_if_exists, remove_file_if_exists, CancelFlag, CancelledError,
    PipelineEvent, PlatformConfig, ProxySettings, RollbackReport, SelfUpdateHandoff,
    SelfUpdateState, SessionState, StageFailure, UpdateStage,
};
use upkeep_ipc::{ClientEvent, Endpoint, IpcAction, IpcMessage, PipeClient};
use upkeep_security::{verify_payload_signature, verify_sha256_file};

use crate::collaborators::SelfUpdateTools;

pub const HANDOFF_FLAG: &str = "--handoff";

const SELF_UPDATE_STAGES: [UpdateStage; 3] = [
    UpdateStage::DownloadingSelfUpdate,
    UpdateStage::ExtractingSelfUpdate,
    UpdateStage::InstallingSelfUpdate,
];

/// Detached Ed25519 signature over the downloaded payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadSignature {
    pub public_key_hex: String,
    pub signature_hex: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelfUpdatePlan {
    /// Local path, `file://` or remote URL of the updater payload.
    pub source: String,
    pub sha256: String,
    pub signature: Option<PayloadSignature>,
    /// The new updater executable, relative to the extracted payload.
    pub executable: String,
    pub is_automatic: bool,
    pub updating_from_service: bool,
    pub proxy: Option<ProxySettings>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelfUpdateOutcome {
    pub session_id: String,
    pub new_self: PathBuf,
    pub pid: u32,
}

/// Scratch space for one self-update, kept outside the package so `DeleteTemp` cannot remove
/// the successor's executable while it runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelfUpdateDir {
    root: PathBuf,
}

impl SelfUpdateDir {
    pub fn new(config: &PlatformConfig, session_id: &str) -> Self {
        Self {
            root: config.tmp_dir().join(format!("{session_id}.self")),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn archive(&self) -> PathBuf {
        self.root.join("download.pkg")
    }

    pub fn payload(&self) -> PathBuf {
        self.root.join("payload")
    }

    pub fn bin(&self) -> PathBuf {
        self.root.join("bin")
    }
}

/// Arguments the successor is started with: the old identity and directories, then `resume`.
pub fn relaunch_arguments(config: &PlatformConfig, handoff_path: &Path) -> Vec<String> {
    vec![
        "--install-dir".to_string(),
        config.install_dir().display().to_string(),
        "--state-dir".to_string(),
        config.state_dir().display().to_string(),
        "--executable".to_string(),
        config.executable_path().display().to_string(),
        "resume".to_string(),
        HANDOFF_FLAG.to_string(),
        handoff_path.display().to_string(),
    ]
}

pub struct SelfUpdater<'a> {
    config: &'a PlatformConfig,
    tools: &'a mut SelfUpdateTools,
    events: Option<Sender<PipelineEvent>>,
    cancel: CancelFlag,
}

impl<'a> SelfUpdater<'a> {
    pub fn new(config: &'a PlatformConfig, tools: &'a mut SelfUpdateTools) -> Self {
        Self {
            config,
            tools,
            events: None,
            cancel: CancelFlag::default(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_events(mut self, events: Sender<PipelineEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Runs the self-update stages from the session's current stage through the successor's
    /// launch. On failure the scratch directory, handoff and session files are removed and the
    /// error carries a [`StageFailure`].
    pub fn run(
        &mut self,
        plan: &SelfUpdatePlan,
        session: &mut SessionState,
    ) -> Result<SelfUpdateOutcome> {
        let session_id = session
            .session_id
            .clone()
            .context("self-update session has no id")?;
        let dir = SelfUpdateDir::new(self.config, &session_id);
        let state_path = self.config.session_state_path();

        let mut launched = None;
        for stage in SELF_UPDATE_STAGES {
            if stage.ordinal() < session.current_stage.ordinal() {
                continue;
            }
            session.enter(stage);
            let attempt = session
                .save(&state_path)
                .and_then(|()| self.run_stage(stage, plan, &dir, session));
            match attempt {
                Ok(outcome) => {
                    self.emit(PipelineEvent::StageCompleted(stage));
                    launched = outcome.or(launched);
                }
                Err(error) => return Err(self.fail(stage, error, &dir).into()),
            }
        }
        launched.ok_or_else(|| anyhow!("self-update finished without launching the new updater"))
    }

    fn run_stage(
        &mut self,
        stage: UpdateStage,
        plan: &SelfUpdatePlan,
        dir: &SelfUpdateDir,
        session: &mut SessionState,
    ) -> Result<Option<SelfUpdateOutcome>> {
        if self.cancel.load(Ordering::SeqCst) {
            return Err(CancelledError.into());
        }
        tracing::info!(stage = %stage, "entering stage");
        self.emit(PipelineEvent::StageStarted(stage));
        match stage {
            UpdateStage::DownloadingSelfUpdate => {
                let archive = dir.archive();
                if session.self_update_state.is_some() && archive.is_file() {
                    tracing::info!(archive = %archive.display(), "reusing downloaded updater payload");
                } else {
                    self.download(plan, &archive)?;
                }
                verify_payload(plan, &archive)?;
                self.record(session, SelfUpdateState::Downloaded)?;
                Ok(None)
            }
            UpdateStage::ExtractingSelfUpdate => {
                self.extract(dir)?;
                self.record(session, SelfUpdateState::Extracted)?;
                Ok(None)
            }
            UpdateStage::InstallingSelfUpdate => self.install(plan, dir, session).map(Some),
            other => bail!("{other} is not a self-update stage"),
        }
    }

    fn record(&self, session: &mut SessionState, progress: SelfUpdateState) -> Result<()> {
        session.self_update_state = Some(progress);
        session.save(&self.config.session_state_path())
    }

    fn download(&mut self, plan: &SelfUpdatePlan, archive: &Path) -> Result<()> {
        remove_file_if_exists(archive)
            .with_context(|| format!("failed to clear {}", archive.display()))?;

        let events = self.events.clone();
        let mut report = |percent: u8| {
            if let Some(events) = &events {
                let _ = events.send(PipelineEvent::Progress {
                    stage: UpdateStage::DownloadingSelfUpdate,
                    percent,
                    status: "Downloading the updater".to_string(),
                });
            }
        };
        self.tools
            .downloader
            .download(&plan.source, archive, &mut report)
            .with_context(|| format!("failed to download {}", plan.source))
    }

    fn extract(&mut self, dir: &SelfUpdateDir) -> Result<()> {
        let archive = dir.archive();
        if !archive.exists() {
            bail!("downloaded updater payload is missing: {}", archive.display());
        }
        let payload = dir.payload();
        remove_dir_if_exists(&payload)
            .with_context(|| format!("failed to clear {}", payload.display()))?;
        self.tools.extractor.extract(&archive, &payload)
    }

    fn install(
        &mut self,
        plan: &SelfUpdatePlan,
        dir: &SelfUpdateDir,
        session: &mut SessionState,
    ) -> Result<SelfUpdateOutcome> {
        let source = dir.payload().join(&plan.executable);
        if !source.is_file() {
            bail!("payload has no updater executable at {}", source.display());
        }
        let file_name = source
            .file_name()
            .with_context(|| format!("updater path has no file name: {}", source.display()))?;
        let bin = dir.bin();
        fs::create_dir_all(&bin).with_context(|| format!("failed to create {}", bin.display()))?;
        let new_self = bin.join(file_name);
        fs::copy(&source, &new_self).with_context(|| {
            format!(
                "failed to copy {} to {}",
                source.display(),
                new_self.display()
            )
        })?;

        let handoff = SelfUpdateHandoff {
            client_file: None,
            server_file: session.server_file.clone(),
            self_server_file: session.self_server_file.clone(),
            base_directory: Some(self.config.install_dir().display().to_string()),
            temp_directory: session.temp_directory.clone(),
            old_self_path: Some(self.config.executable_path().display().to_string()),
            old_self_pid: Some(std::process::id()),
            will_self_update: true,
            needs_elevation: !dir_writable(self.config.install_dir()),
            is_automatic: plan.is_automatic,
            is_new_self: true,
            updating_from_service: plan.updating_from_service,
            proxy: plan.proxy.clone(),
            log_file: None,
        };
        let handoff_path = self.config.handoff_path();
        handoff.save(&handoff_path)?;

        // The successor picks the session up at the main pipeline.
        session.self_update_state = Some(SelfUpdateState::HandedOff);
        session.enter(UpdateStage::ClosingProcesses);
        session.save(&self.config.session_state_path())?;

        let arguments = relaunch_arguments(self.config, &handoff_path);
        let pid = self.tools.launcher.launch(&new_self, &arguments, &bin)?;
        tracing::info!(pid, new_self = %new_self.display(), "launched new updater");
        Ok(SelfUpdateOutcome {
            session_id: session.session_id.clone().unwrap_or_default(),
            new_self,
            pid,
        })
    }

    fn fail(&mut self, stage: UpdateStage, error: anyhow::Error, dir: &SelfUpdateDir) -> StageFailure {
        tracing::warn!(stage = %stage, error = %format!("{error:#}"), "self-update failed");
        self.emit(PipelineEvent::RollingBack(stage));
        let mut rollback = RollbackReport::default();
        if let Err(err) = remove_dir_if_exists(dir.root()) {
            rollback.record_failure(
                format!("remove {}", dir.root().display()),
                &anyhow::Error::from(err),
            );
        }
        if let Err(err) = SelfUpdateHandoff::delete(&self.config.handoff_path()) {
            rollback.record_failure("remove handoff file", &err);
        }
        if let Err(err) = SessionState::delete(&self.config.session_state_path()) {
            rollback.record_failure("remove session file", &err);
        }
        self.emit(PipelineEvent::RolledBack(rollback.clone()));
        StageFailure {
            stage,
            error,
            rollback,
        }
    }

    fn emit(&self, event: PipelineEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }
}

fn verify_payload(plan: &SelfUpdatePlan, archive: &Path) -> Result<()> {
    verify_sha256_file(archive, &plan.sha256)?;
    if let Some(signature) = &plan.signature {
        let payload =
            fs::read(archive).with_context(|| format!("failed to read {}", archive.display()))?;
        verify_payload_signature(&payload, &signature.public_key_hex, &signature.signature_hex)
            .with_context(|| format!("untrusted updater payload {}", archive.display()))?;
    }
    tracing::info!(archive = %archive.display(), "updater payload verified");
    Ok(())
}

/// Removes what a finished self-update left behind once the successor has exited.
pub fn cleanup_self_update(config: &PlatformConfig, session_id: &str) -> Result<()> {
    let dir = SelfUpdateDir::new(config, session_id);
    remove_dir_if_exists(dir.root())
        .with_context(|| format!("failed to remove {}", dir.root().display()))
}

/// Successor side: connect to the previous updater's channel and ask it to relay.
pub fn attach_to_previous_self(
    config: &PlatformConfig,
    handoff: &SelfUpdateHandoff,
) -> Result<(Arc<PipeClient>, Receiver<ClientEvent>)> {
    let old_self = handoff
        .old_self_path
        .as_deref()
        .context("handoff does not name the previous updater")?;
    let endpoint = Endpoint::for_executable(Path::new(old_self), &config.runtime_dir());
    let (tx, rx) = mpsc::channel();
    let client = PipeClient::connect(&endpoint, tx)
        .with_context(|| format!("failed to reach previous updater on {}", endpoint.channel()))?;
    client
        .send(&IpcMessage::action(IpcAction::NewProcess))
        .context("failed to announce the new updater")?;
    tracing::info!(channel = endpoint.channel(), "attached to previous updater");
    Ok((Arc::new(client), rx))
}
