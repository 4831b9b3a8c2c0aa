use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::{anyhow, Context, Result};
use upkeep_core::UpdateDetails;
use upkeep_installer::{
    check_elevation, transition, CancelFlag, PackageLayout, Pipeline, PipelineEvent, Platform,
    PlatformConfig, SessionState, StageFailure, StageResult, UpdateStage,
};
use upkeep_ipc::{IpcMessage, UpdateStep};

use crate::collaborators::SelfUpdateTools;
use crate::notifier::{forward_events, Notifier};
use crate::self_update::{SelfUpdateOutcome, SelfUpdatePlan, SelfUpdater};

/// What a fresh session is started with. Ignored when a session file already exists.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionRequest {
    pub session_id: Option<String>,
    /// Extracted update package; defaults to the session's temp directory.
    pub package_dir: Option<PathBuf>,
    /// Package to fall back to once if a delta patch cannot be applied.
    pub catch_all_package: Option<PathBuf>,
    pub file_to_execute_after_update: Option<String>,
    pub post_update_arguments: Option<String>,
    pub self_update: Option<SelfUpdatePlan>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    Installed {
        session_id: Option<String>,
        used_catch_all: bool,
        launched_after_update: Option<PathBuf>,
    },
    /// The successor updater was launched and owns the rest of the session.
    HandedOff(SelfUpdateOutcome),
}

/// The failed stage and rollback report behind a session error, if a stage failed.
pub fn stage_failure(err: &anyhow::Error) -> Option<&StageFailure> {
    err.downcast_ref::<StageFailure>()
}

/// Drives one update session: decides where to start, checks elevation, runs the pipeline and
/// falls back to the catch-all package once when a patch cannot be applied.
pub struct UpdateSession {
    config: PlatformConfig,
    platform: Platform,
    tools: SelfUpdateTools,
    cancel: CancelFlag,
    spared_pids: Vec<u32>,
    notifier: Option<Arc<Notifier>>,
}

impl UpdateSession {
    pub fn new(config: PlatformConfig, platform: Platform) -> Self {
        Self {
            config,
            platform,
            tools: SelfUpdateTools::native(),
            cancel: CancelFlag::default(),
            spared_pids: Vec::new(),
            notifier: None,
        }
    }

    pub fn with_tools(mut self, tools: SelfUpdateTools) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    /// Processes `ClosingProcesses` must not wait for, such as the previous updater.
    pub fn spare_processes(mut self, pids: impl IntoIterator<Item = u32>) -> Self {
        self.spared_pids.extend(pids);
        self
    }

    pub fn config(&self) -> &PlatformConfig {
        &self.config
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        Arc::clone(&self.cancel)
    }

    /// The persisted session, or a new one built from `request`. Nothing is written here.
    pub fn load_or_create(&self, request: &SessionRequest) -> Result<SessionState> {
        if let Some(session) = SessionState::load(&self.config.session_state_path())? {
            tracing::info!(stage = %session.current_stage, "resuming session");
            return Ok(session);
        }

        let session_id = request
            .session_id
            .clone()
            .or_else(|| {
                request
                    .package_dir
                    .as_deref()
                    .and_then(Path::file_name)
                    .map(|name| name.to_string_lossy().into_owned())
            })
            .unwrap_or_else(new_session_id);
        let package_dir = request
            .package_dir
            .clone()
            .unwrap_or_else(|| self.config.session_temp_dir(&session_id));
        let first = if request.self_update.is_some() {
            UpdateStage::DownloadingSelfUpdate
        } else {
            UpdateStage::ClosingProcesses
        };

        let mut session = SessionState::new(first);
        session.session_id = Some(session_id);
        session.temp_directory = Some(package_dir.display().to_string());
        session.catch_all_package = request
            .catch_all_package
            .as_ref()
            .map(|path| path.display().to_string());
        session.file_to_execute_after_update = request.file_to_execute_after_update.clone();
        session.post_update_arguments = request.post_update_arguments.clone();
        Ok(session)
    }

    /// Runs the session to completion on the calling thread.
    ///
    /// Pipeline events go to `events` and, with a notifier, to IPC peers as progress messages.
    /// The final `Succeeded` or `Failed` message is delivered before this returns.
    pub fn run(
        &mut self,
        request: &SessionRequest,
        events: Option<Sender<PipelineEvent>>,
    ) -> Result<SessionOutcome> {
        self.config.ensure_base_dirs()?;
        let (tx, rx) = mpsc::channel();
        let forwarder = forward_events(rx, events, self.notifier.clone())
            .context("failed to start event forwarder")?;
        let result = self.run_inner(request, tx);
        if forwarder.join().is_err() {
            tracing::warn!("event forwarder panicked");
        }

        if let (Some(notifier), Err(err)) = (&self.notifier, &result) {
            let (title, detail) = failure_text(err);
            let message = IpcMessage::failed(UpdateStep::Install, title, detail);
            if let Err(notify_err) = notifier.notify(&message) {
                tracing::warn!(error = %notify_err, "failure notification not delivered");
            }
        }
        result
    }

    /// Moves the session onto a worker thread.
    pub fn spawn(self, request: SessionRequest) -> Result<SessionHandle> {
        let cancel = self.cancel_flag();
        let (tx, rx) = mpsc::channel();
        let mut session = self;
        let worker = thread::Builder::new()
            .name("upkeep-session".to_string())
            .spawn(move || session.run(&request, Some(tx)))
            .context("failed to start session worker")?;
        Ok(SessionHandle {
            events: rx,
            cancel,
            worker,
        })
    }

    fn run_inner(
        &mut self,
        request: &SessionRequest,
        events: Sender<PipelineEvent>,
    ) -> Result<SessionOutcome> {
        let mut session = self.load_or_create(request)?;

        if session.current_stage.is_self_update() {
            let plan = request
                .self_update
                .as_ref()
                .context("session stopped during a self-update but no self-update plan was given")?;
            let outcome = SelfUpdater::new(&self.config, &mut self.tools)
                .with_cancel(Arc::clone(&self.cancel))
                .with_events(events)
                .run(plan, &mut session)?;
            return Ok(SessionOutcome::HandedOff(outcome));
        }

        let mut used_catch_all = false;
        loop {
            let package = PackageLayout::new(
                session
                    .temp_directory
                    .as_deref()
                    .context("session has no package directory")?,
            );
            let details = load_details(&package)?;
            check_elevation(&self.config, &details)?;

            let mut pipeline = Pipeline::new(&self.config, &mut self.platform, &details, package)?
                .with_cancel(Arc::clone(&self.cancel))
                .with_events(events.clone())
                .spare_processes(self.spared_pids.iter().copied());
            if used_catch_all {
                session = transition(session, StageResult::Restart, pipeline.work());
            }

            match pipeline.run_from(&mut session) {
                Ok(()) => break,
                Err(failure) if failure.is_patch_failure() && can_fall_back(&session) => {
                    drop(pipeline);
                    let fallback = session.catch_all_package.clone().unwrap_or_default();
                    tracing::warn!(
                        stage = %failure.stage,
                        catch_all = %fallback,
                        error = %format!("{:#}", failure.error),
                        "patch failed; retrying with the catch-all package"
                    );
                    session.temp_directory = Some(fallback);
                    session.catch_all_attempted = true;
                    session.enter(UpdateStage::ClosingProcesses);
                    session.save(&self.config.session_state_path())?;
                    used_catch_all = true;
                }
                Err(failure) => return Err(failure.into()),
            }
        }

        let launched_after_update = self.launch_after_update(&session);
        Ok(SessionOutcome::Installed {
            session_id: session.session_id.clone(),
            used_catch_all,
            launched_after_update,
        })
    }

    fn launch_after_update(&mut self, session: &SessionState) -> Option<PathBuf> {
        let file = session.file_to_execute_after_update.as_deref()?;
        let program = self.config.install_dir().join(file);
        let launched = self.platform.runner.run(
            &program,
            session.post_update_arguments.as_deref(),
            self.config.install_dir(),
            false,
        );
        match launched {
            Ok(_) => Some(program),
            Err(err) => {
                tracing::warn!(
                    program = %program.display(),
                    error = %format!("{err:#}"),
                    "failed to start program after update"
                );
                None
            }
        }
    }
}

fn can_fall_back(session: &SessionState) -> bool {
    session.catch_all_package.is_some() && !session.catch_all_attempted
}

fn load_details(package: &PackageLayout) -> Result<UpdateDetails> {
    let path = package.details_path();
    if !path.exists() {
        return Ok(UpdateDetails::default());
    }
    UpdateDetails::load(&path)
}

fn new_session_id() -> String {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos())
        .unwrap_or_default();
    format!("session-{}-{nanos}", std::process::id())
}

fn failure_text(err: &anyhow::Error) -> (String, String) {
    match stage_failure(err) {
        Some(failure) if failure.is_cancelled() => {
            ("Update cancelled".to_string(), format!("cancelled during {}", failure.stage))
        }
        Some(failure) => (
            format!("Update failed during {}", failure.stage),
            format!("{:#}", failure.error),
        ),
        None => ("Update failed".to_string(), format!("{err:#}")),
    }
}

/// A session running on its worker thread.
pub struct SessionHandle {
    events: Receiver<PipelineEvent>,
    cancel: CancelFlag,
    worker: JoinHandle<Result<SessionOutcome>>,
}

impl SessionHandle {
    pub fn events(&self) -> &Receiver<PipelineEvent> {
        &self.events
    }

    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub fn is_finished(&self) -> bool {
        self.worker.is_finished()
    }

    pub fn join(self) -> Result<SessionOutcome> {
        self.worker
            .join()
            .map_err(|_| anyhow!("session worker panicked"))?
    }
}
