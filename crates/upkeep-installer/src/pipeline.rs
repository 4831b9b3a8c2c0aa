//! The staged installation pipeline.
//!
//! Each stage is persisted as the session's current stage before it runs. The four mutating
//! stages own a rollback journal under the package's `journal/` directory; journals survive
//! until `DeleteTemp` commits the update, so a failure in any later stage can still unwind
//! earlier ones.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread;

use anyhow::{anyhow, bail, Context, Result};
use upkeep_core::{join_relative, ComRegistration, FileChange, UpdateDetails};

use crate::error::{is_caused_by, CancelledError, PatchApplicationError};
use crate::executor::{apply_registry_change, FileTransaction};
use crate::fs_utils::{list_files, remove_dir_if_exists, remove_file_if_exists};
use crate::journal::{JournalEntry, JournalPhase, RollbackJournal};
use crate::layout::{PackageLayout, PlatformConfig};
use crate::platform::{Platform, RunningProcess};
use crate::rollback::{replay_journal, RollbackReport};
use crate::session::{SessionState, UpdateStage};

pub type CancelFlag = Arc<AtomicBool>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineEvent {
    StageStarted(UpdateStage),
    Progress {
        stage: UpdateStage,
        percent: u8,
        status: String,
    },
    WaitingForProcesses(Vec<RunningProcess>),
    StageCompleted(UpdateStage),
    RollingBack(UpdateStage),
    RolledBack(RollbackReport),
    Finished,
}

/// A stage failed; everything journaled so far has been unwound.
#[derive(Debug)]
pub struct StageFailure {
    pub stage: UpdateStage,
    pub error: anyhow::Error,
    pub rollback: RollbackReport,
}

impl StageFailure {
    pub fn is_cancelled(&self) -> bool {
        is_caused_by::<CancelledError>(&self.error)
    }

    pub fn is_patch_failure(&self) -> bool {
        is_caused_by::<PatchApplicationError>(&self.error)
    }
}

impl fmt::Display for StageFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stage {} failed: {:#}", self.stage, self.error)?;
        if !self.rollback.is_clean() {
            write!(
                f,
                " ({} rollback steps could not be reverted)",
                self.rollback.failures.len()
            )?;
        }
        Ok(())
    }
}

impl std::error::Error for StageFailure {}

/// Journal phase of each mutating stage.
pub fn journal_phase(stage: UpdateStage) -> Option<JournalPhase> {
    match stage {
        UpdateStage::BackupAndInstallFiles | UpdateStage::WriteClientManifest => {
            Some(JournalPhase::Files)
        }
        UpdateStage::ModifyRegistry | UpdateStage::OptimizeAndExecute => {
            Some(JournalPhase::Registry)
        }
        _ => None,
    }
}

/// Journals to replay when `failed` fails: its own, then earlier registry-phase journals
/// newest first, then earlier files-phase journals newest first.
pub fn rollback_order(failed: UpdateStage) -> Vec<UpdateStage> {
    let earlier = UpdateStage::MAIN
        .iter()
        .rev()
        .copied()
        .filter(|stage| stage.ordinal() < failed.ordinal())
        .collect::<Vec<_>>();

    let mut order = Vec::new();
    if journal_phase(failed).is_some() {
        order.push(failed);
    }
    for phase in [JournalPhase::Registry, JournalPhase::Files] {
        order.extend(
            earlier
                .iter()
                .copied()
                .filter(|stage| journal_phase(*stage) == Some(phase)),
        );
    }
    order
}

/// The stages that have something to do for one package, in execution order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageWork {
    stages: Vec<UpdateStage>,
}

impl StageWork {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn for_package(
        config: &PlatformConfig,
        details: &UpdateDetails,
        package: &PackageLayout,
    ) -> Result<Self> {
        let payload = package.payload_dir();
        let payload_files = list_files(&payload)
            .with_context(|| format!("failed to list package payload: {}", payload.display()))?;
        let changes = &details.file_changes;

        let mut work = Self::none();
        let checks = [
            (
                UpdateStage::ClosingProcesses,
                config.install_dir().exists(),
            ),
            (
                UpdateStage::PreExecute,
                changes.iter().any(FileChange::runs_before_update),
            ),
            (
                UpdateStage::BackupAndInstallFiles,
                !payload_files.is_empty()
                    || changes
                        .iter()
                        .any(|change| change.delete_file || change.delta_patch_relative_path.is_some())
                    || !details.folders_to_delete.is_empty()
                    || !details.services_to_stop.is_empty()
                    || !details.shortcuts.is_empty()
                    || !details.previous_shortcuts.is_empty(),
            ),
            (
                UpdateStage::ModifyRegistry,
                !details.registry_changes.is_empty(),
            ),
            (
                UpdateStage::OptimizeAndExecute,
                changes
                    .iter()
                    .any(|change| change.needs_registration() || change.runs_after_update())
                    || !details.services_to_start.is_empty(),
            ),
            (
                UpdateStage::WriteClientManifest,
                package.client_manifest_path().is_file(),
            ),
            (UpdateStage::DeleteTemp, package.root().exists()),
        ];
        for (stage, has_work) in checks {
            if has_work {
                work.include(stage);
            }
        }
        Ok(work)
    }

    pub fn include(&mut self, stage: UpdateStage) {
        if stage != UpdateStage::Done && !self.stages.contains(&stage) {
            self.stages.push(stage);
            self.stages.sort_by_key(|stage| stage.ordinal());
        }
    }

    pub fn has_work(&self, stage: UpdateStage) -> bool {
        self.stages.contains(&stage)
    }

    pub fn stages(&self) -> &[UpdateStage] {
        &self.stages
    }

    pub fn first(&self) -> UpdateStage {
        self.stages.first().copied().unwrap_or(UpdateStage::Done)
    }

    /// First stage with work at or after `stage`.
    pub fn resume_point(&self, stage: UpdateStage) -> UpdateStage {
        self.stages
            .iter()
            .copied()
            .find(|candidate| candidate.ordinal() >= stage.ordinal())
            .unwrap_or(UpdateStage::Done)
    }

    pub fn next_after(&self, stage: UpdateStage) -> UpdateStage {
        self.stages
            .iter()
            .copied()
            .find(|candidate| candidate.ordinal() > stage.ordinal())
            .unwrap_or(UpdateStage::Done)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageResult {
    /// Normalise a loaded or fresh state onto a stage with work.
    Resume,
    Completed(UpdateStage),
    /// Start over from the first stage, e.g. with a different package.
    Restart,
}

/// Computes the next persisted state. Stages without work are never returned.
pub fn transition(mut state: SessionState, result: StageResult, work: &StageWork) -> SessionState {
    let next = match result {
        StageResult::Resume => work.resume_point(state.current_stage),
        StageResult::Completed(stage) => work.next_after(stage),
        StageResult::Restart => work.first(),
    };
    if next != state.current_stage || result != StageResult::Resume {
        state.enter(next);
    }
    state
}

pub struct Pipeline<'a> {
    config: &'a PlatformConfig,
    platform: &'a mut Platform,
    details: &'a UpdateDetails,
    package: PackageLayout,
    work: StageWork,
    cancel: CancelFlag,
    events: Option<Sender<PipelineEvent>>,
    spared_pids: Vec<u32>,
    /// What reverting an interrupted attempt achieved when it could not finish.
    stale_rollback: RollbackReport,
}

impl<'a> Pipeline<'a> {
    pub fn new(
        config: &'a PlatformConfig,
        platform: &'a mut Platform,
        details: &'a UpdateDetails,
        package: PackageLayout,
    ) -> Result<Self> {
        let work = StageWork::for_package(config, details, &package)?;
        Ok(Self {
            config,
            platform,
            details,
            package,
            work,
            cancel: CancelFlag::default(),
            events: None,
            spared_pids: vec![std::process::id()],
            stale_rollback: RollbackReport::default(),
        })
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_events(mut self, events: Sender<PipelineEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Processes `ClosingProcesses` does not wait for, besides this one.
    pub fn spare_processes(mut self, pids: impl IntoIterator<Item = u32>) -> Self {
        self.spared_pids.extend(pids);
        self
    }

    pub fn work(&self) -> &StageWork {
        &self.work
    }

    pub fn journal_path(&self, stage: UpdateStage) -> PathBuf {
        self.package
            .journal_dir()
            .join(format!("{}.journal", stage.as_str()))
    }

    /// Runs from the session's current stage to `Done`, persisting every transition.
    ///
    /// On failure the journals are replayed, the session file is removed and the failure is
    /// returned; the caller decides whether to retry with another package.
    pub fn run_from(&mut self, session: &mut SessionState) -> Result<(), StageFailure> {
        let state_path = self.config.session_state_path();
        *session = transition(session.clone(), StageResult::Resume, &self.work);
        loop {
            let stage = session.current_stage;
            if stage == UpdateStage::Done {
                if let Err(err) = SessionState::delete(&state_path) {
                    tracing::warn!(error = %format!("{err:#}"), "failed to remove finished session");
                }
                tracing::info!("update finished");
                self.emit(PipelineEvent::Finished);
                return Ok(());
            }

            if let Err(error) = session.save(&state_path) {
                return Err(self.fail(stage, error));
            }
            tracing::info!(stage = %stage, "entering stage");
            self.emit(PipelineEvent::StageStarted(stage));
            if let Err(error) = self.run_stage(stage) {
                return Err(self.fail(stage, error));
            }
            self.emit(PipelineEvent::StageCompleted(stage));
            *session = transition(session.clone(), StageResult::Completed(stage), &self.work);
        }
    }

    /// Executes one stage. Journaled stages first revert any journal left by an interrupted
    /// attempt.
    pub fn run_stage(&mut self, stage: UpdateStage) -> Result<()> {
        self.check_cancelled()?;
        match stage {
            UpdateStage::ClosingProcesses => self.close_processes(),
            UpdateStage::PreExecute => self.pre_execute(),
            UpdateStage::BackupAndInstallFiles
            | UpdateStage::ModifyRegistry
            | UpdateStage::OptimizeAndExecute
            | UpdateStage::WriteClientManifest => self.run_journaled(stage),
            UpdateStage::DeleteTemp => self.delete_temp(),
            UpdateStage::Done => Ok(()),
            UpdateStage::DownloadingSelfUpdate
            | UpdateStage::ExtractingSelfUpdate
            | UpdateStage::InstallingSelfUpdate => {
                bail!("{stage} is not part of the installation pipeline")
            }
        }
    }

    /// Replays the journals `failed` leaves behind, in [`rollback_order`].
    pub fn rollback(&mut self, failed: UpdateStage) -> RollbackReport {
        let mut report = RollbackReport::default();
        for stage in rollback_order(failed) {
            let path = self.journal_path(stage);
            match RollbackJournal::load(&path) {
                Ok(Some(journal)) => {
                    tracing::info!(stage = %stage, entries = journal.len(), "rolling back");
                    report.merge(replay_journal(&journal, &mut *self.platform));
                    if let Err(err) = journal.discard() {
                        report.record_failure(format!("discard journal {}", path.display()), &err);
                    }
                }
                Ok(None) => {}
                Err(err) => report.record_failure(format!("journal {}", path.display()), &err),
            }
        }
        report
    }

    fn fail(&mut self, stage: UpdateStage, error: anyhow::Error) -> StageFailure {
        tracing::warn!(stage = %stage, error = %format!("{error:#}"), "stage failed");
        self.emit(PipelineEvent::RollingBack(stage));
        let mut rollback = std::mem::take(&mut self.stale_rollback);
        rollback.merge(self.rollback(stage));
        if let Err(err) = SessionState::delete(&self.config.session_state_path()) {
            tracing::warn!(error = %format!("{err:#}"), "failed to remove session after rollback");
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

    fn progress(&self, stage: UpdateStage, done: usize, total: usize, status: impl Into<String>) {
        let percent = if total == 0 {
            100
        } else {
            (done.min(total) * 100 / total) as u8
        };
        self.emit(PipelineEvent::Progress {
            stage,
            percent,
            status: status.into(),
        });
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.load(Ordering::SeqCst) {
            return Err(CancelledError.into());
        }
        Ok(())
    }

    fn close_processes(&mut self) -> Result<()> {
        let dir = self.config.install_dir();
        let mut last_seen: Option<Vec<RunningProcess>> = None;
        loop {
            self.check_cancelled()?;
            let running = self
                .platform
                .processes
                .running_under(dir, &self.spared_pids)
                .context("failed to list running processes")?;
            if running.is_empty() {
                return Ok(());
            }
            if last_seen.as_ref() != Some(&running) {
                tracing::info!(count = running.len(), "waiting for processes to exit");
                self.emit(PipelineEvent::WaitingForProcesses(running.clone()));
                last_seen = Some(running);
            }
            thread::sleep(self.config.process_poll_interval());
        }
    }

    fn pre_execute(&mut self) -> Result<()> {
        let payload = self.package.payload_dir();
        let details = self.details;
        let to_run = details
            .file_changes
            .iter()
            .filter(|change| change.runs_before_update())
            .collect::<Vec<_>>();
        for (index, change) in to_run.iter().enumerate() {
            self.check_cancelled()?;
            let staged = change.resolve(&payload);
            let program = if staged.exists() {
                staged
            } else {
                change.resolve(self.config.install_dir())
            };
            self.progress(UpdateStage::PreExecute, index, to_run.len(), &change.relative_path);
            self.execute_program(&program, change)?;
        }
        Ok(())
    }

    fn execute_program(&mut self, program: &Path, change: &FileChange) -> Result<()> {
        let working_dir = program
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.config.install_dir().to_path_buf());
        tracing::info!(program = %program.display(), "executing");
        let code = self.platform.runner.run(
            program,
            change.command_line_args.as_deref(),
            &working_dir,
            change.wait_for_execution,
        )?;
        if change.wait_for_execution && change.rollback_on_non_zero_exit && code != Some(0) {
            bail!(
                "{} exited with {}",
                program.display(),
                code.map_or_else(|| "no exit code".to_string(), |code| format!("code {code}"))
            );
        }
        Ok(())
    }

    fn run_journaled(&mut self, stage: UpdateStage) -> Result<()> {
        let phase = journal_phase(stage).ok_or_else(|| anyhow!("{stage} has no journal"))?;
        let path = self.journal_path(stage);
        if let Some(stale) = RollbackJournal::load(&path)? {
            tracing::info!(
                stage = %stage,
                entries = stale.len(),
                "reverting interrupted attempt before re-running stage"
            );
            let report = replay_journal(&stale, &mut *self.platform);
            // A journal is replayed at most once, so the rollback after a failure skips it.
            stale.discard()?;
            if !report.is_clean() {
                let failed = report.failures.len();
                self.stale_rollback.merge(report);
                bail!("could not revert the interrupted {stage} attempt: {failed} steps failed");
            }
        }

        let backup_root = self.package.backup_dir().join(stage.as_str());
        remove_dir_if_exists(&backup_root)
            .with_context(|| format!("failed to clear {}", backup_root.display()))?;
        let mut journal = RollbackJournal::create(&path, phase)?;
        match stage {
            UpdateStage::BackupAndInstallFiles => self.install_files(&mut journal, backup_root),
            UpdateStage::ModifyRegistry => self.modify_registry(&mut journal),
            UpdateStage::OptimizeAndExecute => self.optimize_and_execute(&mut journal),
            UpdateStage::WriteClientManifest => {
                self.write_client_manifest(&mut journal, backup_root)
            }
            _ => Ok(()),
        }
    }

    fn install_files(&mut self, journal: &mut RollbackJournal, backup_root: PathBuf) -> Result<()> {
        const STAGE: UpdateStage = UpdateStage::BackupAndInstallFiles;
        let install_dir = self.config.install_dir().to_path_buf();
        let shortcuts_dir = self.config.shortcuts_dir().to_path_buf();
        let details = self.details;
        let payload = self.package.payload_dir();
        let payload_files = list_files(&payload)
            .with_context(|| format!("failed to list package payload: {}", payload.display()))?;
        let patches = details
            .file_changes
            .iter()
            .filter(|change| change.delta_patch_relative_path.is_some())
            .collect::<Vec<_>>();
        let total = details.services_to_stop.len()
            + details.previous_shortcuts.len()
            + details.folders_to_delete.len()
            + details.file_changes.len()
            + payload_files.len()
            + details.shortcuts.len();
        let mut done = 0;

        for service in &details.services_to_stop {
            self.check_cancelled()?;
            if self.platform.services.is_running(service)? {
                journal.append(JournalEntry::StartService(service.clone()))?;
                self.platform.services.stop(service)?;
            }
            done += 1;
            self.progress(STAGE, done, total, format!("stopped {service}"));
        }

        let mut tx = FileTransaction::new(journal, backup_root);
        for relative in &details.previous_shortcuts {
            self.check_cancelled()?;
            tx.remove_shortcut(&join_relative(&shortcuts_dir, relative))?;
            done += 1;
        }

        for relative in &details.folders_to_delete {
            self.check_cancelled()?;
            tx.delete_folder(&join_relative(&install_dir, relative))?;
            done += 1;
            self.progress(STAGE, done, total, format!("removed {relative}"));
        }

        for change in details.file_changes.iter().filter(|change| change.delete_file) {
            self.check_cancelled()?;
            tx.delete_file(&change.resolve(&install_dir))?;
            done += 1;
        }

        for relative in &payload_files {
            self.check_cancelled()?;
            tx.copy_file(
                &join_relative(&payload, relative),
                &join_relative(&install_dir, relative),
            )?;
            done += 1;
            self.progress(STAGE, done, total, relative.clone());
        }

        for change in patches {
            self.check_cancelled()?;
            self.apply_patch(&mut tx, change, &install_dir)?;
            done += 1;
            self.progress(STAGE, done, total, format!("patched {}", change.relative_path));
        }

        for record in &details.shortcuts {
            self.check_cancelled()?;
            let Some(relative) = record.relative_output_path.as_deref() else {
                tracing::warn!(target = ?record.target_path, "shortcut has no output path; skipped");
                continue;
            };
            let path = join_relative(&shortcuts_dir, relative);
            tx.prepare_shortcut(&path)?;
            self.platform.shortcuts.create(record, &path)?;
            done += 1;
        }
        self.progress(STAGE, total, total, "files installed");
        Ok(())
    }

    fn apply_patch(
        &mut self,
        tx: &mut FileTransaction<'_>,
        change: &FileChange,
        install_dir: &Path,
    ) -> Result<()> {
        let target = change.resolve(install_dir);
        let Some(patch_relative) = change.delta_patch_relative_path.as_deref() else {
            return Ok(());
        };
        let patch = self.package.patch_path(patch_relative);
        let output = join_relative(&self.package.root().join("patched"), &change.relative_path);
        if let Some(parent) = output.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        if !target.is_file() {
            return Err(PatchApplicationError {
                file: target,
                reason: "file to patch is missing".to_string(),
            }
            .into());
        }
        if let Err(err) = self.platform.patcher.apply(&target, &patch, &output) {
            return Err(anyhow::Error::new(PatchApplicationError {
                file: target,
                reason: format!("{err:#}"),
            }));
        }
        if let Some(expected) = change.new_file_sha256.as_deref() {
            let actual = upkeep_security::sha256_file(&output)?;
            if !upkeep_security::sha256_matches(&actual, expected) {
                return Err(PatchApplicationError {
                    file: target,
                    reason: format!("sha256 mismatch: expected {expected}, got {actual}"),
                }
                .into());
            }
        }
        tx.copy_file(&output, &target)
    }

    fn modify_registry(&mut self, journal: &mut RollbackJournal) -> Result<()> {
        let details = self.details;
        let changes = &details.registry_changes;
        for (index, change) in changes.iter().enumerate() {
            self.check_cancelled()?;
            apply_registry_change(self.platform.registry.as_mut(), change, journal)?;
            self.progress(
                UpdateStage::ModifyRegistry,
                index + 1,
                changes.len(),
                change.display_path(),
            );
        }
        Ok(())
    }

    fn optimize_and_execute(&mut self, journal: &mut RollbackJournal) -> Result<()> {
        const STAGE: UpdateStage = UpdateStage::OptimizeAndExecute;
        let install_dir = self.config.install_dir().to_path_buf();
        let details = self.details;

        for change in details.file_changes.iter().filter(|c| c.needs_registration()) {
            self.check_cancelled()?;
            let file = change.resolve(&install_dir);
            let mut absolute = change.clone();
            absolute.relative_path = file.to_string_lossy().into_owned();

            if change.com_registration.contains(ComRegistration::UNREGISTER) {
                journal.append(JournalEntry::RegisterAssembly(absolute.clone()))?;
                self.platform.registrar.unregister(&file, change)?;
            }
            if change.com_registration.contains(ComRegistration::REGISTER) {
                journal.append(JournalEntry::UnregisterAssembly(absolute.clone()))?;
                self.platform.registrar.register(&file, change)?;
            }
            if change.is_managed_assembly {
                journal.append(JournalEntry::RemoveNativeImage(absolute))?;
                self.platform.registrar.optimize(&file, change)?;
            }
            self.progress(STAGE, 0, 1, format!("registered {}", change.relative_path));
        }

        for change in details.file_changes.iter().filter(|c| c.runs_after_update()) {
            self.check_cancelled()?;
            self.execute_program(&change.resolve(&install_dir), change)?;
        }

        for service in &details.services_to_start {
            self.check_cancelled()?;
            journal.append(JournalEntry::StopService(service.name.clone()))?;
            self.platform
                .services
                .start(&service.name, &service.arguments)?;
        }
        self.progress(STAGE, 1, 1, "optimized");
        Ok(())
    }

    fn write_client_manifest(
        &mut self,
        journal: &mut RollbackJournal,
        backup_root: PathBuf,
    ) -> Result<()> {
        let mut tx = FileTransaction::new(journal, backup_root);
        tx.copy_file(
            &self.package.client_manifest_path(),
            &self.config.client_manifest_path(),
        )
    }

    // Removing the journals commits the update, so they go last; other leftovers are only
    // logged.
    fn delete_temp(&mut self) -> Result<()> {
        let root = self.package.root();
        let journals = self.package.journal_dir();
        match fs::read_dir(root) {
            Ok(entries) => {
                for entry in entries.flatten() {
                    let path = entry.path();
                    if path == journals {
                        continue;
                    }
                    let removed = if path.is_dir() {
                        remove_dir_if_exists(&path)
                    } else {
                        remove_file_if_exists(&path)
                    };
                    if let Err(err) = removed {
                        tracing::warn!(
                            path = %path.display(),
                            error = %err,
                            "failed to remove update temp entry"
                        );
                    }
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => tracing::warn!(
                dir = %root.display(),
                error = %err,
                "failed to list update temp directory"
            ),
        }
        remove_dir_if_exists(&journals)
            .with_context(|| format!("failed to commit journals in {}", journals.display()))?;
        if let Err(err) = remove_dir_if_exists(root) {
            tracing::warn!(
                dir = %root.display(),
                error = %err,
                "failed to remove update temp directory"
            );
        }
        Ok(())
    }
}
