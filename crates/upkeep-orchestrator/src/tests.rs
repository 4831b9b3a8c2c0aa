use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use ed25519_dalek::{Signer, SigningKey};
use upkeep_core::{FileChange, UpdateDetails};
use upkeep_installer::{
    is_caused_by, CancelFlag, DescriptorShortcutInstaller, ElevationRequiredError, HiveRegistry,
    LoggingAssemblyRegistrar, NotifySettings, PatchApplier, PipelineEvent, Platform,
    PlatformConfig, ProcessScanner, ProgramRunner, RollbackReport, RunningProcess,
    SelfUpdateHandoff, SelfUpdateState, ServiceController, SessionState, UpdateStage,
};
use upkeep_ipc::{
    ExtraString, IpcAction, IpcMessage, ResponseKind, RetryPolicy, TransportError, UpdateStep,
};
use upkeep_security::sha256_hex;

use crate::{
    message_for_event, stage_failure, Downloader, Extractor, Handled, Launcher, MessageSink,
    Notifier, PayloadSignature, RequestHandler, SelfUpdateDir, SelfUpdatePlan, SelfUpdateTools,
    SelfUpdater, SessionOutcome, SessionRequest, UpdateSession, UpdateSource, HANDOFF_FLAG,
};

static TEST_ROOT_COUNTER: AtomicU64 = AtomicU64::new(0);

fn test_root(name: &str) -> PathBuf {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system time")
        .as_nanos();
    let sequence = TEST_ROOT_COUNTER.fetch_add(1, Ordering::Relaxed);
    let mut path = std::env::temp_dir();
    path.push(format!(
        "upkeep-orch-{name}-{}-{}-{}",
        std::process::id(),
        nanos,
        sequence
    ));
    fs::create_dir_all(&path).expect("must create test root");
    path
}

fn write_file(path: &Path, contents: &[u8]) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("must create parent dir");
    }
    fs::write(path, contents).expect("must write file");
}

struct NoServices;

impl ServiceController for NoServices {
    fn is_running(&mut self, _name: &str) -> Result<bool> {
        Ok(false)
    }

    fn stop(&mut self, _name: &str) -> Result<()> {
        Ok(())
    }

    fn start(&mut self, _name: &str, _arguments: &[String]) -> Result<()> {
        Ok(())
    }
}

// The "patch" is the new file content.
struct CopyPatcher;

impl PatchApplier for CopyPatcher {
    fn apply(&mut self, _base: &Path, patch: &Path, output: &Path) -> Result<()> {
        fs::copy(patch, output)?;
        Ok(())
    }
}

#[derive(Clone, Default)]
struct Launches(Arc<Mutex<Vec<(PathBuf, Vec<String>)>>>);

impl Launches {
    fn push(&self, program: &Path, arguments: Vec<String>) {
        self.0
            .lock()
            .expect("must lock launches")
            .push((program.to_path_buf(), arguments));
    }

    fn all(&self) -> Vec<(PathBuf, Vec<String>)> {
        self.0.lock().expect("must lock launches").clone()
    }
}

struct RecordingRunner(Launches);

impl ProgramRunner for RecordingRunner {
    fn run(
        &mut self,
        program: &Path,
        arguments: Option<&str>,
        _working_dir: &Path,
        _wait: bool,
    ) -> Result<Option<i32>> {
        self.0
            .push(program, arguments.map(str::to_string).into_iter().collect());
        Ok(None)
    }
}

struct CountingScanner(Arc<AtomicUsize>);

impl ProcessScanner for CountingScanner {
    fn running_under(&mut self, _dir: &Path, _exclude: &[u32]) -> Result<Vec<RunningProcess>> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(Vec::new())
    }
}

struct BytesDownloader(Vec<u8>);

impl Downloader for BytesDownloader {
    fn download(
        &mut self,
        _source: &str,
        destination: &Path,
        progress: &mut dyn FnMut(u8),
    ) -> Result<()> {
        write_file(destination, &self.0);
        progress(100);
        Ok(())
    }
}

struct RefusingDownloader;

impl Downloader for RefusingDownloader {
    fn download(
        &mut self,
        source: &str,
        _destination: &Path,
        _progress: &mut dyn FnMut(u8),
    ) -> Result<()> {
        anyhow::bail!("{source} must not be downloaded again")
    }
}

struct StubExtractor;

impl Extractor for StubExtractor {
    fn extract(&mut self, _archive: &Path, destination: &Path) -> Result<()> {
        write_file(&destination.join("bin/upkeep-next"), b"next updater");
        Ok(())
    }
}

struct RecordingLauncher(Launches);

impl Launcher for RecordingLauncher {
    fn launch(&mut self, program: &Path, arguments: &[String], _working_dir: &Path) -> Result<u32> {
        self.0.push(program, arguments.to_vec());
        Ok(777)
    }
}

struct Fixture {
    root: PathBuf,
    config: PlatformConfig,
    runs: Launches,
    scan_calls: Arc<AtomicUsize>,
}

impl Fixture {
    fn new(name: &str) -> Self {
        let root = test_root(name);
        let install = root.join("app");
        write_file(&install.join("lib/widget.dll"), b"widget v1");
        Self::with_install(root, install)
    }

    fn with_install(root: PathBuf, install: PathBuf) -> Self {
        let config = PlatformConfig::new(&install, root.join("state"), install.join("upkeep"))
            .with_shortcuts_dir(root.join("shortcuts"))
            .with_process_poll_interval(Duration::from_millis(1))
            .with_notify(NotifySettings {
                max_attempts: 3,
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(2),
            });
        Self {
            root,
            config,
            runs: Launches::default(),
            scan_calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn platform(&self) -> Platform {
        Platform {
            registry: Box::new(
                HiveRegistry::open(self.config.registry_hive()).expect("hive must open"),
            ),
            shortcuts: Box::new(DescriptorShortcutInstaller),
            services: Box::new(NoServices),
            registrar: Box::new(LoggingAssemblyRegistrar),
            patcher: Box::new(CopyPatcher),
            runner: Box::new(RecordingRunner(self.runs.clone())),
            processes: Box::new(CountingScanner(self.scan_calls.clone())),
        }
    }

    fn session(&self) -> UpdateSession {
        UpdateSession::new(self.config.clone(), self.platform())
    }

    fn install_file(&self, relative: &str) -> Vec<u8> {
        fs::read(self.config.install_dir().join(relative)).expect("must read installed file")
    }

    /// An extracted package with `files` under its payload and, optionally, update details.
    fn package(
        &self,
        name: &str,
        files: &[(&str, &str)],
        details: Option<&UpdateDetails>,
    ) -> PathBuf {
        let root = self.root.join("packages").join(name);
        for (relative, contents) in files {
            write_file(&root.join("base").join(relative), contents.as_bytes());
        }
        if let Some(details) = details {
            fs::create_dir_all(&root).expect("must create package dir");
            details
                .save(&root.join("updtdetails.udt"))
                .expect("must save update details");
        }
        root
    }
}

impl Drop for Fixture {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.root);
    }
}

/// A delta patch for `lib/widget.dll` whose output must hash to "widget v2".
fn widget_patch_details() -> UpdateDetails {
    let mut widget = FileChange::new("lib/widget.dll");
    widget.delta_patch_relative_path = Some("patches/widget.patch".to_string());
    widget.new_file_sha256 = Some(sha256_hex(b"widget v2"));
    UpdateDetails {
        file_changes: vec![widget],
        ..UpdateDetails::default()
    }
}

fn broken_patch_package(fixture: &Fixture, name: &str) -> PathBuf {
    let details = widget_patch_details();
    let root = fixture.package(name, &[], Some(&details));
    write_file(&root.join("patches/widget.patch"), b"not the expected widget");
    root
}

#[test]
fn fresh_session_installs_payload_and_starts_the_program() {
    let fixture = Fixture::new("fresh");
    let package = fixture.package(
        "pkg",
        &[("app.exe", "app v2"), ("lib/widget.dll", "widget v2")],
        None,
    );
    let request = SessionRequest {
        session_id: Some("s1".to_string()),
        package_dir: Some(package.clone()),
        file_to_execute_after_update: Some("app.exe".to_string()),
        post_update_arguments: Some("--updated".to_string()),
        ..SessionRequest::default()
    };

    let (tx, rx) = mpsc::channel();
    let outcome = fixture
        .session()
        .run(&request, Some(tx))
        .expect("session must succeed");

    let program = fixture.config.install_dir().join("app.exe");
    assert_eq!(
        outcome,
        SessionOutcome::Installed {
            session_id: Some("s1".to_string()),
            used_catch_all: false,
            launched_after_update: Some(program.clone()),
        }
    );
    assert_eq!(fixture.install_file("app.exe"), b"app v2");
    assert_eq!(fixture.install_file("lib/widget.dll"), b"widget v2");
    assert!(!fixture.config.session_state_path().exists());
    assert!(!package.exists(), "temp package must be removed");
    assert_eq!(
        fixture.runs.all(),
        vec![(program, vec!["--updated".to_string()])]
    );
    assert!(fixture.scan_calls.load(Ordering::SeqCst) > 0);

    let events = rx.try_iter().collect::<Vec<_>>();
    assert_eq!(
        events.first(),
        Some(&PipelineEvent::StageStarted(UpdateStage::ClosingProcesses))
    );
    assert_eq!(events.last(), Some(&PipelineEvent::Finished));
}

#[test]
fn new_session_is_built_from_the_request_without_writing_anything() {
    let fixture = Fixture::new("create");
    let session = fixture.session();

    let request = SessionRequest {
        package_dir: Some(fixture.root.join("packages").join("2024-06-update")),
        catch_all_package: Some(fixture.root.join("full")),
        ..SessionRequest::default()
    };
    let state = session.load_or_create(&request).expect("must build session");
    assert_eq!(state.current_stage, UpdateStage::ClosingProcesses);
    assert_eq!(state.session_id.as_deref(), Some("2024-06-update"));
    assert_eq!(
        state.catch_all_package,
        Some(fixture.root.join("full").display().to_string())
    );
    assert!(!fixture.config.session_state_path().exists());

    let state = session
        .load_or_create(&SessionRequest {
            session_id: Some("s9".to_string()),
            ..SessionRequest::default()
        })
        .expect("must build session");
    assert_eq!(
        state.temp_directory,
        Some(fixture.config.session_temp_dir("s9").display().to_string())
    );
}

#[test]
fn persisted_session_wins_over_the_request() {
    let fixture = Fixture::new("resume");
    fixture.config.ensure_base_dirs().expect("must create base dirs");
    let mut saved = SessionState::new(UpdateStage::WriteClientManifest);
    saved.session_id = Some("interrupted".to_string());
    saved.temp_directory = Some(fixture.root.join("packages/old").display().to_string());
    saved
        .save(&fixture.config.session_state_path())
        .expect("must save session");

    let loaded = fixture
        .session()
        .load_or_create(&SessionRequest {
            session_id: Some("other".to_string()),
            ..SessionRequest::default()
        })
        .expect("must load session");
    assert_eq!(loaded.current_stage, UpdateStage::WriteClientManifest);
    assert_eq!(loaded.session_id.as_deref(), Some("interrupted"));
}

#[test]
fn failed_patch_falls_back_to_the_catch_all_package() {
    let fixture = Fixture::new("catchall");
    let delta = broken_patch_package(&fixture, "delta");
    let full = fixture.package("full", &[("lib/widget.dll", "widget v2")], None);
    let request = SessionRequest {
        session_id: Some("s1".to_string()),
        package_dir: Some(delta),
        catch_all_package: Some(full),
        ..SessionRequest::default()
    };

    let outcome = fixture
        .session()
        .run(&request, None)
        .expect("catch-all must succeed");

    let SessionOutcome::Installed { used_catch_all, .. } = outcome else {
        panic!("expected an installed outcome, got {outcome:?}");
    };
    assert!(used_catch_all);
    assert_eq!(fixture.install_file("lib/widget.dll"), b"widget v2");
    assert!(!fixture.config.session_state_path().exists());
}

#[test]
fn catch_all_package_is_only_tried_once() {
    let fixture = Fixture::new("catchall-once");
    let delta = broken_patch_package(&fixture, "delta");
    let full = broken_patch_package(&fixture, "full");
    let request = SessionRequest {
        session_id: Some("s1".to_string()),
        package_dir: Some(delta),
        catch_all_package: Some(full),
        ..SessionRequest::default()
    };

    let err = fixture
        .session()
        .run(&request, None)
        .expect_err("second patch failure must surface");

    let failure = stage_failure(&err).expect("must carry the failed stage");
    assert_eq!(failure.stage, UpdateStage::BackupAndInstallFiles);
    assert!(failure.is_patch_failure());
    assert_eq!(fixture.install_file("lib/widget.dll"), b"widget v1");
    assert!(!fixture.config.session_state_path().exists());
}

#[test]
fn unwritable_install_dir_requires_elevation_before_any_stage() {
    let root = test_root("elevation");
    write_file(&root.join("blocker"), b"not a directory");
    let fixture = Fixture::with_install(root.clone(), root.join("blocker/app"));
    let sink = Arc::new(RecordingSink::accepting_after(0));
    let notifier = Arc::new(Notifier::new(sink.clone(), RetryPolicy::default()));
    let request = SessionRequest {
        session_id: Some("s1".to_string()),
        package_dir: Some(fixture.package("pkg", &[("app.exe", "app v2")], None)),
        ..SessionRequest::default()
    };

    let err = fixture
        .session()
        .with_notifier(notifier)
        .run(&request, None)
        .expect_err("must require elevation");

    assert!(is_caused_by::<ElevationRequiredError>(&err));
    assert!(stage_failure(&err).is_none());
    assert_eq!(fixture.scan_calls.load(Ordering::SeqCst), 0);
    assert!(!fixture.config.session_state_path().exists());

    let last = sink.messages().pop().expect("failure must be notified");
    assert_eq!(last.response, ResponseKind::Failed);
    assert_eq!(last.first_string(), Some("Update failed"));
}

#[test]
fn cancelled_session_fails_at_the_first_stage() {
    let fixture = Fixture::new("cancel");
    let request = SessionRequest {
        session_id: Some("s1".to_string()),
        package_dir: Some(fixture.package("pkg", &[("app.exe", "app v2")], None)),
        ..SessionRequest::default()
    };
    let cancel = CancelFlag::default();
    cancel.store(true, Ordering::SeqCst);

    let err = fixture
        .session()
        .with_cancel(cancel)
        .run(&request, None)
        .expect_err("cancelled session must fail");

    let failure = stage_failure(&err).expect("must carry the failed stage");
    assert!(failure.is_cancelled());
    assert_eq!(failure.stage, UpdateStage::ClosingProcesses);
    assert_eq!(fixture.install_file("lib/widget.dll"), b"widget v1");
    assert!(!fixture.config.install_dir().join("app.exe").exists());
}

#[test]
fn spawned_session_streams_events_and_joins() {
    let fixture = Fixture::new("spawn");
    let request = SessionRequest {
        session_id: Some("s1".to_string()),
        package_dir: Some(fixture.package("pkg", &[("app.exe", "app v2")], None)),
        ..SessionRequest::default()
    };

    let handle = fixture.session().spawn(request).expect("must spawn");
    let mut seen = Vec::new();
    loop {
        let event = handle
            .events()
            .recv_timeout(Duration::from_secs(10))
            .expect("session must report progress");
        let finished = event == PipelineEvent::Finished;
        seen.push(event);
        if finished {
            break;
        }
    }
    let outcome = handle.join().expect("session must succeed");

    assert!(matches!(outcome, SessionOutcome::Installed { .. }));
    assert!(seen.contains(&PipelineEvent::StageStarted(
        UpdateStage::BackupAndInstallFiles
    )));
    assert_eq!(fixture.install_file("app.exe"), b"app v2");
}

fn signed_plan(payload: &[u8], signed: &[u8]) -> SelfUpdatePlan {
    let key = SigningKey::from_bytes(&[7u8; 32]);
    let signature = key.sign(signed);
    SelfUpdatePlan {
        source: "https://updates.example.invalid/upkeep.pkg".to_string(),
        sha256: sha256_hex(payload),
        signature: Some(PayloadSignature {
            public_key_hex: hex::encode(key.verifying_key().to_bytes()),
            signature_hex: hex::encode(signature.to_bytes()),
        }),
        executable: "bin/upkeep-next".to_string(),
        is_automatic: true,
        updating_from_service: false,
        proxy: None,
    }
}

fn self_update_session(fixture: &Fixture, payload: &[u8], launches: &Launches) -> UpdateSession {
    fixture.session().with_tools(SelfUpdateTools {
        downloader: Box::new(BytesDownloader(payload.to_vec())),
        extractor: Box::new(StubExtractor),
        launcher: Box::new(RecordingLauncher(launches.clone())),
    })
}

#[test]
fn self_update_verifies_payload_and_hands_off_to_the_successor() {
    let fixture = Fixture::new("selfupdate");
    let payload = b"updater payload v2";
    let launches = Launches::default();
    let request = SessionRequest {
        session_id: Some("s2".to_string()),
        self_update: Some(signed_plan(payload, payload)),
        ..SessionRequest::default()
    };

    let outcome = self_update_session(&fixture, payload, &launches)
        .run(&request, None)
        .expect("self-update must succeed");

    let dir = SelfUpdateDir::new(&fixture.config, "s2");
    let new_self = dir.bin().join("upkeep-next");
    let SessionOutcome::HandedOff(hand_off) = outcome else {
        panic!("expected a hand-off, got {outcome:?}");
    };
    assert_eq!(hand_off.session_id, "s2");
    assert_eq!(hand_off.pid, 777);
    assert_eq!(hand_off.new_self, new_self);
    assert_eq!(
        fs::read(&new_self).expect("successor must be copied"),
        b"next updater"
    );

    let handoff = SelfUpdateHandoff::load(&fixture.config.handoff_path())
        .expect("handoff must load")
        .expect("handoff must exist");
    assert!(handoff.is_new_self);
    assert!(handoff.is_automatic);
    assert!(!handoff.needs_elevation);
    assert_eq!(handoff.old_self_pid, Some(std::process::id()));
    assert_eq!(
        handoff.old_self_path,
        Some(fixture.config.executable_path().display().to_string())
    );

    let session = SessionState::load(&fixture.config.session_state_path())
        .expect("session must load")
        .expect("session must be kept for the successor");
    assert_eq!(session.current_stage, UpdateStage::ClosingProcesses);
    assert_eq!(session.self_update_state, Some(SelfUpdateState::HandedOff));

    let launched = launches.all();
    assert_eq!(launched.len(), 1);
    let (program, arguments) = &launched[0];
    assert_eq!(program, &new_self);
    let flag = arguments
        .iter()
        .position(|argument| argument == HANDOFF_FLAG)
        .expect("successor must get the handoff flag");
    assert_eq!(arguments[flag - 1], "resume");
    assert_eq!(
        arguments[flag + 1],
        fixture.config.handoff_path().display().to_string()
    );
}

#[test]
fn resumed_self_update_reuses_the_verified_download() {
    let fixture = Fixture::new("selfupdate-resume");
    let payload = b"updater payload v2";
    let plan = signed_plan(payload, payload);
    write_file(&SelfUpdateDir::new(&fixture.config, "s5").archive(), payload);

    let mut session = SessionState::new(UpdateStage::DownloadingSelfUpdate);
    session.session_id = Some("s5".to_string());
    session.self_update_state = Some(SelfUpdateState::Downloaded);

    let launches = Launches::default();
    let mut tools = SelfUpdateTools {
        downloader: Box::new(RefusingDownloader),
        extractor: Box::new(StubExtractor),
        launcher: Box::new(RecordingLauncher(launches.clone())),
    };
    let outcome = SelfUpdater::new(&fixture.config, &mut tools)
        .run(&plan, &mut session)
        .expect("resumed self-update must succeed");

    assert_eq!(outcome.pid, 777);
    assert_eq!(launches.all().len(), 1);
    assert_eq!(session.self_update_state, Some(SelfUpdateState::HandedOff));
}

#[test]
fn resumed_self_update_still_verifies_the_kept_download() {
    let fixture = Fixture::new("selfupdate-resume-sha");
    let plan = signed_plan(b"expected payload", b"expected payload");
    write_file(
        &SelfUpdateDir::new(&fixture.config, "s6").archive(),
        b"corrupted on disk",
    );

    let mut session = SessionState::new(UpdateStage::DownloadingSelfUpdate);
    session.session_id = Some("s6".to_string());
    session.self_update_state = Some(SelfUpdateState::Downloaded);

    let launches = Launches::default();
    let mut tools = SelfUpdateTools {
        downloader: Box::new(RefusingDownloader),
        extractor: Box::new(StubExtractor),
        launcher: Box::new(RecordingLauncher(launches.clone())),
    };
    let err = SelfUpdater::new(&fixture.config, &mut tools)
        .run(&plan, &mut session)
        .expect_err("a kept download that fails its checksum must be rejected");

    let failure = stage_failure(&err).expect("must carry the failed stage");
    assert_eq!(failure.stage, UpdateStage::DownloadingSelfUpdate);
    assert!(launches.all().is_empty());
}

#[test]
fn tampered_self_update_payload_is_rejected_and_cleaned_up() {
    let fixture = Fixture::new("selfupdate-sha");
    let launches = Launches::default();
    let request = SessionRequest {
        session_id: Some("s3".to_string()),
        self_update: Some(signed_plan(b"expected payload", b"expected payload")),
        ..SessionRequest::default()
    };

    let err = self_update_session(&fixture, b"tampered payload", &launches)
        .run(&request, None)
        .expect_err("checksum mismatch must fail");

    let failure = stage_failure(&err).expect("must carry the failed stage");
    assert_eq!(failure.stage, UpdateStage::DownloadingSelfUpdate);
    assert_eq!(failure.rollback, RollbackReport::default());
    assert!(launches.all().is_empty());
    assert!(!SelfUpdateDir::new(&fixture.config, "s3").root().exists());
    assert!(!fixture.config.handoff_path().exists());
    assert!(!fixture.config.session_state_path().exists());
}

#[test]
fn self_update_with_a_foreign_signature_is_rejected() {
    let fixture = Fixture::new("selfupdate-sig");
    let payload = b"updater payload v2";
    let launches = Launches::default();
    let request = SessionRequest {
        session_id: Some("s4".to_string()),
        self_update: Some(signed_plan(payload, b"some other payload")),
        ..SessionRequest::default()
    };

    let err = self_update_session(&fixture, payload, &launches)
        .run(&request, None)
        .expect_err("bad signature must fail");

    let failure = stage_failure(&err).expect("must carry the failed stage");
    assert_eq!(failure.stage, UpdateStage::DownloadingSelfUpdate);
    assert!(launches.all().is_empty());
    assert!(!fixture.config.handoff_path().exists());
}

struct EchoSource;

impl UpdateSource for EchoSource {
    fn handle(&mut self, step: UpdateStep, _request: &IpcMessage) -> Result<IpcMessage> {
        match step {
            UpdateStep::CheckForUpdate => Ok(IpcMessage::succeeded(step)),
            other => anyhow::bail!("{other:?} is unavailable"),
        }
    }
}

#[test]
fn request_handler_answers_local_requests() {
    let cancel = CancelFlag::default();
    let mut handler = RequestHandler::new(cancel.clone());

    let Handled::Reply(reply) = handler.handle(&IpcMessage::action(IpcAction::GetProcessId))
    else {
        panic!("process id request must be answered");
    };
    assert_eq!(reply.process_id, Some(std::process::id()));

    assert_eq!(
        handler.handle(&IpcMessage::action(IpcAction::Cancel)),
        Handled::Nothing
    );
    assert!(cancel.load(Ordering::SeqCst));

    assert_eq!(
        handler.handle(&IpcMessage::update_step(UpdateStep::Install)),
        Handled::StartInstall
    );

    let restart = IpcMessage::update_step(UpdateStep::RestartInfo)
        .with_string(ExtraString::plain(""))
        .with_string(ExtraString::plain("--minimized"));
    assert_eq!(
        handler.handle(&restart),
        Handled::Reply(IpcMessage::succeeded(UpdateStep::RestartInfo))
    );
    assert_eq!(handler.restart_info().program, None);
    assert_eq!(
        handler.restart_info().arguments.as_deref(),
        Some("--minimized")
    );
}

#[test]
fn request_handler_delegates_remaining_steps_to_the_source() {
    let check = IpcMessage::update_step(UpdateStep::CheckForUpdate);

    let Handled::Reply(reply) = RequestHandler::new(CancelFlag::default()).handle(&check) else {
        panic!("unsupported step must be answered");
    };
    assert_eq!(reply.response, ResponseKind::Failed);
    assert_eq!(reply.first_string(), Some("Not supported"));

    let mut handler = RequestHandler::new(CancelFlag::default()).with_source(Box::new(EchoSource));
    assert_eq!(
        handler.handle(&check),
        Handled::Reply(IpcMessage::succeeded(UpdateStep::CheckForUpdate))
    );
    let Handled::Reply(reply) =
        handler.handle(&IpcMessage::update_step(UpdateStep::DownloadUpdate))
    else {
        panic!("source errors must be answered");
    };
    assert_eq!(reply.response, ResponseKind::Failed);
    assert_eq!(reply.first_string(), Some("Update step failed"));
}

#[test]
fn pipeline_events_map_to_install_progress() {
    let started = message_for_event(&PipelineEvent::StageStarted(UpdateStage::ClosingProcesses))
        .expect("stage start must be reported");
    assert_eq!(started.step, UpdateStep::Install);
    assert_eq!(started.response, ResponseKind::Progress);
    assert_eq!(started.progress, Some(0));

    let waiting = message_for_event(&PipelineEvent::WaitingForProcesses(vec![RunningProcess {
        pid: 10,
        name: "widget".to_string(),
        exe: PathBuf::from("widget"),
    }]))
    .expect("waiting must be reported");
    assert_eq!(waiting.first_string(), Some("Waiting for widget to close"));

    assert_eq!(
        message_for_event(&PipelineEvent::Finished),
        Some(IpcMessage::succeeded(UpdateStep::Install))
    );
    assert_eq!(
        message_for_event(&PipelineEvent::StageCompleted(UpdateStage::DeleteTemp)),
        None
    );
}

/// Accepts a message once `accept_after` broadcasts have gone unheard.
struct RecordingSink {
    accept_after: usize,
    calls: AtomicUsize,
    delivered: Mutex<Vec<IpcMessage>>,
}

impl RecordingSink {
    fn accepting_after(accept_after: usize) -> Self {
        Self {
            accept_after,
            calls: AtomicUsize::new(0),
            delivered: Mutex::new(Vec::new()),
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn messages(&self) -> Vec<IpcMessage> {
        self.delivered.lock().expect("must lock sink").clone()
    }
}

impl MessageSink for RecordingSink {
    fn broadcast(&self, message: &IpcMessage) -> Result<usize, TransportError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.accept_after {
            return Ok(0);
        }
        self.delivered
            .lock()
            .expect("must lock sink")
            .push(message.clone());
        Ok(1)
    }
}

fn quick_policy() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(1),
    }
}

#[test]
fn notifier_retries_until_a_peer_listens() {
    let sink = Arc::new(RecordingSink::accepting_after(2));
    let notifier = Notifier::new(sink.clone(), quick_policy());

    let attempts = notifier
        .notify(&IpcMessage::progress(UpdateStep::Install, 10, "closing"))
        .expect("third attempt must be delivered");
    assert_eq!(attempts, 3);
    assert_eq!(sink.messages().len(), 1);
}

/// Fails the first `failures` broadcasts the way a broken pipe does, then accepts.
struct FlakySink {
    failures: usize,
    calls: AtomicUsize,
}

impl MessageSink for FlakySink {
    fn broadcast(&self, _message: &IpcMessage) -> Result<usize, TransportError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.failures {
            return Err(TransportError::Io(std::io::Error::from(
                std::io::ErrorKind::BrokenPipe,
            )));
        }
        Ok(1)
    }
}

#[test]
fn notifier_retries_after_transport_errors() {
    let sink = Arc::new(FlakySink {
        failures: 2,
        calls: AtomicUsize::new(0),
    });
    let notifier = Notifier::new(sink.clone(), quick_policy());

    let attempts = notifier
        .notify(&IpcMessage::succeeded(UpdateStep::Install))
        .expect("third attempt must be delivered");
    assert_eq!(attempts, 3);
    assert_eq!(sink.calls.load(Ordering::SeqCst), 3);
}

#[test]
fn progress_degrades_to_one_attempt_while_nobody_listens() {
    let sink = Arc::new(RecordingSink::accepting_after(usize::MAX));
    let notifier = Notifier::new(sink.clone(), quick_policy());
    let progress = IpcMessage::progress(UpdateStep::Install, 10, "closing");

    let err = notifier.notify(&progress).expect_err("nobody is listening");
    assert!(matches!(err, TransportError::NotDelivered { attempts: 3 }));
    assert_eq!(sink.calls(), 3);

    let _ = notifier.notify(&progress);
    assert_eq!(sink.calls(), 4);

    let _ = notifier.notify(&IpcMessage::succeeded(UpdateStep::Install));
    assert_eq!(sink.calls(), 7);
}

fn wait_for<T>(events: &Receiver<T>, mut matches: impl FnMut(&T) -> bool) -> T {
    loop {
        let event = events
            .recv_timeout(Duration::from_secs(10))
            .expect("expected event must arrive");
        if matches(&event) {
            return event;
        }
    }
}

#[cfg(unix)]
#[test]
fn update_service_installs_on_request_and_reports_to_the_peer() {
    use upkeep_ipc::{ClientEvent, Endpoint, PipeClient, PipeServer};

    use crate::UpdateService;

    let fixture = Fixture::new("svc");
    let package = fixture.package("pkg", &[("app.exe", "app v2")], None);
    let endpoint = Endpoint::for_executable(
        fixture.config.executable_path(),
        &fixture.config.runtime_dir(),
    );
    let (server_tx, server_rx) = mpsc::channel();
    let server = Arc::new(PipeServer::start(endpoint.clone(), server_tx).expect("must start"));
    let notifier = Arc::new(Notifier::new(
        server.clone(),
        crate::retry_policy(fixture.config.notify()),
    ));

    let (client_tx, client_rx) = mpsc::channel();
    let client = PipeClient::connect(&endpoint, client_tx).expect("must connect");
    client
        .send(
            &IpcMessage::update_step(UpdateStep::RestartInfo)
                .with_string(ExtraString::plain("app.exe")),
        )
        .expect("must send restart info");
    client
        .send(&IpcMessage::update_step(UpdateStep::Install))
        .expect("must request install");

    let request = SessionRequest {
        session_id: Some("s1".to_string()),
        package_dir: Some(package),
        ..SessionRequest::default()
    };
    let service = UpdateService::new(
        Arc::clone(&server),
        fixture.session().with_notifier(notifier),
        request,
    );
    let outcome = service
        .run(server_rx)
        .expect("service must finish")
        .expect("session must have run");

    let program = fixture.config.install_dir().join("app.exe");
    assert_eq!(
        outcome,
        SessionOutcome::Installed {
            session_id: Some("s1".to_string()),
            used_catch_all: false,
            launched_after_update: Some(program),
        }
    );

    let reply = wait_for(&client_rx, |event| matches!(event, ClientEvent::Message(_)));
    assert_eq!(
        reply,
        ClientEvent::Message(IpcMessage::succeeded(UpdateStep::RestartInfo))
    );
    wait_for(&client_rx, |event| {
        event == &ClientEvent::Message(IpcMessage::succeeded(UpdateStep::Install))
    });
    drop(client);
    drop(server);
}

#[cfg(unix)]
#[test]
fn relayed_request_worker_stops_when_another_successor_relays() {
    use upkeep_ipc::{Endpoint, PipeClient, PipeServer, ServerEvent};

    use crate::answer_relayed_requests;

    let fixture = Fixture::new("relay-taken");
    let endpoint = Endpoint::for_executable(
        fixture.config.executable_path(),
        &fixture.config.runtime_dir(),
    );
    let (server_tx, server_rx) = mpsc::channel();
    let server = PipeServer::start(endpoint.clone(), server_tx).expect("must start");

    let (first_tx, _first_rx) = mpsc::channel();
    let first = PipeClient::connect(&endpoint, first_tx).expect("must connect");
    first
        .send(&IpcMessage::action(IpcAction::NewProcess))
        .expect("must announce");
    wait_for(&server_rx, |event| {
        matches!(event, ServerEvent::Message { message, .. } if message.action == IpcAction::NewProcess)
    });

    let (second_tx, second_rx) = mpsc::channel();
    let second = Arc::new(PipeClient::connect(&endpoint, second_tx).expect("must connect"));
    second
        .send(&IpcMessage::action(IpcAction::NewProcess))
        .expect("must announce");
    let worker = answer_relayed_requests(
        Arc::clone(&second),
        second_rx,
        RequestHandler::new(CancelFlag::default()),
    )
    .expect("must spawn worker");

    worker.join().expect("worker must not panic");
    assert!(!second.is_connected());
    assert!(first.is_connected());
    drop(server);
}
