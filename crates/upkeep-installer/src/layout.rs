use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};

/// Default poll period while waiting for processes to exit.
pub const DEFAULT_PROCESS_POLL: Duration = Duration::from_millis(500);

/// Retry budget for progress/success/failure notifications sent over the pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotifySettings {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for NotifySettings {
    fn default() -> Self {
        Self {
            max_attempts: 60,
            initial_backoff: Duration::from_millis(25),
            max_backoff: Duration::from_secs(1),
        }
    }
}

/// Every path and knob the engine needs, resolved once at start-up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformConfig {
    install_dir: PathBuf,
    state_dir: PathBuf,
    executable_path: PathBuf,
    shortcuts_dir: PathBuf,
    registry_hive: PathBuf,
    patch_command: Option<Vec<String>>,
    process_poll_interval: Duration,
    notify: NotifySettings,
    elevated: bool,
}

impl PlatformConfig {
    pub fn new(
        install_dir: impl Into<PathBuf>,
        state_dir: impl Into<PathBuf>,
        executable_path: impl Into<PathBuf>,
    ) -> Self {
        let state_dir = state_dir.into();
        Self {
            install_dir: install_dir.into(),
            shortcuts_dir: state_dir.join("shortcuts"),
            registry_hive: state_dir.join("registry.json"),
            state_dir,
            executable_path: executable_path.into(),
            patch_command: None,
            process_poll_interval: DEFAULT_PROCESS_POLL,
            notify: NotifySettings::default(),
            elevated: false,
        }
    }

    pub fn with_shortcuts_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.shortcuts_dir = dir.into();
        self
    }

    pub fn with_registry_hive(mut self, path: impl Into<PathBuf>) -> Self {
        self.registry_hive = path.into();
        self
    }

    pub fn with_patch_command(mut self, command: Option<Vec<String>>) -> Self {
        self.patch_command = command;
        self
    }

    pub fn with_process_poll_interval(mut self, interval: Duration) -> Self {
        self.process_poll_interval = interval;
        self
    }

    pub fn with_notify(mut self, notify: NotifySettings) -> Self {
        self.notify = notify;
        self
    }

    /// Marks this process as the elevated instance.
    pub fn with_elevated(mut self, elevated: bool) -> Self {
        self.elevated = elevated;
        self
    }

    pub fn install_dir(&self) -> &Path {
        &self.install_dir
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    pub fn executable_path(&self) -> &Path {
        &self.executable_path
    }

    pub fn shortcuts_dir(&self) -> &Path {
        &self.shortcuts_dir
    }

    pub fn registry_hive(&self) -> &Path {
        &self.registry_hive
    }

    pub fn patch_command(&self) -> Option<&[String]> {
        self.patch_command.as_deref()
    }

    pub fn process_poll_interval(&self) -> Duration {
        self.process_poll_interval
    }

    pub fn notify(&self) -> NotifySettings {
        self.notify
    }

    pub fn is_elevated(&self) -> bool {
        self.elevated
    }

    pub fn session_state_path(&self) -> PathBuf {
        self.state_dir.join("autoupdate")
    }

    pub fn handoff_path(&self) -> PathBuf {
        self.state_dir.join("selfupdate")
    }

    pub fn runtime_dir(&self) -> PathBuf {
        self.state_dir.join("run")
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.state_dir.join("tmp")
    }

    pub fn session_temp_dir(&self, session_id: &str) -> PathBuf {
        self.tmp_dir().join(session_id)
    }

    pub fn client_manifest_path(&self) -> PathBuf {
        self.install_dir.join(CLIENT_MANIFEST_FILE)
    }

    pub fn ensure_base_dirs(&self) -> Result<()> {
        for dir in [self.state_dir.clone(), self.runtime_dir(), self.tmp_dir()] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(())
    }
}

pub const CLIENT_MANIFEST_FILE: &str = "client.manifest";
pub const UPDATE_DETAILS_FILE: &str = "updtdetails.udt";

/// Paths inside an extracted update package (the session temp directory).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageLayout {
    root: PathBuf,
}

impl PackageLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Files copied verbatim into the install directory.
    pub fn payload_dir(&self) -> PathBuf {
        self.root.join("base")
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.root.join("backup")
    }

    pub fn journal_dir(&self) -> PathBuf {
        self.root.join("journal")
    }

    pub fn details_path(&self) -> PathBuf {
        self.root.join(UPDATE_DETAILS_FILE)
    }

    pub fn client_manifest_path(&self) -> PathBuf {
        self.root.join(CLIENT_MANIFEST_FILE)
    }

    pub fn patch_path(&self, relative: &str) -> PathBuf {
        upkeep_core::join_relative(&self.root, relative)
    }
}

pub fn default_state_dir() -> Result<PathBuf> {
    if cfg!(windows) {
        let app_data = std::env::var("LOCALAPPDATA")
            .context("LOCALAPPDATA is not set; cannot resolve Windows state directory")?;
        return Ok(PathBuf::from(app_data).join("Upkeep"));
    }

    let home = std::env::var("HOME").context("HOME is not set; cannot resolve state directory")?;
    Ok(PathBuf::from(home).join(".upkeep"))
}
