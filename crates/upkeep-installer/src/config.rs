use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

use crate::layout::{default_state_dir, NotifySettings, PlatformConfig};

pub const CONFIG_FILE_NAME: &str = "upkeep.toml";

/// On-disk `upkeep.toml`; every key is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigFile {
    pub install_dir: Option<PathBuf>,
    pub state_dir: Option<PathBuf>,
    pub shortcuts_dir: Option<PathBuf>,
    pub registry_hive: Option<PathBuf>,
    pub patch_command: Option<Vec<String>>,
    pub process_poll_interval_ms: Option<u64>,
    pub notify: NotifySection,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NotifySection {
    pub max_attempts: Option<u32>,
    pub initial_backoff_ms: Option<u64>,
    pub max_backoff_ms: Option<u64>,
}

impl ConfigFile {
    pub fn parse(raw: &str) -> Result<Self> {
        toml::from_str(raw).context("failed to parse upkeep configuration")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config: {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("invalid config file: {}", path.display()))
    }

    /// Loads `path` when it exists; a missing file yields the defaults.
    pub fn load_optional(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }
}

/// Values supplied on the command line; they win over the config file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigOverrides {
    pub config_path: Option<PathBuf>,
    pub executable_path: Option<PathBuf>,
    pub install_dir: Option<PathBuf>,
    pub state_dir: Option<PathBuf>,
    pub elevated: bool,
}

impl PlatformConfig {
    /// Resolves the configuration: CLI overrides, then `upkeep.toml`, then environment defaults.
    ///
    /// The config file is looked up next to the executable unless an explicit path is given.
    pub fn resolve(overrides: ConfigOverrides) -> Result<Self> {
        let executable_path = match overrides.executable_path {
            Some(path) => path,
            None => std::env::current_exe().context("failed to resolve current executable")?,
        };
        let exe_dir = executable_path
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| anyhow!("executable path has no parent: {}", executable_path.display()))?;

        let file = match &overrides.config_path {
            Some(path) => ConfigFile::load(path)?,
            None => ConfigFile::load_optional(&exe_dir.join(CONFIG_FILE_NAME))?,
        };

        let install_dir = overrides
            .install_dir
            .or(file.install_dir.clone())
            .unwrap_or(exe_dir);
        let state_dir = match overrides.state_dir.or(file.state_dir.clone()) {
            Some(dir) => dir,
            None => default_state_dir()?.join(instance_key(&install_dir)),
        };

        Ok(Self::from_parts(install_dir, state_dir, executable_path, &file)
            .with_elevated(overrides.elevated))
    }

    pub fn from_parts(
        install_dir: PathBuf,
        state_dir: PathBuf,
        executable_path: PathBuf,
        file: &ConfigFile,
    ) -> Self {
        let mut config = Self::new(install_dir, state_dir, executable_path)
            .with_patch_command(file.patch_command.clone());
        if let Some(dir) = &file.shortcuts_dir {
            config = config.with_shortcuts_dir(dir);
        }
        if let Some(path) = &file.registry_hive {
            config = config.with_registry_hive(path);
        }
        if let Some(ms) = file.process_poll_interval_ms {
            config = config.with_process_poll_interval(Duration::from_millis(ms));
        }

        let defaults = NotifySettings::default();
        config.with_notify(NotifySettings {
            max_attempts: file.notify.max_attempts.unwrap_or(defaults.max_attempts),
            initial_backoff: file
                .notify
                .initial_backoff_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.initial_backoff),
            max_backoff: file
                .notify
                .max_backoff_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.max_backoff),
        })
    }
}

/// Short stable key separating the state of independent installations.
pub fn instance_key(install_dir: &Path) -> String {
    let normalized = install_dir.to_string_lossy().to_lowercase();
    upkeep_security::sha256_hex(normalized.as_bytes())[..16].to_string()
}
