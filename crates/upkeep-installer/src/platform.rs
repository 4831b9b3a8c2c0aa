//! Seams to the operating system. The pipeline only talks to these traits; `native` holds the
//! default implementations and tests substitute in-memory fakes.

use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{anyhow, Context, Result};
use upkeep_core::{FileChange, ShortcutRecord};

use crate::layout::PlatformConfig;
use crate::native::{
    CommandPatchApplier, CommandServiceController, DescriptorShortcutInstaller,
    LoggingAssemblyRegistrar, SystemProgramRunner,
};
use crate::processes::SystemProcessScanner;
use crate::registry_view::RegistryBackend;

pub trait ShortcutInstaller: Send {
    fn create(&mut self, record: &ShortcutRecord, path: &Path) -> Result<()>;
}

pub trait ServiceController: Send {
    fn is_running(&mut self, name: &str) -> Result<bool>;
    fn stop(&mut self, name: &str) -> Result<()>;
    fn start(&mut self, name: &str, arguments: &[String]) -> Result<()>;
}

/// COM registration and native-image generation for a file already in place.
pub trait AssemblyRegistrar: Send {
    fn register(&mut self, file: &Path, change: &FileChange) -> Result<()>;
    fn unregister(&mut self, file: &Path, change: &FileChange) -> Result<()>;
    fn optimize(&mut self, file: &Path, change: &FileChange) -> Result<()>;
    fn remove_optimization(&mut self, file: &Path, change: &FileChange) -> Result<()>;
}

pub trait PatchApplier: Send {
    /// Produces `output` from `base` and the binary diff in `patch`.
    fn apply(&mut self, base: &Path, patch: &Path, output: &Path) -> Result<()>;
}

pub trait ProgramRunner: Send {
    /// Starts `program`. When `wait` is set, blocks and returns the exit code.
    fn run(
        &mut self,
        program: &Path,
        arguments: Option<&str>,
        working_dir: &Path,
        wait: bool,
    ) -> Result<Option<i32>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunningProcess {
    pub pid: u32,
    pub name: String,
    pub exe: PathBuf,
}

pub trait ProcessScanner: Send {
    /// Processes whose executable lives under `dir`, minus `exclude`.
    fn running_under(&mut self, dir: &Path, exclude: &[u32]) -> Result<Vec<RunningProcess>>;
}

/// The set of collaborators one session works against.
pub struct Platform {
    pub registry: Box<dyn RegistryBackend>,
    pub shortcuts: Box<dyn ShortcutInstaller>,
    pub services: Box<dyn ServiceController>,
    pub registrar: Box<dyn AssemblyRegistrar>,
    pub patcher: Box<dyn PatchApplier>,
    pub runner: Box<dyn ProgramRunner>,
    pub processes: Box<dyn ProcessScanner>,
}

impl Platform {
    pub fn native(config: &PlatformConfig) -> Result<Self> {
        Ok(Self {
            registry: native_registry(config)?,
            shortcuts: Box::new(DescriptorShortcutInstaller),
            services: Box::new(CommandServiceController),
            registrar: Box::new(LoggingAssemblyRegistrar),
            patcher: Box::new(CommandPatchApplier::new(
                config.patch_command().map(<[String]>::to_vec),
            )),
            runner: Box::new(SystemProgramRunner),
            processes: Box::new(SystemProcessScanner::default()),
        })
    }
}

#[cfg(windows)]
fn native_registry(_config: &PlatformConfig) -> Result<Box<dyn RegistryBackend>> {
    Ok(Box::new(crate::system_registry::WindowsRegistry::default()))
}

/// Hosts without a system registry keep one in a JSON hive under the state directory.
#[cfg(not(windows))]
fn native_registry(config: &PlatformConfig) -> Result<Box<dyn RegistryBackend>> {
    Ok(Box::new(crate::registry_view::HiveRegistry::open(
        config.registry_hive(),
    )?))
}

/// Runs `command` to completion, folding its output into the error on a non-zero exit.
pub fn run_command(command: &mut Command, context_message: &str) -> Result<()> {
    let output = command
        .output()
        .with_context(|| format!("{context_message}: command failed to start"))?;
    if output.status.success() {
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    let stdout = String::from_utf8_lossy(&output.stdout);
    Err(anyhow!(
        "{context_message}: status={} stdout='{}' stderr='{}'",
        output.status,
        stdout.trim(),
        stderr.trim()
    ))
}

/// Splits a command line on whitespace, honouring double quotes.
pub fn split_command_line(line: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut pending = false;
    for ch in line.chars() {
        match ch {
            '"' => {
                in_quotes = !in_quotes;
                pending = true;
            }
            c if c.is_whitespace() && !in_quotes => {
                if pending {
                    args.push(std::mem::take(&mut current));
                    pending = false;
                }
            }
            c => {
                current.push(c);
                pending = true;
            }
        }
    }
    if pending {
        args.push(current);
    }
    args
}
