use std::fs;
use std::path::Path;
use std::process::Command;

use anyhow::{anyhow, Context, Result};
use upkeep_core::tlv::TlvRecord;
use upkeep_core::{FileChange, ShortcutRecord};

use crate::platform::{
    run_command, split_command_line, AssemblyRegistrar, PatchApplier, ProgramRunner,
    ServiceController, ShortcutInstaller,
};

/// Writes the shortcut as an encoded `ShortcutRecord` descriptor file.
pub struct DescriptorShortcutInstaller;

impl ShortcutInstaller for DescriptorShortcutInstaller {
    fn create(&mut self, record: &ShortcutRecord, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        fs::write(path, record.encode())
            .with_context(|| format!("failed to write shortcut: {}", path.display()))
    }
}

/// Drives `sc.exe` on Windows and `systemctl` elsewhere.
pub struct CommandServiceController;

impl ServiceController for CommandServiceController {
    fn is_running(&mut self, name: &str) -> Result<bool> {
        if cfg!(windows) {
            let output = Command::new("sc.exe")
                .args(["query", name])
                .output()
                .with_context(|| format!("failed to query service {name}"))?;
            return Ok(String::from_utf8_lossy(&output.stdout).contains("RUNNING"));
        }
        let status = Command::new("systemctl")
            .args(["is-active", "--quiet", name])
            .status()
            .with_context(|| format!("failed to query service {name}"))?;
        Ok(status.success())
    }

    fn stop(&mut self, name: &str) -> Result<()> {
        let mut command = if cfg!(windows) {
            let mut command = Command::new("sc.exe");
            command.args(["stop", name]);
            command
        } else {
            let mut command = Command::new("systemctl");
            command.args(["stop", name]);
            command
        };
        run_command(&mut command, &format!("failed to stop service {name}"))
    }

    fn start(&mut self, name: &str, arguments: &[String]) -> Result<()> {
        let mut command = if cfg!(windows) {
            let mut command = Command::new("sc.exe");
            command.args(["start", name]).args(arguments);
            command
        } else {
            if !arguments.is_empty() {
                tracing::warn!(service = name, "systemctl ignores service start arguments");
            }
            let mut command = Command::new("systemctl");
            command.args(["start", name]);
            command
        };
        run_command(&mut command, &format!("failed to start service {name}"))
    }
}

/// Logs registration requests without touching the system. Embedders that need real COM or
/// native-image registration supply their own `AssemblyRegistrar`.
pub struct LoggingAssemblyRegistrar;

impl AssemblyRegistrar for LoggingAssemblyRegistrar {
    fn register(&mut self, file: &Path, change: &FileChange) -> Result<()> {
        tracing::info!(file = %file.display(), flags = change.com_registration.bits(), "register");
        Ok(())
    }

    fn unregister(&mut self, file: &Path, change: &FileChange) -> Result<()> {
        tracing::info!(file = %file.display(), flags = change.com_registration.bits(), "unregister");
        Ok(())
    }

    fn optimize(&mut self, file: &Path, change: &FileChange) -> Result<()> {
        tracing::info!(file = %file.display(), arch = ?change.cpu_arch, "optimize");
        Ok(())
    }

    fn remove_optimization(&mut self, file: &Path, change: &FileChange) -> Result<()> {
        tracing::info!(file = %file.display(), arch = ?change.cpu_arch, "remove optimization");
        Ok(())
    }
}

/// Runs an external diff tool. `{base}`, `{patch}` and `{output}` in the configured argv are
/// replaced by the respective paths.
pub struct CommandPatchApplier {
    command: Option<Vec<String>>,
}

impl CommandPatchApplier {
    pub fn new(command: Option<Vec<String>>) -> Self {
        Self { command }
    }
}

impl PatchApplier for CommandPatchApplier {
    fn apply(&mut self, base: &Path, patch: &Path, output: &Path) -> Result<()> {
        let argv = self
            .command
            .as_ref()
            .filter(|argv| !argv.is_empty())
            .ok_or_else(|| anyhow!("no patch command configured; cannot apply {}", patch.display()))?;
        let expanded = argv
            .iter()
            .map(|arg| {
                arg.replace("{base}", &base.to_string_lossy())
                    .replace("{patch}", &patch.to_string_lossy())
                    .replace("{output}", &output.to_string_lossy())
            })
            .collect::<Vec<_>>();
        let mut command = Command::new(&expanded[0]);
        command.args(&expanded[1..]);
        run_command(
            &mut command,
            &format!("failed to apply patch {}", patch.display()),
        )
    }
}

pub struct SystemProgramRunner;

impl ProgramRunner for SystemProgramRunner {
    fn run(
        &mut self,
        program: &Path,
        arguments: Option<&str>,
        working_dir: &Path,
        wait: bool,
    ) -> Result<Option<i32>> {
        let mut command = Command::new(program);
        command.current_dir(working_dir);
        if let Some(arguments) = arguments {
            command.args(split_command_line(arguments));
        }
        if !wait {
            command
                .spawn()
                .with_context(|| format!("failed to start {}", program.display()))?;
            return Ok(None);
        }
        let status = command
            .status()
            .with_context(|| format!("failed to run {}", program.display()))?;
        Ok(status.code())
    }
}
