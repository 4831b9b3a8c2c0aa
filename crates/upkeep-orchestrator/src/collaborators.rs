use std::fs;
use std::path::Path;
use std::process::Command;

use anyhow::{bail, Context, Result};
use upkeep_installer::{copy_dir_recursive, run_command};
use upkeep_ipc::{IpcMessage, UpdateStep};

pub trait Downloader: Send {
    /// Fetches `source` into `destination`. `progress` receives percentages as they become known.
    fn download(&mut self, source: &str, destination: &Path, progress: &mut dyn FnMut(u8))
        -> Result<()>;
}

pub trait Extractor: Send {
    fn extract(&mut self, archive: &Path, destination: &Path) -> Result<()>;
}

pub trait Launcher: Send {
    /// Starts `program` detached and returns its process id.
    fn launch(&mut self, program: &Path, arguments: &[String], working_dir: &Path) -> Result<u32>;
}

/// Answers the update steps this engine does not own: checking for, downloading and extracting
/// the main update.
pub trait UpdateSource: Send {
    fn handle(&mut self, step: UpdateStep, request: &IpcMessage) -> Result<IpcMessage>;
}

/// Copies local paths and `file://` URLs; anything else goes through `curl`/`wget`, or
/// PowerShell on Windows.
pub struct CommandDownloader;

impl Downloader for CommandDownloader {
    fn download(
        &mut self,
        source: &str,
        destination: &Path,
        progress: &mut dyn FnMut(u8),
    ) -> Result<()> {
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create download dir: {}", parent.display()))?;
        }

        let part_path = destination.with_extension("part");
        let result = match local_source(source) {
            Some(path) => fs::copy(path, &part_path)
                .map(|_| ())
                .with_context(|| format!("failed to copy {}", path.display())),
            None if cfg!(windows) => download_with_powershell(source, &part_path),
            None => download_with_curl(source, &part_path)
                .or_else(|_| download_with_wget(source, &part_path)),
        };
        if let Err(err) = result {
            let _ = fs::remove_file(&part_path);
            return Err(err);
        }

        fs::rename(&part_path, destination).with_context(|| {
            format!(
                "failed to move download into place: {}",
                destination.display()
            )
        })?;
        progress(100);
        Ok(())
    }
}

fn local_source(source: &str) -> Option<&Path> {
    if let Some(path) = source.strip_prefix("file://") {
        return Some(Path::new(path));
    }
    if source.contains("://") {
        return None;
    }
    Some(Path::new(source))
}

fn download_with_curl(url: &str, out_path: &Path) -> Result<()> {
    let mut command = Command::new("curl");
    command
        .arg("-fL")
        .arg("--retry")
        .arg("2")
        .arg("-o")
        .arg(out_path)
        .arg(url);
    run_command(&mut command, "curl download failed")
}

fn download_with_wget(url: &str, out_path: &Path) -> Result<()> {
    let mut command = Command::new("wget");
    command.arg("-O").arg(out_path).arg(url);
    run_command(&mut command, "wget download failed")
}

fn download_with_powershell(url: &str, out_path: &Path) -> Result<()> {
    let mut command = Command::new("powershell");
    command.arg("-NoProfile").arg("-Command").arg(format!(
        "Invoke-WebRequest -Uri '{}' -OutFile '{}'",
        escape_ps_single_quote(url),
        escape_ps_single_quote(&out_path.to_string_lossy())
    ));
    run_command(&mut command, "powershell download failed")
}

fn escape_ps_single_quote(value: &str) -> String {
    value.replace('\'', "''")
}

/// Directories are copied as-is; `.zip` archives go through `unzip` (PowerShell on Windows),
/// everything else through `tar`.
pub struct CommandExtractor;

impl Extractor for CommandExtractor {
    fn extract(&mut self, archive: &Path, destination: &Path) -> Result<()> {
        fs::create_dir_all(destination)
            .with_context(|| format!("failed to create {}", destination.display()))?;
        if archive.is_dir() {
            return copy_dir_recursive(archive, destination).with_context(|| {
                format!(
                    "failed to copy {} into {}",
                    archive.display(),
                    destination.display()
                )
            });
        }

        let is_zip = archive
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("zip"));
        if is_zip && cfg!(windows) {
            let mut command = Command::new("powershell");
            command.arg("-NoProfile").arg("-Command").arg(format!(
                "Expand-Archive -LiteralPath '{}' -DestinationPath '{}' -Force",
                escape_ps_single_quote(&archive.to_string_lossy()),
                escape_ps_single_quote(&destination.to_string_lossy())
            ));
            return run_command(&mut command, "failed to extract zip archive with powershell");
        }
        if is_zip {
            let mut command = Command::new("unzip");
            command.arg("-q").arg(archive).arg("-d").arg(destination);
            return run_command(&mut command, "failed to extract zip archive with unzip");
        }
        run_command(
            Command::new("tar")
                .arg("-xf")
                .arg(archive)
                .arg("-C")
                .arg(destination),
            "failed to extract tar archive",
        )
    }
}

pub struct ProcessLauncher;

impl Launcher for ProcessLauncher {
    fn launch(&mut self, program: &Path, arguments: &[String], working_dir: &Path) -> Result<u32> {
        if !program.is_file() {
            bail!("cannot launch missing program {}", program.display());
        }
        let child = Command::new(program)
            .args(arguments)
            .current_dir(working_dir)
            .spawn()
            .with_context(|| format!("failed to launch {}", program.display()))?;
        Ok(child.id())
    }
}

/// The self-update collaborators one updater process works with.
pub struct SelfUpdateTools {
    pub downloader: Box<dyn Downloader>,
    pub extractor: Box<dyn Extractor>,
    pub launcher: Box<dyn Launcher>,
}

impl SelfUpdateTools {
    pub fn native() -> Self {
        Self {
            downloader: Box::new(CommandDownloader),
            extractor: Box::new(CommandExtractor),
            launcher: Box::new(ProcessLauncher),
        }
    }
}
