mod completion;
mod dispatch;
mod inspect;
mod render;

use std::path::PathBuf;

use anyhow::Result;
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

use crate::completion::CliCompletionShell;

const LOG_ENV: &str = "UPKEEP_LOG";

#[derive(Parser, Debug)]
#[command(name = "upkeep")]
#[command(about = "Transactional installer and self-updating update engine", long_about = None)]
struct Cli {
    /// Configuration file; defaults to upkeep.toml next to the executable.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, global = true)]
    install_dir: Option<PathBuf>,
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,
    /// Updater identity; the IPC channel is named after it.
    #[arg(long, global = true)]
    executable: Option<PathBuf>,
    /// Running with the rights to modify the installation; skips the elevation check.
    #[arg(long, global = true)]
    elevated: bool,
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Install an extracted update package, resuming an interrupted session first.
    Apply(ApplyArgs),
    /// Continue a session as the updater a self-update just installed.
    Resume {
        #[arg(long)]
        handoff: PathBuf,
    },
    /// Show the persisted session and any pending self-update.
    Status,
    /// Decode an update details, session, handoff or journal file.
    Inspect {
        path: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Wait for an IPC peer to ask for the installation.
    Serve(SessionArgs),
    /// Send a request to a running updater and print its answers.
    Notify {
        #[command(subcommand)]
        request: NotifyRequest,
        #[arg(long, default_value_t = 30)]
        timeout_secs: u64,
    },
    /// Print the IPC channel of this installation.
    Channel,
    Completions {
        #[arg(value_enum)]
        shell: CliCompletionShell,
    },
}

#[derive(Args, Debug, Clone, Default, PartialEq, Eq)]
struct SessionArgs {
    /// Extracted update package; defaults to the session's temp directory.
    #[arg(long)]
    package: Option<PathBuf>,
    #[arg(long)]
    session_id: Option<String>,
    /// Full package to fall back to when a delta patch does not apply.
    #[arg(long)]
    catch_all: Option<PathBuf>,
    /// Program to start once installed, relative to the install directory.
    #[arg(long)]
    restart: Option<String>,
    #[arg(long, allow_hyphen_values = true)]
    restart_args: Option<String>,
    #[command(flatten)]
    self_update: SelfUpdateArgs,
}

#[derive(Args, Debug, Clone, Default, PartialEq, Eq)]
struct SelfUpdateArgs {
    /// New updater payload: a path, file:// or remote URL. Installed before the update.
    #[arg(long, requires_all = ["self_update_sha256", "self_update_exe"])]
    self_update: Option<String>,
    #[arg(long)]
    self_update_sha256: Option<String>,
    /// Updater executable inside the extracted payload.
    #[arg(long)]
    self_update_exe: Option<String>,
    #[arg(long, requires = "self_update_signature")]
    self_update_public_key: Option<String>,
    #[arg(long, requires = "self_update_public_key")]
    self_update_signature: Option<String>,
    #[arg(long)]
    automatic: bool,
}

#[derive(Args, Debug, Clone, PartialEq, Eq)]
struct ApplyArgs {
    #[command(flatten)]
    session: SessionArgs,
    /// Also report progress to IPC peers while applying.
    #[arg(long)]
    serve: bool,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
enum NotifyRequest {
    ProcessId,
    Cancel,
    Install,
    RestartInfo {
        program: Option<String>,
        #[arg(allow_hyphen_values = true)]
        arguments: Option<String>,
    },
    Step {
        #[arg(value_enum)]
        step: CliUpdateStep,
    },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum CliUpdateStep {
    CheckForUpdate,
    DownloadUpdate,
    BeginExtraction,
    ForceRecheck,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    dispatch::run_cli(cli)
}

fn init_logging(verbosity: u8) {
    let default_level = match verbosity {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };
    let filter = EnvFilter::builder()
        .with_default_directive(default_level.into())
        .with_env_var(LOG_ENV)
        .from_env_lossy();
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
