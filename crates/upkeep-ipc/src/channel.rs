use std::path::{Path, PathBuf};

pub const PIPE_PREFIX: &str = r"\\.\pipe\";
const MAX_CHANNEL_SUFFIX: usize = 246;

/// Pipe name shared by every process updating the executable at `exe`: the lower-cased path
/// without backslashes, keeping its last 246 characters.
pub fn channel_name(exe: &Path) -> String {
    let flattened = exe
        .to_string_lossy()
        .to_lowercase()
        .chars()
        .filter(|ch| *ch != '\\')
        .collect::<Vec<_>>();
    let start = flattened.len().saturating_sub(MAX_CHANNEL_SUFFIX);
    let suffix = flattened[start..].iter().collect::<String>();
    format!("{PIPE_PREFIX}{suffix}")
}

/// Where a channel is reachable on this platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    channel: String,
    address: PathBuf,
}

impl Endpoint {
    /// On Windows the address is the pipe name itself. Elsewhere it is a socket in
    /// `runtime_dir` named by a digest of the channel, which keeps it under `sun_path` limits.
    pub fn new(channel: impl Into<String>, runtime_dir: &Path) -> Self {
        let channel = channel.into();
        let address = if cfg!(windows) {
            PathBuf::from(&channel)
        } else {
            let digest = upkeep_security::sha256_hex(channel.as_bytes());
            runtime_dir.join(format!("{}.sock", &digest[..32]))
        };
        Self { channel, address }
    }

    pub fn for_executable(exe: &Path, runtime_dir: &Path) -> Self {
        Self::new(channel_name(exe), runtime_dir)
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn address(&self) -> &Path {
        &self.address
    }
}
