use std::path::PathBuf;

use thiserror::Error;

/// A delta patch produced a file whose checksum is not the expected one.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("patched file {} failed verification: {reason}", file.display())]
pub struct PatchApplicationError {
    pub file: PathBuf,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryAccessKind {
    MissingKey,
    PermissionDenied,
    Storage,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("registry access failed for {path}: {reason}")]
pub struct RegistryAccessError {
    pub kind: RegistryAccessKind,
    pub path: String,
    pub reason: String,
}

impl RegistryAccessError {
    pub fn missing_key(path: impl Into<String>) -> Self {
        Self {
            kind: RegistryAccessKind::MissingKey,
            path: path.into(),
            reason: "key does not exist".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("elevation required: {reason}")]
pub struct ElevationRequiredError {
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Error)]
#[error("update cancelled")]
pub struct CancelledError;

/// True when `err` (or anything in its context chain) is a `T`.
pub fn is_caused_by<T>(err: &anyhow::Error) -> bool
where
    T: std::error::Error + Send + Sync + 'static,
{
    err.chain().any(|cause| cause.is::<T>())
}
