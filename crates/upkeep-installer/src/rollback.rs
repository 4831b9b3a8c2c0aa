use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;

use crate::executor::revert_registry_change;
use crate::fs_utils::{copy_dir_recursive, remove_dir_if_exists, remove_file_if_exists};
use crate::journal::{JournalEntry, RollbackJournal};
use crate::platform::Platform;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RollbackFailure {
    pub entry: String,
    pub error: String,
}

/// Outcome of a best-effort rollback.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RollbackReport {
    pub reverted: usize,
    pub failures: Vec<RollbackFailure>,
}

impl RollbackReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn merge(&mut self, other: RollbackReport) {
        self.reverted += other.reverted;
        self.failures.extend(other.failures);
    }

    pub fn record_failure(&mut self, entry: impl Into<String>, error: &anyhow::Error) {
        self.failures.push(RollbackFailure {
            entry: entry.into(),
            error: format!("{error:#}"),
        });
    }
}

/// Reverts every entry of `journal`, newest first. Failures are collected, not fatal.
pub fn replay_journal(journal: &RollbackJournal, platform: &mut Platform) -> RollbackReport {
    let mut report = RollbackReport::default();
    for entry in journal.entries().iter().rev() {
        match revert_entry(entry, platform) {
            Ok(()) => report.reverted += 1,
            Err(err) => {
                tracing::warn!(entry = %entry.describe(), error = %format!("{err:#}"), "rollback step failed");
                report.record_failure(entry.describe(), &err);
            }
        }
    }
    report
}

pub fn revert_entry(entry: &JournalEntry, platform: &mut Platform) -> Result<()> {
    match entry {
        JournalEntry::Registry(change) => {
            revert_registry_change(platform.registry.as_mut(), change)
        }
        JournalEntry::RestoreFile { target, backup }
        | JournalEntry::RestoreShortcut { target, backup } => restore_file(target, backup),
        JournalEntry::RemoveFile(path) | JournalEntry::RemoveShortcut(path) => {
            remove_file_if_exists(path)
                .with_context(|| format!("failed to remove {}", path.display()))
        }
        JournalEntry::RemoveFolder(path) => remove_dir_if_exists(path)
            .with_context(|| format!("failed to remove folder {}", path.display())),
        JournalEntry::RestoreFolder { target, backup } => {
            remove_dir_if_exists(target)
                .with_context(|| format!("failed to clear folder {}", target.display()))?;
            copy_dir_recursive(backup, target)
                .with_context(|| format!("failed to restore folder {}", target.display()))
        }
        JournalEntry::StartService(name) => platform.services.start(name, &[]),
        JournalEntry::StopService(name) => platform.services.stop(name),
        JournalEntry::UnregisterAssembly(change) => platform
            .registrar
            .unregister(Path::new(&change.relative_path), change),
        JournalEntry::RegisterAssembly(change) => platform
            .registrar
            .register(Path::new(&change.relative_path), change),
        JournalEntry::RemoveNativeImage(change) => platform
            .registrar
            .remove_optimization(Path::new(&change.relative_path), change),
    }
}

fn restore_file(target: &Path, backup: &Path) -> Result<()> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    fs::copy(backup, target)
        .with_context(|| format!("failed to restore {} from backup", target.display()))?;
    Ok(())
}
