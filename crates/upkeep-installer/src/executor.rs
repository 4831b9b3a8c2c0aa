//! Forward execution of change records. Each mutation journals its inverse first.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use upkeep_core::{RegistryChange, RegistryOperation, RegistryValue};

use crate::fs_utils::{
    copy_dir_recursive, first_missing_dir, remove_dir_if_exists, remove_file_if_exists,
};
use crate::journal::{JournalEntry, RollbackJournal};
use crate::registry_view::{RegistryBackend, RegistryBitness, RegistryView};

/// Applies `change`, journaling its inverse before each mutation.
pub fn apply_registry_change(
    backend: &mut dyn RegistryBackend,
    change: &RegistryChange,
    journal: &mut RollbackJournal,
) -> Result<()> {
    execute(backend, change, Some(journal))
        .with_context(|| format!("failed to apply registry change {}", change.display_path()))?;
    backend.persist()
}

/// Applies an inverse entry during rollback; nothing is journaled.
pub fn revert_registry_change(
    backend: &mut dyn RegistryBackend,
    change: &RegistryChange,
) -> Result<()> {
    execute(backend, change, None)
        .with_context(|| format!("failed to revert registry change {}", change.display_path()))?;
    backend.persist()
}

fn execute(
    backend: &mut dyn RegistryBackend,
    change: &RegistryChange,
    mut journal: Option<&mut RollbackJournal>,
) -> Result<()> {
    let view = backend.view(RegistryBitness::for_change(change));
    let name = change.value_name.as_deref();
    match change.operation {
        RegistryOperation::CreateValue => {
            ensure_key(view, change, journal.as_deref_mut())?;
            if let Some(journal) = journal {
                let inverse = match view.get_value(change.root, &change.sub_key, name)? {
                    Some(previous) => change.derive(
                        RegistryOperation::CreateValue,
                        change.sub_key.clone(),
                        change.value_name.clone(),
                        previous,
                    ),
                    None => change.derive(
                        RegistryOperation::RemoveValue,
                        change.sub_key.clone(),
                        change.value_name.clone(),
                        RegistryValue::None,
                    ),
                };
                journal.append(JournalEntry::Registry(inverse))?;
            }
            view.set_value(change.root, &change.sub_key, name, &change.value)
        }
        RegistryOperation::RemoveValue => {
            let Some(previous) = view.get_value(change.root, &change.sub_key, name)? else {
                tracing::debug!(path = %change.display_path(), "value already absent");
                return Ok(());
            };
            if let Some(journal) = journal {
                journal.append(JournalEntry::Registry(change.derive(
                    RegistryOperation::CreateValue,
                    change.sub_key.clone(),
                    change.value_name.clone(),
                    previous,
                )))?;
            }
            view.delete_value(change.root, &change.sub_key, name)?;
            Ok(())
        }
        RegistryOperation::CreateKey => ensure_key(view, change, journal),
        RegistryOperation::RemoveKey => {
            if change.key_segments().is_empty() {
                bail!("refusing to remove registry root {}", change.root.as_str());
            }
            if !view.open_key(change.root, &change.sub_key)? {
                tracing::debug!(path = %change.display_path(), "key already absent");
                return Ok(());
            }
            if let Some(journal) = journal {
                journal_key_tree(&*view, change, &change.sub_key, journal)?;
            }
            view.delete_key(change.root, &change.sub_key)
        }
    }
}

/// Creates the change's key. Only the outermost missing segment is journaled, so rollback
/// removes exactly the subtree this session created.
fn ensure_key(
    view: &mut dyn RegistryView,
    change: &RegistryChange,
    journal: Option<&mut RollbackJournal>,
) -> Result<()> {
    let segments = change.key_segments();
    for depth in 1..=segments.len() {
        let prefix = segments[..depth].join("\\");
        if view.open_key(change.root, &prefix)? {
            continue;
        }
        if let Some(journal) = journal {
            journal.append(JournalEntry::Registry(change.derive(
                RegistryOperation::RemoveKey,
                prefix,
                None,
                RegistryValue::None,
            )))?;
        }
        return view.create_key(change.root, &change.sub_key);
    }
    Ok(())
}

// Deepest entries are journaled first so reverse replay recreates parents before children.
fn journal_key_tree(
    view: &dyn RegistryView,
    change: &RegistryChange,
    path: &str,
    journal: &mut RollbackJournal,
) -> Result<()> {
    let listing = view.enumerate(change.root, path)?;
    for subkey in &listing.subkeys {
        journal_key_tree(view, change, &format!("{path}\\{subkey}"), journal)?;
    }
    for (name, value) in listing.values {
        if value.is_none() {
            continue;
        }
        journal.append(JournalEntry::Registry(change.derive(
            RegistryOperation::CreateValue,
            path,
            name,
            value,
        )))?;
    }
    journal.append(JournalEntry::Registry(change.derive(
        RegistryOperation::CreateKey,
        path,
        None,
        RegistryValue::None,
    )))
}

/// Journaled file-system mutations for one stage. Backups land in numbered slots under
/// `backup_root`.
pub struct FileTransaction<'a> {
    journal: &'a mut RollbackJournal,
    backup_root: PathBuf,
}

impl<'a> FileTransaction<'a> {
    pub fn new(journal: &'a mut RollbackJournal, backup_root: impl Into<PathBuf>) -> Self {
        Self {
            journal,
            backup_root: backup_root.into(),
        }
    }

    pub fn journal(&mut self) -> &mut RollbackJournal {
        &mut *self.journal
    }

    fn backup_slot(&self) -> Result<PathBuf> {
        let slot = self.backup_root.join(format!("{:05}", self.journal.len()));
        let cleared = if slot.is_dir() {
            remove_dir_if_exists(&slot)
        } else {
            remove_file_if_exists(&slot)
        };
        cleared.with_context(|| format!("failed to clear backup slot {}", slot.display()))?;
        fs::create_dir_all(&self.backup_root)
            .with_context(|| format!("failed to create {}", self.backup_root.display()))?;
        Ok(slot)
    }

    // A target already restored or removed by this journal keeps its first backup.
    fn covers(&self, target: &Path) -> bool {
        self.journal.entries().iter().any(|entry| match entry {
            JournalEntry::RestoreFile { target: covered, .. }
            | JournalEntry::RestoreShortcut { target: covered, .. }
            | JournalEntry::RestoreFolder { target: covered, .. }
            | JournalEntry::RemoveFile(covered)
            | JournalEntry::RemoveShortcut(covered) => covered == target,
            JournalEntry::RemoveFolder(folder) => target.starts_with(folder),
            _ => false,
        })
    }

    /// Creates `dir`, journaling the outermost directory that did not exist.
    pub fn ensure_dir(&mut self, dir: &Path) -> Result<()> {
        let Some(missing) = first_missing_dir(dir) else {
            return Ok(());
        };
        self.journal.append(JournalEntry::RemoveFolder(missing))?;
        fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))
    }

    /// Journals whatever undoes a subsequent write to `target`.
    pub fn prepare_write(&mut self, target: &Path) -> Result<()> {
        if self.covers(target) {
            return Ok(());
        }
        if target.is_file() {
            let backup = self.backup_slot()?;
            fs::copy(target, &backup)
                .with_context(|| format!("failed to back up {}", target.display()))?;
            return self.journal.append(JournalEntry::RestoreFile {
                target: target.to_path_buf(),
                backup,
            });
        }
        if let Some(parent) = target.parent() {
            self.ensure_dir(parent)?;
        }
        self.journal
            .append(JournalEntry::RemoveFile(target.to_path_buf()))
    }

    pub fn copy_file(&mut self, source: &Path, target: &Path) -> Result<()> {
        self.prepare_write(target)?;
        fs::copy(source, target).with_context(|| {
            format!(
                "failed to copy {} to {}",
                source.display(),
                target.display()
            )
        })?;
        Ok(())
    }

    /// Returns false when there was nothing to delete.
    pub fn delete_file(&mut self, target: &Path) -> Result<bool> {
        if !target.is_file() {
            return Ok(false);
        }
        self.prepare_write(target)?;
        fs::remove_file(target)
            .with_context(|| format!("failed to delete {}", target.display()))?;
        Ok(true)
    }

    pub fn delete_folder(&mut self, target: &Path) -> Result<bool> {
        if !target.is_dir() {
            return Ok(false);
        }
        if !self.covers(target) {
            let backup = self.backup_slot()?;
            copy_dir_recursive(target, &backup)
                .with_context(|| format!("failed to back up {}", target.display()))?;
            self.journal.append(JournalEntry::RestoreFolder {
                target: target.to_path_buf(),
                backup,
            })?;
        }
        fs::remove_dir_all(target)
            .with_context(|| format!("failed to delete {}", target.display()))?;
        Ok(true)
    }

    /// Journals the undo for creating or replacing the shortcut at `path`.
    pub fn prepare_shortcut(&mut self, path: &Path) -> Result<()> {
        if self.covers(path) {
            return Ok(());
        }
        if path.is_file() {
            let backup = self.backup_slot()?;
            fs::copy(path, &backup)
                .with_context(|| format!("failed to back up shortcut {}", path.display()))?;
            return self.journal.append(JournalEntry::RestoreShortcut {
                target: path.to_path_buf(),
                backup,
            });
        }
        if let Some(parent) = path.parent() {
            self.ensure_dir(parent)?;
        }
        self.journal
            .append(JournalEntry::RemoveShortcut(path.to_path_buf()))
    }

    pub fn remove_shortcut(&mut self, path: &Path) -> Result<bool> {
        if !path.is_file() {
            return Ok(false);
        }
        self.prepare_shortcut(path)?;
        fs::remove_file(path)
            .with_context(|| format!("failed to remove shortcut {}", path.display()))?;
        Ok(true)
    }
}
