//! Append-only rollback journal.
//!
//! Every forward mutation first appends its inverse here and syncs the file, so a crash at any
//! point leaves enough on disk to undo what already happened. Layout: `IURBJV1`, a phase field,
//! then one field per entry with no end marker, so appends never rewrite earlier bytes.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use upkeep_core::tlv::{read_fields, FieldReader, FieldWriter, TlvRecord, TlvResult};
use upkeep_core::{FileChange, RegistryChange};

pub const JOURNAL_MAGIC: &[u8] = b"IURBJV1";

const TAG_PHASE: u8 = 0x01;
const TAG_REGISTRY: u8 = 0x10;
const TAG_RESTORE_FILE: u8 = 0x11;
const TAG_REMOVE_FILE: u8 = 0x12;
const TAG_REMOVE_FOLDER: u8 = 0x13;
const TAG_RESTORE_FOLDER: u8 = 0x14;
const TAG_REMOVE_SHORTCUT: u8 = 0x15;
const TAG_RESTORE_SHORTCUT: u8 = 0x16;
const TAG_START_SERVICE: u8 = 0x17;
const TAG_STOP_SERVICE: u8 = 0x18;
const TAG_UNREGISTER_ASSEMBLY: u8 = 0x19;
const TAG_REGISTER_ASSEMBLY: u8 = 0x1A;
const TAG_REMOVE_NATIVE_IMAGE: u8 = 0x1B;

const TAG_PAIR_TARGET: u8 = 0x01;
const TAG_PAIR_BACKUP: u8 = 0x02;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JournalPhase {
    Files,
    Registry,
}

impl JournalPhase {
    fn code(self) -> i32 {
        match self {
            Self::Files => 0,
            Self::Registry => 1,
        }
    }

    fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::Files),
            1 => Some(Self::Registry),
            _ => None,
        }
    }
}

/// One inverse action. Paths are absolute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JournalEntry {
    Registry(RegistryChange),
    RestoreFile { target: PathBuf, backup: PathBuf },
    RemoveFile(PathBuf),
    RemoveFolder(PathBuf),
    RestoreFolder { target: PathBuf, backup: PathBuf },
    RemoveShortcut(PathBuf),
    RestoreShortcut { target: PathBuf, backup: PathBuf },
    StartService(String),
    StopService(String),
    /// `relative_path` of the carried change holds the absolute file path.
    UnregisterAssembly(FileChange),
    RegisterAssembly(FileChange),
    RemoveNativeImage(FileChange),
}

impl JournalEntry {
    pub fn describe(&self) -> String {
        match self {
            Self::Registry(change) => {
                format!("registry {:?} {}", change.operation, change.display_path())
            }
            Self::RestoreFile { target, .. } => format!("restore file {}", target.display()),
            Self::RemoveFile(path) => format!("remove file {}", path.display()),
            Self::RemoveFolder(path) => format!("remove folder {}", path.display()),
            Self::RestoreFolder { target, .. } => format!("restore folder {}", target.display()),
            Self::RemoveShortcut(path) => format!("remove shortcut {}", path.display()),
            Self::RestoreShortcut { target, .. } => {
                format!("restore shortcut {}", target.display())
            }
            Self::StartService(name) => format!("start service {name}"),
            Self::StopService(name) => format!("stop service {name}"),
            Self::UnregisterAssembly(change) => format!("unregister {}", change.relative_path),
            Self::RegisterAssembly(change) => format!("re-register {}", change.relative_path),
            Self::RemoveNativeImage(change) => {
                format!("remove native image {}", change.relative_path)
            }
        }
    }

    fn write(&self, out: &mut FieldWriter) {
        match self {
            Self::Registry(change) => change.write_nested(TAG_REGISTRY, out),
            Self::RestoreFile { target, backup } => {
                PathPair::new(target, backup).write_nested(TAG_RESTORE_FILE, out)
            }
            Self::RemoveFile(path) => out.string(TAG_REMOVE_FILE, &path.to_string_lossy()),
            Self::RemoveFolder(path) => out.string(TAG_REMOVE_FOLDER, &path.to_string_lossy()),
            Self::RestoreFolder { target, backup } => {
                PathPair::new(target, backup).write_nested(TAG_RESTORE_FOLDER, out)
            }
            Self::RemoveShortcut(path) => {
                out.string(TAG_REMOVE_SHORTCUT, &path.to_string_lossy())
            }
            Self::RestoreShortcut { target, backup } => {
                PathPair::new(target, backup).write_nested(TAG_RESTORE_SHORTCUT, out)
            }
            Self::StartService(name) => out.string(TAG_START_SERVICE, name),
            Self::StopService(name) => out.string(TAG_STOP_SERVICE, name),
            Self::UnregisterAssembly(change) => change.write_nested(TAG_UNREGISTER_ASSEMBLY, out),
            Self::RegisterAssembly(change) => change.write_nested(TAG_REGISTER_ASSEMBLY, out),
            Self::RemoveNativeImage(change) => change.write_nested(TAG_REMOVE_NATIVE_IMAGE, out),
        }
    }

    fn read(tag: u8, r: &mut FieldReader<'_>) -> TlvResult<Option<Self>> {
        let path = |r: &mut FieldReader<'_>| r.read_string().map(PathBuf::from);
        let entry = match tag {
            TAG_REGISTRY => Self::Registry(RegistryChange::read_nested(r)?),
            TAG_RESTORE_FILE => {
                let pair = PathPair::read_nested(r)?;
                Self::RestoreFile {
                    target: pair.target,
                    backup: pair.backup,
                }
            }
            TAG_REMOVE_FILE => Self::RemoveFile(path(r)?),
            TAG_REMOVE_FOLDER => Self::RemoveFolder(path(r)?),
            TAG_RESTORE_FOLDER => {
                let pair = PathPair::read_nested(r)?;
                Self::RestoreFolder {
                    target: pair.target,
                    backup: pair.backup,
                }
            }
            TAG_REMOVE_SHORTCUT => Self::RemoveShortcut(path(r)?),
            TAG_RESTORE_SHORTCUT => {
                let pair = PathPair::read_nested(r)?;
                Self::RestoreShortcut {
                    target: pair.target,
                    backup: pair.backup,
                }
            }
            TAG_START_SERVICE => Self::StartService(r.read_string()?),
            TAG_STOP_SERVICE => Self::StopService(r.read_string()?),
            TAG_UNREGISTER_ASSEMBLY => Self::UnregisterAssembly(FileChange::read_nested(r)?),
            TAG_REGISTER_ASSEMBLY => Self::RegisterAssembly(FileChange::read_nested(r)?),
            TAG_REMOVE_NATIVE_IMAGE => Self::RemoveNativeImage(FileChange::read_nested(r)?),
            _ => return Ok(None),
        };
        Ok(Some(entry))
    }
}

#[derive(Debug, Default)]
struct PathPair {
    target: PathBuf,
    backup: PathBuf,
}

impl PathPair {
    fn new(target: &Path, backup: &Path) -> Self {
        Self {
            target: target.to_path_buf(),
            backup: backup.to_path_buf(),
        }
    }
}

impl TlvRecord for PathPair {
    const START: u8 = 0x8C;
    const END: u8 = 0x9C;

    fn write_fields(&self, out: &mut FieldWriter) {
        out.string(TAG_PAIR_TARGET, &self.target.to_string_lossy());
        out.string(TAG_PAIR_BACKUP, &self.backup.to_string_lossy());
    }

    fn read_body(reader: &mut FieldReader<'_>) -> TlvResult<Self> {
        let mut pair = Self::default();
        read_fields(reader, Self::END, |tag, r| {
            match tag {
                TAG_PAIR_TARGET => pair.target = PathBuf::from(r.read_string()?),
                TAG_PAIR_BACKUP => pair.backup = PathBuf::from(r.read_string()?),
                _ => return Ok(false),
            }
            Ok(true)
        })?;
        Ok(pair)
    }
}

/// Journal owned by one executing stage.
#[derive(Debug)]
pub struct RollbackJournal {
    path: PathBuf,
    phase: JournalPhase,
    entries: Vec<JournalEntry>,
}

impl RollbackJournal {
    /// Creates an empty journal file, replacing any previous one at `path`.
    pub fn create(path: &Path, phase: JournalPhase) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let mut header = FieldWriter::with_header(JOURNAL_MAGIC);
        header.i32(TAG_PHASE, phase.code());
        let mut file = fs::File::create(path)
            .with_context(|| format!("failed to create journal: {}", path.display()))?;
        file.write_all(&header.into_bytes())
            .and_then(|()| file.sync_all())
            .with_context(|| format!("failed to write journal: {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            phase,
            entries: Vec::new(),
        })
    }

    /// Reads a journal left on disk. A torn final entry (crash mid-append) is dropped.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to read journal: {}", path.display()))
            }
        };

        let mut reader = FieldReader::new(&bytes);
        let phase = reader
            .expect_header(JOURNAL_MAGIC)
            .and_then(|()| {
                let tag = reader.read_tag()?;
                if tag != TAG_PHASE {
                    return Err(upkeep_core::CorruptDataError::malformed(format!(
                        "journal phase field missing, found tag 0x{tag:02X}"
                    )));
                }
                reader.read_i32()
            })
            .with_context(|| format!("failed to decode journal: {}", path.display()))?;
        let phase = JournalPhase::from_code(phase)
            .ok_or_else(|| anyhow!("journal {} has unknown phase {phase}", path.display()))?;

        let mut entries = Vec::new();
        while !reader.is_at_end() {
            let start = reader.position();
            let decoded = reader
                .read_tag()
                .and_then(|tag| match JournalEntry::read(tag, &mut reader)? {
                    Some(entry) => Ok(Some(entry)),
                    None => reader.skip_field(tag).map(|()| None),
                });
            match decoded {
                Ok(Some(entry)) => entries.push(entry),
                Ok(None) => {}
                Err(err) if err.is_truncation() => {
                    tracing::warn!(
                        journal = %path.display(),
                        offset = start,
                        "dropping torn journal entry"
                    );
                    break;
                }
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("failed to decode journal: {}", path.display()))
                }
            }
        }

        Ok(Some(Self {
            path: path.to_path_buf(),
            phase,
            entries,
        }))
    }

    /// Persists `entry` before returning; the caller mutates only afterwards.
    pub fn append(&mut self, entry: JournalEntry) -> Result<()> {
        let mut out = FieldWriter::new();
        entry.write(&mut out);
        let mut file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open journal: {}", self.path.display()))?;
        file.write_all(&out.into_bytes())
            .and_then(|()| file.sync_data())
            .with_context(|| format!("failed to append to journal: {}", self.path.display()))?;
        tracing::debug!(entry = %entry.describe(), "journaled");
        self.entries.push(entry);
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn phase(&self) -> JournalPhase {
        self.phase
    }

    pub fn entries(&self) -> &[JournalEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Deletes the journal file once its stage committed or was rolled back.
    pub fn discard(self) -> Result<()> {
        crate::fs_utils::remove_file_if_exists(&self.path)
            .with_context(|| format!("failed to remove journal: {}", self.path.display()))
    }
}
