use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::file_change::FileChange;
use crate::registry::RegistryChange;
use crate::shortcut::ShortcutRecord;
use crate::tlv::{
    read_fields, CorruptDataError, FieldReader, FieldWriter, TlvRecord, TlvResult, END_MARKER,
};

pub const UPDATE_DETAILS_MAGIC: &[u8] = b"IUUDFV2";

const TAG_REGISTRY_COUNT: u8 = 0x20;
const TAG_REGISTRY_CHANGE: u8 = 0x21;
const TAG_SHORTCUT: u8 = 0x22;
const TAG_PREVIOUS_SHORTCUT: u8 = 0x23;
const TAG_FILE_COUNT: u8 = 0x24;
const TAG_FILE_CHANGE: u8 = 0x25;
const TAG_FOLDER_TO_DELETE: u8 = 0x26;
const TAG_SERVICE_TO_STOP: u8 = 0x27;
const TAG_SERVICE_TO_START: u8 = 0x28;
const TAG_SERVICE_START_ARG: u8 = 0x29;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceStart {
    pub name: String,
    #[serde(default)]
    pub arguments: Vec<String>,
}

impl ServiceStart {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            arguments: Vec::new(),
        }
    }
}

/// Everything an update package asks the installer to do besides copying its payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateDetails {
    pub registry_changes: Vec<RegistryChange>,
    pub shortcuts: Vec<ShortcutRecord>,
    pub previous_shortcuts: Vec<String>,
    pub file_changes: Vec<FileChange>,
    pub folders_to_delete: Vec<String>,
    pub services_to_stop: Vec<String>,
    pub services_to_start: Vec<ServiceStart>,
}

impl UpdateDetails {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = FieldWriter::with_header(UPDATE_DETAILS_MAGIC);
        if !self.registry_changes.is_empty() {
            out.i32(TAG_REGISTRY_COUNT, self.registry_changes.len() as i32);
            for change in &self.registry_changes {
                change.write_nested(TAG_REGISTRY_CHANGE, &mut out);
            }
        }
        for shortcut in &self.shortcuts {
            shortcut.write_nested(TAG_SHORTCUT, &mut out);
        }
        for path in &self.previous_shortcuts {
            out.string(TAG_PREVIOUS_SHORTCUT, path);
        }
        if !self.file_changes.is_empty() {
            out.i32(TAG_FILE_COUNT, self.file_changes.len() as i32);
            for change in &self.file_changes {
                change.write_nested(TAG_FILE_CHANGE, &mut out);
            }
        }
        for folder in &self.folders_to_delete {
            out.string(TAG_FOLDER_TO_DELETE, folder);
        }
        for service in &self.services_to_stop {
            out.string(TAG_SERVICE_TO_STOP, service);
        }
        for service in &self.services_to_start {
            out.string(TAG_SERVICE_TO_START, &service.name);
            for argument in &service.arguments {
                out.string(TAG_SERVICE_START_ARG, argument);
            }
        }
        out.marker(END_MARKER);
        out.into_bytes()
    }

    pub fn from_bytes(bytes: &[u8]) -> TlvResult<Self> {
        let mut reader = FieldReader::new(bytes);
        reader.expect_header(UPDATE_DETAILS_MAGIC)?;

        let mut details = Self::default();
        let mut registry_count = None;
        let mut file_count = None;
        read_fields(&mut reader, END_MARKER, |tag, r| {
            match tag {
                TAG_REGISTRY_COUNT => registry_count = Some(r.read_i32()?),
                TAG_REGISTRY_CHANGE => details
                    .registry_changes
                    .push(RegistryChange::read_nested(r)?),
                TAG_SHORTCUT => details.shortcuts.push(ShortcutRecord::read_nested(r)?),
                TAG_PREVIOUS_SHORTCUT => details.previous_shortcuts.push(r.read_string()?),
                TAG_FILE_COUNT => file_count = Some(r.read_i32()?),
                TAG_FILE_CHANGE => details.file_changes.push(FileChange::read_nested(r)?),
                TAG_FOLDER_TO_DELETE => details.folders_to_delete.push(r.read_string()?),
                TAG_SERVICE_TO_STOP => details.services_to_stop.push(r.read_string()?),
                TAG_SERVICE_TO_START => {
                    details
                        .services_to_start
                        .push(ServiceStart::new(r.read_string()?));
                }
                TAG_SERVICE_START_ARG => {
                    let argument = r.read_string()?;
                    let service = details.services_to_start.last_mut().ok_or_else(|| {
                        CorruptDataError::malformed("service argument precedes any service")
                    })?;
                    service.arguments.push(argument);
                }
                _ => return Ok(false),
            }
            Ok(true)
        })?;
        reader.finish()?;

        check_count("registry change", registry_count, details.registry_changes.len())?;
        check_count("file change", file_count, details.file_changes.len())?;
        Ok(details)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let bytes = fs::read(path)
            .with_context(|| format!("failed to read update details: {}", path.display()))?;
        Self::from_bytes(&bytes)
            .with_context(|| format!("failed to decode update details: {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<PathBuf> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        fs::write(path, self.to_bytes())
            .with_context(|| format!("failed to write update details: {}", path.display()))?;
        Ok(path.to_path_buf())
    }
}

fn check_count(what: &str, declared: Option<i32>, found: usize) -> TlvResult<()> {
    match declared {
        Some(declared) if usize::try_from(declared).ok() != Some(found) => {
            Err(CorruptDataError::malformed(format!(
                "declared {declared} {what} records, found {found}"
            )))
        }
        None if found > 0 => Err(CorruptDataError::malformed(format!(
            "{found} {what} records without a count prefix"
        ))),
        _ => Ok(()),
    }
}
