use std::fmt;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;
use upkeep_core::tlv::{read_fields, CorruptDataError, FieldReader, FieldWriter, TlvResult, END_MARKER};
use upkeep_core::Timestamp;

use crate::fs_utils::{remove_file_if_exists, write_atomic};

pub const SESSION_STATE_MAGIC: &[u8] = b"AUIF";

const TAG_STAGE: u8 = 0x01;
const TAG_LAST_TRANSITION: u8 = 0x02;
const TAG_EXEC_AFTER_UPDATE: u8 = 0x03;
const TAG_POST_UPDATE_ARGS: u8 = 0x04;
const TAG_SESSION_ID: u8 = 0x05;
const TAG_SERVER_FILE: u8 = 0x06;
const TAG_SELF_SERVER_FILE: u8 = 0x07;
const TAG_TEMP_DIRECTORY: u8 = 0x08;
const TAG_CATCH_ALL_PACKAGE: u8 = 0x09;
const TAG_CATCH_ALL_ATTEMPTED: u8 = 0x0A;
const TAG_SELF_UPDATE_STATE: u8 = 0x0B;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateStage {
    ClosingProcesses,
    PreExecute,
    BackupAndInstallFiles,
    ModifyRegistry,
    OptimizeAndExecute,
    WriteClientManifest,
    DeleteTemp,
    Done,
    DownloadingSelfUpdate,
    ExtractingSelfUpdate,
    InstallingSelfUpdate,
}

impl UpdateStage {
    /// Execution order: the self-update stages run ahead of the main pipeline.
    pub const ORDER: [UpdateStage; 11] = [
        Self::DownloadingSelfUpdate,
        Self::ExtractingSelfUpdate,
        Self::InstallingSelfUpdate,
        Self::ClosingProcesses,
        Self::PreExecute,
        Self::BackupAndInstallFiles,
        Self::ModifyRegistry,
        Self::OptimizeAndExecute,
        Self::WriteClientManifest,
        Self::DeleteTemp,
        Self::Done,
    ];

    pub const MAIN: [UpdateStage; 7] = [
        Self::ClosingProcesses,
        Self::PreExecute,
        Self::BackupAndInstallFiles,
        Self::ModifyRegistry,
        Self::OptimizeAndExecute,
        Self::WriteClientManifest,
        Self::DeleteTemp,
    ];

    pub fn code(self) -> i32 {
        match self {
            Self::ClosingProcesses => 0,
            Self::PreExecute => 1,
            Self::BackupAndInstallFiles => 2,
            Self::ModifyRegistry => 3,
            Self::OptimizeAndExecute => 4,
            Self::WriteClientManifest => 5,
            Self::DeleteTemp => 6,
            Self::Done => 7,
            Self::DownloadingSelfUpdate => 8,
            Self::ExtractingSelfUpdate => 9,
            Self::InstallingSelfUpdate => 10,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        Self::ORDER.into_iter().find(|stage| stage.code() == code)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ClosingProcesses => "closing-processes",
            Self::PreExecute => "pre-execute",
            Self::BackupAndInstallFiles => "backup-and-install-files",
            Self::ModifyRegistry => "modify-registry",
            Self::OptimizeAndExecute => "optimize-and-execute",
            Self::WriteClientManifest => "write-client-manifest",
            Self::DeleteTemp => "delete-temp",
            Self::Done => "done",
            Self::DownloadingSelfUpdate => "downloading-self-update",
            Self::ExtractingSelfUpdate => "extracting-self-update",
            Self::InstallingSelfUpdate => "installing-self-update",
        }
    }

    pub fn is_self_update(self) -> bool {
        matches!(
            self,
            Self::DownloadingSelfUpdate | Self::ExtractingSelfUpdate | Self::InstallingSelfUpdate
        )
    }

    /// Position in [`UpdateStage::ORDER`].
    pub fn ordinal(self) -> usize {
        Self::ORDER
            .iter()
            .position(|stage| *stage == self)
            .unwrap_or(Self::ORDER.len())
    }
}

impl fmt::Display for UpdateStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How far the updater's replacement of itself got. Steps are recorded once they are complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SelfUpdateState {
    /// The payload is on disk and passed its checksum and signature checks.
    Downloaded,
    Extracted,
    /// The successor was launched and owns the rest of the session.
    HandedOff,
}

impl SelfUpdateState {
    pub fn code(self) -> i32 {
        match self {
            Self::Downloaded => 1,
            Self::Extracted => 2,
            Self::HandedOff => 3,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            1 => Some(Self::Downloaded),
            2 => Some(Self::Extracted),
            3 => Some(Self::HandedOff),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Downloaded => "downloaded",
            Self::Extracted => "extracted",
            Self::HandedOff => "handed-off",
        }
    }
}

/// Durable record of where an update session is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionState {
    pub current_stage: UpdateStage,
    pub last_transition: Timestamp,
    pub file_to_execute_after_update: Option<String>,
    pub post_update_arguments: Option<String>,
    pub session_id: Option<String>,
    pub server_file: Option<String>,
    pub self_server_file: Option<String>,
    pub temp_directory: Option<String>,
    pub catch_all_package: Option<String>,
    pub catch_all_attempted: bool,
    pub self_update_state: Option<SelfUpdateState>,
}

impl SessionState {
    pub fn new(first_stage: UpdateStage) -> Self {
        Self {
            current_stage: first_stage,
            last_transition: Timestamp::now(),
            file_to_execute_after_update: None,
            post_update_arguments: None,
            session_id: None,
            server_file: None,
            self_server_file: None,
            temp_directory: None,
            catch_all_package: None,
            catch_all_attempted: false,
            self_update_state: None,
        }
    }

    /// Moves to `stage` and stamps the transition time.
    pub fn enter(&mut self, stage: UpdateStage) {
        self.current_stage = stage;
        self.last_transition = Timestamp::now();
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = FieldWriter::with_header(SESSION_STATE_MAGIC);
        out.i32(TAG_STAGE, self.current_stage.code());
        out.timestamp(TAG_LAST_TRANSITION, self.last_transition);
        out.opt_string(
            TAG_EXEC_AFTER_UPDATE,
            self.file_to_execute_after_update.as_deref(),
        );
        out.opt_string(TAG_POST_UPDATE_ARGS, self.post_update_arguments.as_deref());
        out.opt_string(TAG_SESSION_ID, self.session_id.as_deref());
        out.opt_string(TAG_SERVER_FILE, self.server_file.as_deref());
        out.opt_string(TAG_SELF_SERVER_FILE, self.self_server_file.as_deref());
        out.opt_string(TAG_TEMP_DIRECTORY, self.temp_directory.as_deref());
        out.opt_string(TAG_CATCH_ALL_PACKAGE, self.catch_all_package.as_deref());
        out.true_flag(TAG_CATCH_ALL_ATTEMPTED, self.catch_all_attempted);
        if let Some(self_update) = self.self_update_state {
            out.i32(TAG_SELF_UPDATE_STATE, self_update.code());
        }
        out.marker(END_MARKER);
        out.into_bytes()
    }

    pub fn from_bytes(bytes: &[u8]) -> TlvResult<Self> {
        let mut reader = FieldReader::new(bytes);
        reader.expect_header(SESSION_STATE_MAGIC)?;

        let mut stage = None;
        let mut state = Self::new(UpdateStage::ClosingProcesses);
        state.last_transition = Timestamp(0);
        read_fields(&mut reader, END_MARKER, |tag, r| {
            match tag {
                TAG_STAGE => {
                    let code = r.read_i32()?;
                    stage = Some(UpdateStage::from_code(code).ok_or_else(|| {
                        CorruptDataError::malformed(format!("update stage {code} is out of range"))
                    })?);
                }
                TAG_LAST_TRANSITION => state.last_transition = r.read_timestamp()?,
                TAG_EXEC_AFTER_UPDATE => {
                    state.file_to_execute_after_update = Some(r.read_string()?)
                }
                TAG_POST_UPDATE_ARGS => state.post_update_arguments = Some(r.read_string()?),
                TAG_SESSION_ID => state.session_id = Some(r.read_string()?),
                TAG_SERVER_FILE => state.server_file = Some(r.read_string()?),
                TAG_SELF_SERVER_FILE => state.self_server_file = Some(r.read_string()?),
                TAG_TEMP_DIRECTORY => state.temp_directory = Some(r.read_string()?),
                TAG_CATCH_ALL_PACKAGE => state.catch_all_package = Some(r.read_string()?),
                TAG_CATCH_ALL_ATTEMPTED => state.catch_all_attempted = r.read_bool()?,
                TAG_SELF_UPDATE_STATE => {
                    let code = r.read_i32()?;
                    state.self_update_state =
                        Some(SelfUpdateState::from_code(code).ok_or_else(|| {
                            CorruptDataError::malformed(format!(
                                "self-update state {code} is out of range"
                            ))
                        })?);
                }
                _ => return Ok(false),
            }
            Ok(true)
        })?;
        reader.finish()?;

        state.current_stage =
            stage.ok_or_else(|| CorruptDataError::malformed("session state has no stage"))?;
        Ok(state)
    }

    /// Reads the state file; `None` when there is no session to resume.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to read session state: {}", path.display()))
            }
        };
        Self::from_bytes(&bytes)
            .map(Some)
            .with_context(|| format!("failed to decode session state: {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        write_atomic(path, &self.to_bytes())
            .with_context(|| format!("failed to write session state: {}", path.display()))
    }

    pub fn delete(path: &Path) -> Result<()> {
        remove_file_if_exists(path)
            .with_context(|| format!("failed to remove session state: {}", path.display()))
    }
}
