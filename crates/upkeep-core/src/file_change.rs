use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::tlv::{
    enum_out_of_range, read_fields, CorruptDataError, FieldReader, FieldWriter, TlvRecord,
    TlvResult,
};

const TAG_RELATIVE_PATH: u8 = 0x01;
const TAG_EXECUTE: u8 = 0x02;
const TAG_EXECUTE_BEFORE_UPDATE: u8 = 0x03;
const TAG_COMMAND_LINE_ARGS: u8 = 0x04;
const TAG_WAIT_FOR_EXECUTION: u8 = 0x05;
const TAG_MANAGED_ASSEMBLY: u8 = 0x06;
const TAG_CPU_ARCH: u8 = 0x07;
const TAG_FRAMEWORK_VERSION: u8 = 0x08;
const TAG_DELTA_PATCH: u8 = 0x09;
const TAG_NEW_FILE_SHA256: u8 = 0x0A;
const TAG_DELETE_FILE: u8 = 0x0B;
const TAG_COM_REGISTRATION: u8 = 0x0C;
const TAG_ROLLBACK_ON_NON_ZERO_EXIT: u8 = 0x0D;
const TAG_ELEVATION: u8 = 0x0E;
const TAG_LEGACY_RELATIVE_PATH: u8 = 0x81;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CpuArch {
    #[default]
    AnyCpu,
    X86,
    X64,
}

impl CpuArch {
    pub fn code(self) -> i32 {
        match self {
            Self::AnyCpu => 0,
            Self::X86 => 1,
            Self::X64 => 2,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::AnyCpu),
            1 => Some(Self::X86),
            2 => Some(Self::X64),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameworkVersion {
    #[default]
    Unknown,
    Net20,
    Net40,
}

impl FrameworkVersion {
    pub fn code(self) -> i32 {
        match self {
            Self::Unknown => 0,
            Self::Net20 => 1,
            Self::Net40 => 2,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::Unknown),
            1 => Some(Self::Net20),
            2 => Some(Self::Net40),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElevationType {
    #[default]
    SameAsParent,
    Elevated,
    NotElevated,
}

impl ElevationType {
    pub fn code(self) -> i32 {
        match self {
            Self::SameAsParent => 0,
            Self::Elevated => 1,
            Self::NotElevated => 2,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::SameAsParent),
            1 => Some(Self::Elevated),
            2 => Some(Self::NotElevated),
            _ => None,
        }
    }
}

/// COM registration flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ComRegistration(u8);

impl ComRegistration {
    pub const NONE: Self = Self(0);
    pub const IS_ASSEMBLY: Self = Self(1);
    pub const REGISTER: Self = Self(2);
    pub const UNREGISTER: Self = Self(4);
    pub const PREVIOUSLY_REGISTERED: Self = Self(8);
    const ALL: u8 = 0x0F;

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn from_bits(bits: i32) -> Option<Self> {
        u8::try_from(bits)
            .ok()
            .filter(|bits| bits & !Self::ALL == 0)
            .map(Self)
    }

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn with(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }
}

impl std::ops::BitOr for ComRegistration {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.with(rhs)
    }
}

/// Post-processing instructions for one file of the update.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChange {
    pub relative_path: String,
    pub execute: bool,
    pub execute_before_update: bool,
    pub command_line_args: Option<String>,
    pub wait_for_execution: bool,
    pub rollback_on_non_zero_exit: bool,
    pub is_managed_assembly: bool,
    pub cpu_arch: CpuArch,
    pub framework_version: FrameworkVersion,
    pub delta_patch_relative_path: Option<String>,
    pub new_file_sha256: Option<String>,
    pub delete_file: bool,
    pub com_registration: ComRegistration,
    pub elevation: ElevationType,
}

impl FileChange {
    pub fn new(relative_path: impl Into<String>) -> Self {
        Self {
            relative_path: relative_path.into(),
            ..Self::default()
        }
    }

    /// Resolves `relative_path` under `root`, accepting either separator.
    pub fn resolve(&self, root: &Path) -> PathBuf {
        join_relative(root, &self.relative_path)
    }

    pub fn needs_registration(&self) -> bool {
        self.is_managed_assembly
            || self.com_registration.contains(ComRegistration::REGISTER)
            || self.com_registration.contains(ComRegistration::UNREGISTER)
    }

    pub fn runs_before_update(&self) -> bool {
        self.execute && self.execute_before_update
    }

    pub fn runs_after_update(&self) -> bool {
        self.execute && !self.execute_before_update
    }

    fn validate(&self) -> TlvResult<()> {
        if self.relative_path.is_empty() {
            return Err(CorruptDataError::malformed(
                "file change has an empty relative path",
            ));
        }
        if self.delete_file && self.delta_patch_relative_path.is_some() {
            return Err(CorruptDataError::malformed(format!(
                "file change '{}' both deletes and patches the file",
                self.relative_path
            )));
        }
        Ok(())
    }
}

pub fn join_relative(root: &Path, relative: &str) -> PathBuf {
    relative
        .split(['\\', '/'])
        .filter(|segment| !segment.is_empty() && *segment != ".")
        .fold(root.to_path_buf(), |path, segment| path.join(segment))
}

impl TlvRecord for FileChange {
    const START: u8 = 0x8B;
    const END: u8 = 0x9B;

    fn write_fields(&self, out: &mut FieldWriter) {
        out.string(TAG_RELATIVE_PATH, &self.relative_path);
        out.true_flag(TAG_EXECUTE, self.execute);
        out.true_flag(TAG_EXECUTE_BEFORE_UPDATE, self.execute_before_update);
        out.opt_string(TAG_COMMAND_LINE_ARGS, self.command_line_args.as_deref());
        out.true_flag(TAG_WAIT_FOR_EXECUTION, self.wait_for_execution);
        out.true_flag(TAG_ROLLBACK_ON_NON_ZERO_EXIT, self.rollback_on_non_zero_exit);
        out.true_flag(TAG_MANAGED_ASSEMBLY, self.is_managed_assembly);
        if self.cpu_arch != CpuArch::AnyCpu {
            out.i32(TAG_CPU_ARCH, self.cpu_arch.code());
        }
        if self.framework_version != FrameworkVersion::Unknown {
            out.i32(TAG_FRAMEWORK_VERSION, self.framework_version.code());
        }
        out.opt_string(TAG_DELTA_PATCH, self.delta_patch_relative_path.as_deref());
        out.opt_string(TAG_NEW_FILE_SHA256, self.new_file_sha256.as_deref());
        out.true_flag(TAG_DELETE_FILE, self.delete_file);
        if !self.com_registration.is_empty() {
            out.i32(TAG_COM_REGISTRATION, i32::from(self.com_registration.bits()));
        }
        if self.elevation != ElevationType::SameAsParent {
            out.i32(TAG_ELEVATION, self.elevation.code());
        }
    }

    fn read_body(reader: &mut FieldReader<'_>) -> TlvResult<Self> {
        let mut change = Self::default();
        read_fields(reader, Self::END, |tag, r| {
            match tag {
                TAG_RELATIVE_PATH => change.relative_path = r.read_string()?,
                TAG_LEGACY_RELATIVE_PATH => change.relative_path = r.read_utf16_string()?,
                TAG_EXECUTE => change.execute = r.read_bool()?,
                TAG_EXECUTE_BEFORE_UPDATE => change.execute_before_update = r.read_bool()?,
                TAG_COMMAND_LINE_ARGS => change.command_line_args = Some(r.read_string()?),
                TAG_WAIT_FOR_EXECUTION => change.wait_for_execution = r.read_bool()?,
                TAG_ROLLBACK_ON_NON_ZERO_EXIT => {
                    change.rollback_on_non_zero_exit = r.read_bool()?
                }
                TAG_MANAGED_ASSEMBLY => change.is_managed_assembly = r.read_bool()?,
                TAG_CPU_ARCH => {
                    let code = r.read_i32()?;
                    change.cpu_arch = CpuArch::from_code(code)
                        .ok_or_else(|| enum_out_of_range("cpu arch", code))?;
                }
                TAG_FRAMEWORK_VERSION => {
                    let code = r.read_i32()?;
                    change.framework_version = FrameworkVersion::from_code(code)
                        .ok_or_else(|| enum_out_of_range("framework version", code))?;
                }
                TAG_DELTA_PATCH => change.delta_patch_relative_path = Some(r.read_string()?),
                TAG_NEW_FILE_SHA256 => change.new_file_sha256 = Some(r.read_string()?),
                TAG_DELETE_FILE => change.delete_file = r.read_bool()?,
                TAG_COM_REGISTRATION => {
                    let bits = r.read_i32()?;
                    change.com_registration = ComRegistration::from_bits(bits)
                        .ok_or_else(|| enum_out_of_range("com registration", bits))?;
                }
                TAG_ELEVATION => {
                    let code = r.read_i32()?;
                    change.elevation = ElevationType::from_code(code)
                        .ok_or_else(|| enum_out_of_range("elevation type", code))?;
                }
                _ => return Ok(false),
            }
            Ok(true)
        })?;
        change.validate()?;
        Ok(change)
    }
}
