use serde::{Deserialize, Serialize};

use crate::tlv::{
    decode_utf16le, enum_out_of_range, read_fields, CorruptDataError, FieldReader, FieldWriter,
    TlvRecord, TlvResult,
};

const TAG_OPERATION: u8 = 0x01;
const TAG_ROOT: u8 = 0x02;
const TAG_SUB_KEY: u8 = 0x03;
const TAG_VALUE_NAME: u8 = 0x04;
const TAG_VALUE_KIND: u8 = 0x05;
const TAG_VALUE_DATA: u8 = 0x06;
const TAG_32BIT_VIEW: u8 = 0x07;
const TAG_LEGACY_SUB_KEY: u8 = 0x83;
const TAG_LEGACY_VALUE_NAME: u8 = 0x84;
const TAG_LEGACY_VALUE_DATA: u8 = 0x86;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistryOperation {
    CreateValue,
    RemoveValue,
    CreateKey,
    RemoveKey,
}

impl RegistryOperation {
    pub fn code(self) -> i32 {
        match self {
            Self::CreateValue => 0,
            Self::RemoveValue => 1,
            Self::CreateKey => 2,
            Self::RemoveKey => 3,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::CreateValue),
            1 => Some(Self::RemoveValue),
            2 => Some(Self::CreateKey),
            3 => Some(Self::RemoveKey),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistryRoot {
    ClassesRoot,
    CurrentUser,
    LocalMachine,
    Users,
    CurrentConfig,
}

impl RegistryRoot {
    pub fn code(self) -> i32 {
        match self {
            Self::ClassesRoot => 0,
            Self::CurrentUser => 1,
            Self::LocalMachine => 2,
            Self::Users => 3,
            Self::CurrentConfig => 4,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::ClassesRoot),
            1 => Some(Self::CurrentUser),
            2 => Some(Self::LocalMachine),
            3 => Some(Self::Users),
            4 => Some(Self::CurrentConfig),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ClassesRoot => "HKEY_CLASSES_ROOT",
            Self::CurrentUser => "HKEY_CURRENT_USER",
            Self::LocalMachine => "HKEY_LOCAL_MACHINE",
            Self::Users => "HKEY_USERS",
            Self::CurrentConfig => "HKEY_CURRENT_CONFIG",
        }
    }

    /// Machine-wide roots need an elevated process to modify.
    pub fn is_machine_wide(self) -> bool {
        matches!(self, Self::ClassesRoot | Self::LocalMachine | Self::Users)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistryValueKind {
    None,
    String,
    ExpandString,
    MultiString,
    Binary,
    DWord,
    QWord,
}

impl RegistryValueKind {
    pub fn code(self) -> i32 {
        match self {
            Self::None => -1,
            Self::String => 1,
            Self::ExpandString => 2,
            Self::Binary => 3,
            Self::DWord => 4,
            Self::MultiString => 7,
            Self::QWord => 11,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            -1 | 0 => Some(Self::None),
            1 => Some(Self::String),
            2 => Some(Self::ExpandString),
            3 => Some(Self::Binary),
            4 => Some(Self::DWord),
            7 => Some(Self::MultiString),
            11 => Some(Self::QWord),
            _ => None,
        }
    }
}

/// Registry value data; the variant is the value kind, so data and kind cannot disagree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum RegistryValue {
    None,
    String(String),
    ExpandString(String),
    MultiString(Vec<String>),
    Binary(Vec<u8>),
    DWord(u32),
    QWord(u64),
}

impl RegistryValue {
    pub fn kind(&self) -> RegistryValueKind {
        match self {
            Self::None => RegistryValueKind::None,
            Self::String(_) => RegistryValueKind::String,
            Self::ExpandString(_) => RegistryValueKind::ExpandString,
            Self::MultiString(_) => RegistryValueKind::MultiString,
            Self::Binary(_) => RegistryValueKind::Binary,
            Self::DWord(_) => RegistryValueKind::DWord,
            Self::QWord(_) => RegistryValueKind::QWord,
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    fn encode_data(&self) -> Option<Vec<u8>> {
        match self {
            Self::None => None,
            Self::String(text) | Self::ExpandString(text) => Some(text.as_bytes().to_vec()),
            Self::MultiString(items) => Some(
                items
                    .iter()
                    .flat_map(|item| item.bytes().chain(std::iter::once(0)))
                    .collect(),
            ),
            Self::Binary(bytes) => Some(bytes.clone()),
            Self::DWord(value) => Some(value.to_le_bytes().to_vec()),
            Self::QWord(value) => Some(value.to_le_bytes().to_vec()),
        }
    }

    fn decode_text(kind: RegistryValueKind, text: String) -> TlvResult<Self> {
        match kind {
            RegistryValueKind::String => Ok(Self::String(text)),
            RegistryValueKind::ExpandString => Ok(Self::ExpandString(text)),
            RegistryValueKind::MultiString => Ok(Self::MultiString(split_multi_string(&text))),
            other => Err(CorruptDataError::malformed(format!(
                "string data supplied for {other:?} registry value"
            ))),
        }
    }

    fn decode_data(kind: RegistryValueKind, payload: &[u8]) -> TlvResult<Self> {
        match kind {
            RegistryValueKind::None => Err(CorruptDataError::malformed(
                "registry value data present without a value kind",
            )),
            RegistryValueKind::String
            | RegistryValueKind::ExpandString
            | RegistryValueKind::MultiString => {
                let text = String::from_utf8(payload.to_vec()).map_err(|err| {
                    CorruptDataError::malformed(format!("invalid UTF-8 registry data: {err}"))
                })?;
                Self::decode_text(kind, text)
            }
            RegistryValueKind::Binary => Ok(Self::Binary(payload.to_vec())),
            RegistryValueKind::DWord => {
                let raw: [u8; 4] = payload.try_into().map_err(|_| {
                    CorruptDataError::malformed(format!(
                        "DWord registry data must be 4 bytes, found {}",
                        payload.len()
                    ))
                })?;
                Ok(Self::DWord(u32::from_le_bytes(raw)))
            }
            RegistryValueKind::QWord => {
                let raw: [u8; 8] = payload.try_into().map_err(|_| {
                    CorruptDataError::malformed(format!(
                        "QWord registry data must be 8 bytes, found {}",
                        payload.len()
                    ))
                })?;
                Ok(Self::QWord(u64::from_le_bytes(raw)))
            }
        }
    }
}

/// Items of multi-string data. Each item carries its own NUL terminator, so an empty list and a
/// list holding one empty string stay distinct. Data without a final terminator is read as
/// NUL-separated items.
fn split_multi_string(text: &str) -> Vec<String> {
    if text.ends_with('\0') {
        text.split_terminator('\0').map(str::to_string).collect()
    } else if text.is_empty() {
        Vec::new()
    } else {
        text.split('\0').map(str::to_string).collect()
    }
}

/// One reversible registry action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryChange {
    pub operation: RegistryOperation,
    pub root: RegistryRoot,
    pub sub_key: String,
    pub value_name: Option<String>,
    pub value: RegistryValue,
    pub is_32bit_view: bool,
}

impl RegistryChange {
    pub fn create_value(
        root: RegistryRoot,
        sub_key: impl Into<String>,
        value_name: Option<&str>,
        value: RegistryValue,
    ) -> Result<Self, CorruptDataError> {
        if value.is_none() {
            return Err(CorruptDataError::malformed(
                "CreateValue requires value data",
            ));
        }
        Ok(Self {
            operation: RegistryOperation::CreateValue,
            root,
            sub_key: sub_key.into(),
            value_name: value_name.map(str::to_string),
            value,
            is_32bit_view: false,
        })
    }

    pub fn remove_value(
        root: RegistryRoot,
        sub_key: impl Into<String>,
        value_name: Option<&str>,
    ) -> Self {
        Self {
            operation: RegistryOperation::RemoveValue,
            root,
            sub_key: sub_key.into(),
            value_name: value_name.map(str::to_string),
            value: RegistryValue::None,
            is_32bit_view: false,
        }
    }

    pub fn create_key(root: RegistryRoot, sub_key: impl Into<String>) -> Self {
        Self {
            operation: RegistryOperation::CreateKey,
            root,
            sub_key: sub_key.into(),
            value_name: None,
            value: RegistryValue::None,
            is_32bit_view: false,
        }
    }

    pub fn remove_key(root: RegistryRoot, sub_key: impl Into<String>) -> Self {
        Self {
            operation: RegistryOperation::RemoveKey,
            root,
            sub_key: sub_key.into(),
            value_name: None,
            value: RegistryValue::None,
            is_32bit_view: false,
        }
    }

    pub fn in_32bit_view(mut self, is_32bit_view: bool) -> Self {
        self.is_32bit_view = is_32bit_view;
        self
    }

    /// Clone of this change targeting another location/operation in the same view.
    pub fn derive(
        &self,
        operation: RegistryOperation,
        sub_key: impl Into<String>,
        value_name: Option<String>,
        value: RegistryValue,
    ) -> Self {
        Self {
            operation,
            root: self.root,
            sub_key: sub_key.into(),
            value_name,
            value,
            is_32bit_view: self.is_32bit_view,
        }
    }

    /// `sub_key` split into its non-empty segments.
    pub fn key_segments(&self) -> Vec<&str> {
        split_key_path(&self.sub_key)
    }

    pub fn display_path(&self) -> String {
        let mut path = format!("{}\\{}", self.root.as_str(), self.sub_key);
        if let Some(name) = &self.value_name {
            path.push_str(&format!(" [{name}]"));
        }
        path
    }

    fn validate(&self) -> TlvResult<()> {
        if self.operation == RegistryOperation::CreateValue && self.value.is_none() {
            return Err(CorruptDataError::malformed(
                "CreateValue registry change has no value data",
            ));
        }
        Ok(())
    }
}

pub fn split_key_path(path: &str) -> Vec<&str> {
    path.split(['\\', '/'])
        .filter(|segment| !segment.is_empty())
        .collect()
}

impl TlvRecord for RegistryChange {
    const START: u8 = 0x8E;
    const END: u8 = 0x9E;

    fn write_fields(&self, out: &mut FieldWriter) {
        out.i32(TAG_OPERATION, self.operation.code());
        out.i32(TAG_ROOT, self.root.code());
        out.string(TAG_SUB_KEY, &self.sub_key);
        out.opt_string(TAG_VALUE_NAME, self.value_name.as_deref());
        if let Some(data) = self.value.encode_data() {
            out.i32(TAG_VALUE_KIND, self.value.kind().code());
            out.bytes(TAG_VALUE_DATA, &data);
        }
        out.true_flag(TAG_32BIT_VIEW, self.is_32bit_view);
    }

    fn read_body(reader: &mut FieldReader<'_>) -> TlvResult<Self> {
        let mut operation = None;
        let mut root = None;
        let mut sub_key = None;
        let mut value_name = None;
        let mut kind = None;
        let mut data: Option<Vec<u8>> = None;
        let mut legacy_text: Option<String> = None;
        let mut is_32bit_view = false;

        read_fields(reader, Self::END, |tag, r| {
            match tag {
                TAG_OPERATION => {
                    let code = r.read_i32()?;
                    operation = Some(
                        RegistryOperation::from_code(code)
                            .ok_or_else(|| enum_out_of_range("registry operation", code))?,
                    );
                }
                TAG_ROOT => {
                    let code = r.read_i32()?;
                    root = Some(
                        RegistryRoot::from_code(code)
                            .ok_or_else(|| enum_out_of_range("registry root", code))?,
                    );
                }
                TAG_SUB_KEY => sub_key = Some(r.read_string()?),
                TAG_LEGACY_SUB_KEY => sub_key = Some(r.read_utf16_string()?),
                TAG_VALUE_NAME => value_name = Some(r.read_string()?),
                TAG_LEGACY_VALUE_NAME => value_name = Some(r.read_utf16_string()?),
                TAG_VALUE_KIND => {
                    let code = r.read_i32()?;
                    kind = Some(
                        RegistryValueKind::from_code(code)
                            .ok_or_else(|| enum_out_of_range("registry value kind", code))?,
                    );
                }
                TAG_VALUE_DATA => data = Some(r.read_bytes()?),
                TAG_LEGACY_VALUE_DATA => legacy_text = Some(decode_utf16le(r.payload()?)?),
                TAG_32BIT_VIEW => is_32bit_view = r.read_bool()?,
                _ => return Ok(false),
            }
            Ok(true)
        })?;

        let kind = kind.unwrap_or(RegistryValueKind::None);
        let value = match (data, legacy_text) {
            (Some(data), _) => RegistryValue::decode_data(kind, &data)?,
            (None, Some(text)) => RegistryValue::decode_text(kind, text)?,
            (None, None) if kind == RegistryValueKind::None => RegistryValue::None,
            (None, None) => {
                return Err(CorruptDataError::malformed(format!(
                    "registry value kind {kind:?} declared without data"
                )))
            }
        };

        let change = Self {
            operation: operation
                .ok_or_else(|| CorruptDataError::malformed("registry change missing operation"))?,
            root: root.ok_or_else(|| CorruptDataError::malformed("registry change missing root"))?,
            sub_key: sub_key
                .ok_or_else(|| CorruptDataError::malformed("registry change missing sub key"))?,
            value_name,
            value,
            is_32bit_view,
        };
        change.validate()?;
        Ok(change)
    }
}
