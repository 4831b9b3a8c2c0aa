//! The operating system's registry. Values travel as `REG_*` typed byte buffers; the codec is
//! platform independent, the backend exists on Windows only.

use anyhow::{bail, Result};
use upkeep_core::RegistryValue;

pub const REG_NONE: u32 = 0;
pub const REG_SZ: u32 = 1;
pub const REG_EXPAND_SZ: u32 = 2;
pub const REG_BINARY: u32 = 3;
pub const REG_DWORD: u32 = 4;
pub const REG_DWORD_BIG_ENDIAN: u32 = 5;
pub const REG_MULTI_SZ: u32 = 7;
pub const REG_QWORD: u32 = 11;

fn utf16_bytes(units: impl Iterator<Item = u16>) -> Vec<u8> {
    units.flat_map(u16::to_le_bytes).collect()
}

fn utf16_units(data: &[u8]) -> Vec<u16> {
    data.chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

fn fixed_width(reg_type: u32, data: &[u8], len: usize) -> Result<&[u8]> {
    if data.len() < len {
        bail!("registry value of type {reg_type} has {} bytes, expected {len}", data.len());
    }
    Ok(&data[..len])
}

/// Registry type and data buffer for `value`. Strings are NUL-terminated UTF-16LE; a multi-string
/// terminates every item and then the list.
pub fn encode_reg_data(value: &RegistryValue) -> (u32, Vec<u8>) {
    let terminated =
        |text: &str| text.encode_utf16().chain(std::iter::once(0)).collect::<Vec<_>>();
    match value {
        RegistryValue::None => (REG_NONE, Vec::new()),
        RegistryValue::String(text) => (REG_SZ, utf16_bytes(terminated(text).into_iter())),
        RegistryValue::ExpandString(text) => {
            (REG_EXPAND_SZ, utf16_bytes(terminated(text).into_iter()))
        }
        RegistryValue::MultiString(items) => {
            let units = items
                .iter()
                .flat_map(|item| terminated(item))
                .chain(std::iter::once(0));
            (REG_MULTI_SZ, utf16_bytes(units))
        }
        RegistryValue::Binary(bytes) => (REG_BINARY, bytes.clone()),
        RegistryValue::DWord(number) => (REG_DWORD, number.to_le_bytes().to_vec()),
        RegistryValue::QWord(number) => (REG_QWORD, number.to_le_bytes().to_vec()),
    }
}

/// Reads a buffer as the registry returns it. Strings may lack their terminator; types this
/// crate does not model come back as raw bytes.
pub fn decode_reg_data(reg_type: u32, data: &[u8]) -> Result<RegistryValue> {
    let text = |data: &[u8]| {
        let mut units = utf16_units(data);
        while units.last() == Some(&0) {
            units.pop();
        }
        String::from_utf16_lossy(&units)
    };
    Ok(match reg_type {
        REG_NONE => RegistryValue::None,
        REG_SZ => RegistryValue::String(text(data)),
        REG_EXPAND_SZ => RegistryValue::ExpandString(text(data)),
        REG_MULTI_SZ => {
            let mut units = utf16_units(data);
            if units.last() == Some(&0) {
                units.pop();
            }
            let items = if units.is_empty() {
                Vec::new()
            } else {
                let joined = String::from_utf16_lossy(&units);
                joined.split_terminator('\0').map(str::to_string).collect()
            };
            RegistryValue::MultiString(items)
        }
        REG_DWORD => {
            let bytes = fixed_width(reg_type, data, 4)?;
            RegistryValue::DWord(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
        }
        REG_DWORD_BIG_ENDIAN => {
            let bytes = fixed_width(reg_type, data, 4)?;
            RegistryValue::DWord(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
        }
        REG_QWORD => {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(fixed_width(reg_type, data, 8)?);
            RegistryValue::QWord(u64::from_le_bytes(bytes))
        }
        _ => RegistryValue::Binary(data.to_vec()),
    })
}

#[cfg(windows)]
pub use windows_backend::WindowsRegistry;

#[cfg(windows)]
mod windows_backend {
    use anyhow::{bail, Result};
    use upkeep_core::{split_key_path, RegistryRoot, RegistryValue};
    use windows::core::{PCWSTR, PWSTR};
    use windows::Win32::Foundation::{
        ERROR_ACCESS_DENIED, ERROR_FILE_NOT_FOUND, ERROR_MORE_DATA, ERROR_NO_MORE_ITEMS,
        ERROR_SUCCESS, WIN32_ERROR,
    };
    use windows::Win32::System::Registry::{
        RegCloseKey, RegCreateKeyExW, RegDeleteKeyExW, RegDeleteTreeW, RegDeleteValueW,
        RegEnumKeyExW, RegEnumValueW, RegOpenKeyExW, RegQueryValueExW, RegSetValueExW, HKEY,
        HKEY_CLASSES_ROOT, HKEY_CURRENT_CONFIG, HKEY_CURRENT_USER, HKEY_LOCAL_MACHINE,
        HKEY_USERS, KEY_ALL_ACCESS, KEY_READ, KEY_SET_VALUE, KEY_WOW64_32KEY, KEY_WOW64_64KEY,
        REG_OPTION_NON_VOLATILE, REG_SAM_FLAGS, REG_VALUE_TYPE,
    };

    use super::{decode_reg_data, encode_reg_data};
    use crate::error::{RegistryAccessError, RegistryAccessKind};
    use crate::registry_view::{KeyListing, RegistryBackend, RegistryBitness, RegistryView};

    // Longest value name the registry allows, plus the terminator.
    const MAX_VALUE_NAME: usize = 16_384;
    const MAX_KEY_NAME: usize = 256;

    fn wide(text: &str) -> Vec<u16> {
        text.encode_utf16().chain(std::iter::once(0)).collect()
    }

    fn root_key(root: RegistryRoot) -> HKEY {
        match root {
            RegistryRoot::ClassesRoot => HKEY_CLASSES_ROOT,
            RegistryRoot::CurrentUser => HKEY_CURRENT_USER,
            RegistryRoot::LocalMachine => HKEY_LOCAL_MACHINE,
            RegistryRoot::Users => HKEY_USERS,
            RegistryRoot::CurrentConfig => HKEY_CURRENT_CONFIG,
        }
    }

    fn key_display(root: RegistryRoot, path: &str) -> String {
        format!("{}\\{}", root.as_str(), path)
    }

    fn access_error(
        status: WIN32_ERROR,
        root: RegistryRoot,
        path: &str,
        action: &str,
    ) -> anyhow::Error {
        let kind = match status {
            ERROR_FILE_NOT_FOUND => RegistryAccessKind::MissingKey,
            ERROR_ACCESS_DENIED => RegistryAccessKind::PermissionDenied,
            _ => RegistryAccessKind::Storage,
        };
        RegistryAccessError {
            kind,
            path: key_display(root, path),
            reason: format!("{action} failed with Win32 error {}", status.0),
        }
        .into()
    }

    struct OpenKey(HKEY);

    impl Drop for OpenKey {
        fn drop(&mut self) {
            let _ = unsafe { RegCloseKey(self.0) };
        }
    }

    /// One view of the registry, selected with the WOW64 access flags.
    pub struct WindowsRegistryView {
        bitness: RegistryBitness,
    }

    impl WindowsRegistryView {
        fn view_flag(&self) -> REG_SAM_FLAGS {
            match self.bitness {
                RegistryBitness::Native => KEY_WOW64_64KEY,
                RegistryBitness::Bit32 => KEY_WOW64_32KEY,
            }
        }

        /// `None` when the key does not exist.
        fn open(
            &self,
            root: RegistryRoot,
            path: &str,
            access: REG_SAM_FLAGS,
        ) -> Result<Option<OpenKey>> {
            let sub_key = wide(&split_key_path(path).join("\\"));
            let mut key = HKEY::default();
            let status = unsafe {
                RegOpenKeyExW(
                    root_key(root),
                    PCWSTR::from_raw(sub_key.as_ptr()),
                    None,
                    access | self.view_flag(),
                    &mut key,
                )
            };
            match status {
                ERROR_SUCCESS => Ok(Some(OpenKey(key))),
                ERROR_FILE_NOT_FOUND => Ok(None),
                other => Err(access_error(other, root, path, "open")),
            }
        }

        fn open_existing(
            &self,
            root: RegistryRoot,
            path: &str,
            access: REG_SAM_FLAGS,
        ) -> Result<OpenKey> {
            self.open(root, path, access)?
                .ok_or_else(|| RegistryAccessError::missing_key(key_display(root, path)).into())
        }

        fn query(&self, key: &OpenKey, name: &[u16]) -> Result<Option<(u32, Vec<u8>)>> {
            let mut data = vec![0u8; 256];
            loop {
                let mut reg_type = REG_VALUE_TYPE::default();
                let mut size = data.len() as u32;
                let status = unsafe {
                    RegQueryValueExW(
                        key.0,
                        PCWSTR::from_raw(name.as_ptr()),
                        None,
                        Some(&mut reg_type as *mut REG_VALUE_TYPE),
                        Some(data.as_mut_ptr()),
                        Some(&mut size as *mut u32),
                    )
                };
                match status {
                    ERROR_SUCCESS => {
                        data.truncate(size as usize);
                        return Ok(Some((reg_type.0, data)));
                    }
                    ERROR_MORE_DATA => data.resize(size as usize, 0),
                    ERROR_FILE_NOT_FOUND => return Ok(None),
                    other => bail!("reading a registry value failed with Win32 error {}", other.0),
                }
            }
        }
    }

    impl RegistryView for WindowsRegistryView {
        fn bitness(&self) -> RegistryBitness {
            self.bitness
        }

        fn open_key(&self, root: RegistryRoot, path: &str) -> Result<bool> {
            if split_key_path(path).is_empty() {
                return Ok(true);
            }
            Ok(self.open(root, path, KEY_READ)?.is_some())
        }

        fn create_key(&mut self, root: RegistryRoot, path: &str) -> Result<()> {
            let segments = split_key_path(path);
            if segments.is_empty() {
                return Ok(());
            }
            let sub_key = wide(&segments.join("\\"));
            let mut key = HKEY::default();
            let status = unsafe {
                RegCreateKeyExW(
                    root_key(root),
                    PCWSTR::from_raw(sub_key.as_ptr()),
                    None,
                    PCWSTR::null(),
                    REG_OPTION_NON_VOLATILE,
                    KEY_ALL_ACCESS | self.view_flag(),
                    None,
                    &mut key,
                    None,
                )
            };
            if status != ERROR_SUCCESS {
                return Err(access_error(status, root, path, "create"));
            }
            drop(OpenKey(key));
            Ok(())
        }

        fn delete_key(&mut self, root: RegistryRoot, path: &str) -> Result<()> {
            let segments = split_key_path(path);
            if segments.is_empty() {
                bail!("refusing to delete registry root {}", root.as_str());
            }
            let Some(key) = self.open(root, path, KEY_ALL_ACCESS)? else {
                return Ok(());
            };
            // Empty the key inside its own view, then remove it from the same view.
            let status = unsafe { RegDeleteTreeW(key.0, PCWSTR::null()) };
            if status != ERROR_SUCCESS {
                return Err(access_error(status, root, path, "delete tree"));
            }
            drop(key);
            let sub_key = wide(&segments.join("\\"));
            let status = unsafe {
                RegDeleteKeyExW(
                    root_key(root),
                    PCWSTR::from_raw(sub_key.as_ptr()),
                    self.view_flag().0,
                    None,
                )
            };
            match status {
                ERROR_SUCCESS | ERROR_FILE_NOT_FOUND => Ok(()),
                other => Err(access_error(other, root, path, "delete")),
            }
        }

        fn enumerate(&self, root: RegistryRoot, path: &str) -> Result<KeyListing> {
            let key = self.open_existing(root, path, KEY_READ)?;
            let mut listing = KeyListing::default();

            let mut name = vec![0u16; MAX_KEY_NAME];
            for index in 0.. {
                let mut len = name.len() as u32;
                let status = unsafe {
                    RegEnumKeyExW(
                        key.0,
                        index,
                        PWSTR::from_raw(name.as_mut_ptr()),
                        &mut len,
                        None,
                        PWSTR::null(),
                        None,
                        None,
                    )
                };
                match status {
                    ERROR_SUCCESS => listing
                        .subkeys
                        .push(String::from_utf16_lossy(&name[..len as usize])),
                    ERROR_NO_MORE_ITEMS => break,
                    other => return Err(access_error(other, root, path, "enumerate keys")),
                }
            }

            let mut name = vec![0u16; MAX_VALUE_NAME];
            for index in 0.. {
                let mut len = name.len() as u32;
                let status = unsafe {
                    RegEnumValueW(
                        key.0,
                        index,
                        PWSTR::from_raw(name.as_mut_ptr()),
                        &mut len,
                        None,
                        None,
                        None,
                        None,
                    )
                };
                match status {
                    ERROR_SUCCESS => {
                        let value_name = &name[..len as usize];
                        let terminated = value_name
                            .iter()
                            .copied()
                            .chain(std::iter::once(0))
                            .collect::<Vec<_>>();
                        let Some((reg_type, data)) = self.query(&key, &terminated)? else {
                            continue;
                        };
                        let display = (!value_name.is_empty())
                            .then(|| String::from_utf16_lossy(value_name));
                        listing
                            .values
                            .push((display, decode_reg_data(reg_type, &data)?));
                    }
                    ERROR_NO_MORE_ITEMS => break,
                    other => return Err(access_error(other, root, path, "enumerate values")),
                }
            }
            Ok(listing)
        }

        fn get_value(
            &self,
            root: RegistryRoot,
            path: &str,
            name: Option<&str>,
        ) -> Result<Option<RegistryValue>> {
            let Some(key) = self.open(root, path, KEY_READ)? else {
                return Ok(None);
            };
            self.query(&key, &wide(name.unwrap_or_default()))?
                .map(|(reg_type, data)| decode_reg_data(reg_type, &data))
                .transpose()
        }

        fn set_value(
            &mut self,
            root: RegistryRoot,
            path: &str,
            name: Option<&str>,
            value: &RegistryValue,
        ) -> Result<()> {
            let key = self.open_existing(root, path, KEY_SET_VALUE)?;
            let (reg_type, data) = encode_reg_data(value);
            let value_name = wide(name.unwrap_or_default());
            let status = unsafe {
                RegSetValueExW(
                    key.0,
                    PCWSTR::from_raw(value_name.as_ptr()),
                    None,
                    REG_VALUE_TYPE(reg_type),
                    Some(data.as_slice()),
                )
            };
            if status != ERROR_SUCCESS {
                return Err(access_error(status, root, path, "set value"));
            }
            Ok(())
        }

        fn delete_value(
            &mut self,
            root: RegistryRoot,
            path: &str,
            name: Option<&str>,
        ) -> Result<bool> {
            let Some(key) = self.open(root, path, KEY_SET_VALUE)? else {
                return Ok(false);
            };
            let value_name = wide(name.unwrap_or_default());
            let status = unsafe { RegDeleteValueW(key.0, PCWSTR::from_raw(value_name.as_ptr())) };
            match status {
                ERROR_SUCCESS => Ok(true),
                ERROR_FILE_NOT_FOUND => Ok(false),
                other => Err(access_error(other, root, path, "delete value")),
            }
        }
    }

    /// The live registry. Every call takes effect immediately, so `persist` has nothing to do.
    pub struct WindowsRegistry {
        native: WindowsRegistryView,
        wow32: WindowsRegistryView,
    }

    impl Default for WindowsRegistry {
        fn default() -> Self {
            Self {
                native: WindowsRegistryView {
                    bitness: RegistryBitness::Native,
                },
                wow32: WindowsRegistryView {
                    bitness: RegistryBitness::Bit32,
                },
            }
        }
    }

    impl RegistryBackend for WindowsRegistry {
        fn view(&mut self, bitness: RegistryBitness) -> &mut dyn RegistryView {
            match bitness {
                RegistryBitness::Native => &mut self.native,
                RegistryBitness::Bit32 => &mut self.wow32,
            }
        }
    }
}
