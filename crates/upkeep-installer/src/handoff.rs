use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;
use upkeep_core::tlv::{read_fields, FieldReader, FieldWriter, TlvResult, END_MARKER};

use crate::fs_utils::{remove_file_if_exists, write_atomic};

pub const HANDOFF_MAGIC: &[u8] = b"IUSUFV2";

const TAG_CLIENT_FILE: u8 = 0x01;
const TAG_SERVER_FILE: u8 = 0x02;
const TAG_SELF_SERVER_FILE: u8 = 0x03;
const TAG_BASE_DIRECTORY: u8 = 0x04;
const TAG_TEMP_DIRECTORY: u8 = 0x05;
const TAG_OLD_SELF_PATH: u8 = 0x06;
const TAG_WILL_SELF_UPDATE: u8 = 0x07;
const TAG_NEEDS_ELEVATION: u8 = 0x08;
const TAG_IS_AUTOMATIC: u8 = 0x09;
const TAG_IS_NEW_SELF: u8 = 0x0A;
const TAG_FROM_SERVICE: u8 = 0x0B;
const TAG_PROXY_URL: u8 = 0x0C;
const TAG_PROXY_USER: u8 = 0x0D;
const TAG_PROXY_PASSWORD: u8 = 0x0E;
const TAG_PROXY_DOMAIN: u8 = 0x0F;
const TAG_LOG_FILE: u8 = 0x10;
const TAG_OLD_SELF_PID: u8 = 0x11;
const TAG_HAS_PROXY: u8 = 0x12;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProxySettings {
    pub url: Option<String>,
    pub user: Option<String>,
    #[serde(skip_serializing)]
    pub password: Option<String>,
    pub domain: Option<String>,
}

impl ProxySettings {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

/// Everything the freshly installed updater needs to pick up where the old one stopped.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SelfUpdateHandoff {
    pub client_file: Option<String>,
    pub server_file: Option<String>,
    pub self_server_file: Option<String>,
    pub base_directory: Option<String>,
    pub temp_directory: Option<String>,
    pub old_self_path: Option<String>,
    pub old_self_pid: Option<u32>,
    pub will_self_update: bool,
    pub needs_elevation: bool,
    pub is_automatic: bool,
    pub is_new_self: bool,
    pub updating_from_service: bool,
    pub proxy: Option<ProxySettings>,
    pub log_file: Option<String>,
}

impl SelfUpdateHandoff {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = FieldWriter::with_header(HANDOFF_MAGIC);
        out.opt_string(TAG_CLIENT_FILE, self.client_file.as_deref());
        out.opt_string(TAG_SERVER_FILE, self.server_file.as_deref());
        out.opt_string(TAG_SELF_SERVER_FILE, self.self_server_file.as_deref());
        out.opt_string(TAG_BASE_DIRECTORY, self.base_directory.as_deref());
        out.opt_string(TAG_TEMP_DIRECTORY, self.temp_directory.as_deref());
        out.opt_string(TAG_OLD_SELF_PATH, self.old_self_path.as_deref());
        if let Some(pid) = self.old_self_pid {
            out.i64(TAG_OLD_SELF_PID, i64::from(pid));
        }
        out.true_flag(TAG_WILL_SELF_UPDATE, self.will_self_update);
        out.true_flag(TAG_NEEDS_ELEVATION, self.needs_elevation);
        out.true_flag(TAG_IS_AUTOMATIC, self.is_automatic);
        out.true_flag(TAG_IS_NEW_SELF, self.is_new_self);
        out.true_flag(TAG_FROM_SERVICE, self.updating_from_service);
        if let Some(proxy) = &self.proxy {
            // Marks the proxy as present even when every field of it is unset.
            out.true_flag(TAG_HAS_PROXY, true);
            out.opt_string(TAG_PROXY_URL, proxy.url.as_deref());
            out.opt_string(TAG_PROXY_USER, proxy.user.as_deref());
            out.opt_string(TAG_PROXY_PASSWORD, proxy.password.as_deref());
            out.opt_string(TAG_PROXY_DOMAIN, proxy.domain.as_deref());
        }
        out.opt_string(TAG_LOG_FILE, self.log_file.as_deref());
        out.marker(END_MARKER);
        out.into_bytes()
    }

    pub fn from_bytes(bytes: &[u8]) -> TlvResult<Self> {
        let mut reader = FieldReader::new(bytes);
        reader.expect_header(HANDOFF_MAGIC)?;

        let mut handoff = Self::default();
        let mut proxy = ProxySettings::default();
        let mut has_proxy = false;
        read_fields(&mut reader, END_MARKER, |tag, r| {
            match tag {
                TAG_CLIENT_FILE => handoff.client_file = Some(r.read_string()?),
                TAG_SERVER_FILE => handoff.server_file = Some(r.read_string()?),
                TAG_SELF_SERVER_FILE => handoff.self_server_file = Some(r.read_string()?),
                TAG_BASE_DIRECTORY => handoff.base_directory = Some(r.read_string()?),
                TAG_TEMP_DIRECTORY => handoff.temp_directory = Some(r.read_string()?),
                TAG_OLD_SELF_PATH => handoff.old_self_path = Some(r.read_string()?),
                TAG_OLD_SELF_PID => handoff.old_self_pid = u32::try_from(r.read_i64()?).ok(),
                TAG_WILL_SELF_UPDATE => handoff.will_self_update = r.read_bool()?,
                TAG_NEEDS_ELEVATION => handoff.needs_elevation = r.read_bool()?,
                TAG_IS_AUTOMATIC => handoff.is_automatic = r.read_bool()?,
                TAG_IS_NEW_SELF => handoff.is_new_self = r.read_bool()?,
                TAG_FROM_SERVICE => handoff.updating_from_service = r.read_bool()?,
                TAG_HAS_PROXY => has_proxy = r.read_bool()?,
                TAG_PROXY_URL => proxy.url = Some(r.read_string()?),
                TAG_PROXY_USER => proxy.user = Some(r.read_string()?),
                TAG_PROXY_PASSWORD => proxy.password = Some(r.read_string()?),
                TAG_PROXY_DOMAIN => proxy.domain = Some(r.read_string()?),
                TAG_LOG_FILE => handoff.log_file = Some(r.read_string()?),
                _ => return Ok(false),
            }
            Ok(true)
        })?;
        reader.finish()?;

        // Files without the presence flag imply a proxy from any of its fields.
        if has_proxy || !proxy.is_empty() {
            handoff.proxy = Some(proxy);
        }
        Ok(handoff)
    }

    pub fn load(path: &Path) -> Result<Option<Self>> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to read self-update file: {}", path.display()))
            }
        };
        Self::from_bytes(&bytes)
            .map(Some)
            .with_context(|| format!("failed to decode self-update file: {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        write_atomic(path, &self.to_bytes())
            .with_context(|| format!("failed to write self-update file: {}", path.display()))
    }

    pub fn delete(path: &Path) -> Result<()> {
        remove_file_if_exists(path)
            .with_context(|| format!("failed to remove self-update file: {}", path.display()))
    }
}
