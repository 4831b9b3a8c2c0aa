mod file_change;
mod registry;
mod shortcut;
pub mod tlv;
mod update_details;

pub use file_change::{
    join_relative, ComRegistration, CpuArch, ElevationType, FileChange, FrameworkVersion,
};
pub use registry::{
    split_key_path, RegistryChange, RegistryOperation, RegistryRoot, RegistryValue,
    RegistryValueKind,
};
pub use shortcut::ShortcutRecord;
pub use tlv::{CorruptDataError, Timestamp, TlvRecord};
pub use update_details::{ServiceStart, UpdateDetails, UPDATE_DETAILS_MAGIC};

#[cfg(test)]
mod tests;
