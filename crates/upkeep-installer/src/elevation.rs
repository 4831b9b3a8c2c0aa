use std::fs;
use std::path::Path;

use upkeep_core::UpdateDetails;

use crate::error::ElevationRequiredError;
use crate::layout::PlatformConfig;

/// Decides, before anything is touched, whether this process may apply `details`.
///
/// Always passes for the elevated instance. Otherwise the install directory and the registry
/// hive must be writable, and on Windows machine-wide registry roots and service control
/// require elevation.
pub fn check_elevation(
    config: &PlatformConfig,
    details: &UpdateDetails,
) -> Result<(), ElevationRequiredError> {
    if config.is_elevated() {
        return Ok(());
    }

    if !dir_writable(config.install_dir()) {
        return Err(ElevationRequiredError {
            reason: format!(
                "install directory {} is not writable",
                config.install_dir().display()
            ),
        });
    }

    if !details.registry_changes.is_empty() {
        if let Some(hive_dir) = config.registry_hive().parent() {
            if !dir_writable(hive_dir) {
                return Err(ElevationRequiredError {
                    reason: format!("registry hive {} is not writable", hive_dir.display()),
                });
            }
        }
    }

    if cfg!(windows) {
        if let Some(change) = details
            .registry_changes
            .iter()
            .find(|change| change.root.is_machine_wide())
        {
            return Err(ElevationRequiredError {
                reason: format!("registry change {} is machine-wide", change.display_path()),
            });
        }
        if !details.services_to_stop.is_empty() || !details.services_to_start.is_empty() {
            return Err(ElevationRequiredError {
                reason: "the update controls system services".to_string(),
            });
        }
    }
    Ok(())
}

/// Tests `dir`, or its nearest existing ancestor, by creating and removing a file.
pub fn dir_writable(dir: &Path) -> bool {
    let Some(existing) = dir.ancestors().find(|ancestor| ancestor.exists()) else {
        return false;
    };
    if !existing.is_dir() {
        return false;
    }
    let marker = existing.join(format!(".upkeep-write-check-{}", std::process::id()));
    match fs::write(&marker, b"") {
        Ok(()) => {
            let _ = fs::remove_file(&marker);
            true
        }
        Err(_) => false,
    }
}
