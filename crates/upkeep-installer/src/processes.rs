use std::path::Path;

use anyhow::Result;
use sysinfo::{ProcessesToUpdate, System};

use crate::platform::{ProcessScanner, RunningProcess};

/// Process table lookups through `sysinfo`.
pub struct SystemProcessScanner {
    system: System,
}

impl Default for SystemProcessScanner {
    fn default() -> Self {
        Self {
            system: System::new(),
        }
    }
}

impl ProcessScanner for SystemProcessScanner {
    fn running_under(&mut self, dir: &Path, exclude: &[u32]) -> Result<Vec<RunningProcess>> {
        self.system.refresh_processes(ProcessesToUpdate::All, true);
        let mut found = self
            .system
            .processes()
            .iter()
            .filter(|(pid, _)| !exclude.contains(&pid.as_u32()))
            .filter_map(|(pid, process)| {
                let exe = process.exe()?;
                exe.starts_with(dir).then(|| RunningProcess {
                    pid: pid.as_u32(),
                    name: process.name().to_string_lossy().into_owned(),
                    exe: exe.to_path_buf(),
                })
            })
            .collect::<Vec<_>>();
        found.sort_by_key(|process| process.pid);
        Ok(found)
    }
}
