mod config;
mod elevation;
mod error;
mod executor;
mod fs_utils;
mod handoff;
mod journal;
mod layout;
mod native;
mod pipeline;
mod platform;
mod processes;
mod registry_view;
mod rollback;
mod session;
mod system_registry;

pub use config::{instance_key, ConfigFile, ConfigOverrides, NotifySection, CONFIG_FILE_NAME};
pub use elevation::{check_elevation, dir_writable};
pub use error::{
    is_caused_by, CancelledError, ElevationRequiredError, PatchApplicationError,
    RegistryAccessError, RegistryAccessKind,
};
pub use executor::{apply_registry_change, revert_registry_change, FileTransaction};
pub use fs_utils::{copy_dir_recursive, list_files, remove_dir_if_exists, remove_file_if_exists};
pub use handoff::{ProxySettings, SelfUpdateHandoff, HANDOFF_MAGIC};
pub use journal::{JournalEntry, JournalPhase, RollbackJournal, JOURNAL_MAGIC};
pub use layout::{
    default_state_dir, NotifySettings, PackageLayout, PlatformConfig, CLIENT_MANIFEST_FILE,
    DEFAULT_PROCESS_POLL, UPDATE_DETAILS_FILE,
};
pub use native::{
    CommandPatchApplier, CommandServiceController, DescriptorShortcutInstaller,
    LoggingAssemblyRegistrar, SystemProgramRunner,
};
pub use pipeline::{
    journal_phase, rollback_order, transition, CancelFlag, Pipeline, PipelineEvent, StageFailure,
    StageResult, StageWork,
};
pub use platform::{
    run_command, split_command_line, AssemblyRegistrar, PatchApplier, Platform, ProcessScanner,
    ProgramRunner, RunningProcess, ServiceController, ShortcutInstaller,
};
pub use processes::SystemProcessScanner;
pub use registry_view::{
    HiveRegistry, KeyListing, MemoryRegistry, MemoryRegistryView, RegistryBackend,
    RegistryBitness, RegistryView,
};
pub use rollback::{replay_journal, revert_entry, RollbackFailure, RollbackReport};
pub use session::{SelfUpdateState, SessionState, UpdateStage, SESSION_STATE_MAGIC};
pub use system_registry::{decode_reg_data, encode_reg_data};
#[cfg(windows)]
pub use system_registry::WindowsRegistry;
