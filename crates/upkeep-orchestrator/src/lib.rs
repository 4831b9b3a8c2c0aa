mod collaborators;
mod driver;
mod notifier;
mod requests;
mod self_update;
mod service;

pub use collaborators::{
    CommandDownloader, CommandExtractor, Downloader, Extractor, Launcher, ProcessLauncher,
    SelfUpdateTools, UpdateSource,
};
pub use driver::{stage_failure, SessionHandle, SessionOutcome, SessionRequest, UpdateSession};
pub use notifier::{forward_events, message_for_event, retry_policy, MessageSink, Notifier};
pub use requests::{Handled, RequestHandler, RestartInfo};
pub use self_update::{
    attach_to_previous_self, cleanup_self_update, relaunch_arguments, PayloadSignature,
    SelfUpdateDir, SelfUpdateOutcome, SelfUpdatePlan, SelfUpdater, HANDOFF_FLAG,
};
pub use service::{answer_relayed_requests, UpdateService};

#[cfg(test)]
mod tests;
