use std::sync::atomic::Ordering;

use upkeep_installer::CancelFlag;
use upkeep_ipc::{IpcAction, IpcMessage, UpdateStep};

use crate::collaborators::UpdateSource;

/// Program to start once the update is installed, as sent with `RestartInfo`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestartInfo {
    pub program: Option<String>,
    pub arguments: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Handled {
    Reply(IpcMessage),
    /// The peer asked for the installation to begin.
    StartInstall,
    Nothing,
}

/// Answers requests arriving over the pipe.
pub struct RequestHandler {
    cancel: CancelFlag,
    restart: RestartInfo,
    source: Option<Box<dyn UpdateSource>>,
}

impl RequestHandler {
    pub fn new(cancel: CancelFlag) -> Self {
        Self {
            cancel,
            restart: RestartInfo::default(),
            source: None,
        }
    }

    pub fn with_source(mut self, source: Box<dyn UpdateSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn restart_info(&self) -> &RestartInfo {
        &self.restart
    }

    pub fn handle(&mut self, message: &IpcMessage) -> Handled {
        match message.action {
            IpcAction::GetProcessId => Handled::Reply(IpcMessage::process_id_reply()),
            IpcAction::Cancel => {
                tracing::info!("cancel requested over ipc");
                self.cancel.store(true, Ordering::SeqCst);
                Handled::Nothing
            }
            IpcAction::NewProcess => Handled::Nothing,
            IpcAction::UpdateStep => self.handle_step(message),
        }
    }

    fn handle_step(&mut self, message: &IpcMessage) -> Handled {
        let step = message.step;
        match step {
            UpdateStep::Install => Handled::StartInstall,
            UpdateStep::RestartInfo => {
                let text_at = |index: usize| {
                    message
                        .extra_strings
                        .get(index)
                        .map(|extra| extra.text.clone())
                        .filter(|text| !text.is_empty())
                };
                self.restart = RestartInfo {
                    program: text_at(0),
                    arguments: text_at(1),
                };
                tracing::debug!(restart = ?self.restart, "stored restart info");
                Handled::Reply(IpcMessage::succeeded(step))
            }
            _ => match self.source.as_mut() {
                Some(source) => match source.handle(step, message) {
                    Ok(reply) => Handled::Reply(reply),
                    Err(err) => Handled::Reply(IpcMessage::failed(
                        step,
                        "Update step failed",
                        format!("{err:#}"),
                    )),
                },
                None => Handled::Reply(IpcMessage::failed(
                    step,
                    "Not supported",
                    "no update source is configured",
                )),
            },
        }
    }
}
