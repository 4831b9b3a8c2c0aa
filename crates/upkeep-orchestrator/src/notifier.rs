use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use upkeep_installer::{NotifySettings, PipelineEvent, UpdateStage};
use upkeep_ipc::{
    IpcMessage, PipeClient, PipeServer, ResponseKind, RetryPolicy, TransportError, UpdateStep,
};

/// Somewhere IPC notifications can be pushed.
pub trait MessageSink: Send + Sync {
    /// Number of peers that took the message; zero means nobody is listening yet.
    fn broadcast(&self, message: &IpcMessage) -> Result<usize, TransportError>;
}

impl MessageSink for PipeServer {
    fn broadcast(&self, message: &IpcMessage) -> Result<usize, TransportError> {
        self.send_to_all(message)
    }
}

impl MessageSink for PipeClient {
    fn broadcast(&self, message: &IpcMessage) -> Result<usize, TransportError> {
        self.send(message)?;
        Ok(1)
    }
}

pub fn retry_policy(settings: NotifySettings) -> RetryPolicy {
    RetryPolicy {
        max_attempts: settings.max_attempts,
        initial_backoff: settings.initial_backoff,
        max_backoff: settings.max_backoff,
    }
}

/// Pushes session progress to IPC peers.
///
/// Results (`Succeeded`/`Failed`) always get the full retry policy. Progress updates get it too
/// until one delivery runs out of attempts; after that they are tried once each until a peer
/// shows up again.
pub struct Notifier {
    sink: Arc<dyn MessageSink>,
    policy: RetryPolicy,
    unreachable: AtomicBool,
}

impl Notifier {
    pub fn new(sink: Arc<dyn MessageSink>, policy: RetryPolicy) -> Self {
        Self {
            sink,
            policy,
            unreachable: AtomicBool::new(false),
        }
    }

    pub fn notify(&self, message: &IpcMessage) -> Result<u32, TransportError> {
        let mut policy = self.policy;
        if message.response == ResponseKind::Progress && self.unreachable.load(Ordering::SeqCst) {
            policy.max_attempts = 1;
        }
        let delivered = policy.deliver(|| Ok(self.sink.broadcast(message)? > 0));
        match &delivered {
            Ok(_) => self.unreachable.store(false, Ordering::SeqCst),
            Err(TransportError::NotDelivered { .. }) => self.unreachable.store(true, Ordering::SeqCst),
            Err(_) => {}
        }
        delivered
    }
}

fn stage_percent(stage: UpdateStage) -> u8 {
    let position = UpdateStage::MAIN
        .iter()
        .position(|candidate| *candidate == stage)
        .unwrap_or(0);
    (position * 100 / UpdateStage::MAIN.len()) as u8
}

/// The IPC message a pipeline event turns into, if peers care about it.
pub fn message_for_event(event: &PipelineEvent) -> Option<IpcMessage> {
    let step = UpdateStep::Install;
    match event {
        PipelineEvent::StageStarted(stage) => Some(IpcMessage::progress(
            step,
            stage_percent(*stage),
            stage.as_str(),
        )),
        PipelineEvent::Progress {
            percent, status, ..
        } => Some(IpcMessage::progress(step, *percent, status.clone())),
        PipelineEvent::WaitingForProcesses(processes) => {
            let names = processes
                .iter()
                .map(|process| process.name.as_str())
                .collect::<Vec<_>>()
                .join(", ");
            Some(IpcMessage::progress(
                step,
                0,
                format!("Waiting for {names} to close"),
            ))
        }
        PipelineEvent::RollingBack(stage) => Some(IpcMessage::progress(
            step,
            0,
            format!("Rolling back {stage}"),
        )),
        PipelineEvent::Finished => Some(IpcMessage::succeeded(step)),
        PipelineEvent::StageCompleted(_) | PipelineEvent::RolledBack(_) => None,
    }
}

/// Copies every pipeline event to `owner` and, when present, to IPC peers. Ends once every
/// pipeline sender is gone.
pub fn forward_events(
    events: Receiver<PipelineEvent>,
    owner: Option<Sender<PipelineEvent>>,
    notifier: Option<Arc<Notifier>>,
) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("upkeep-events".to_string())
        .spawn(move || {
            for event in events {
                if let Some(notifier) = &notifier {
                    if let Some(message) = message_for_event(&event) {
                        if let Err(err) = notifier.notify(&message) {
                            tracing::warn!(error = %err, "progress notification not delivered");
                        }
                    }
                }
                if let Some(owner) = &owner {
                    let _ = owner.send(event);
                }
            }
        })
}
