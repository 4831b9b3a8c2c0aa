use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use upkeep_installer::PlatformConfig;
use upkeep_ipc::{
    ClientEvent, ConnectionId, IpcAction, IpcMessage, PipeClient, PipeServer, ServerEvent,
};

use crate::collaborators::UpdateSource;
use crate::driver::{SessionHandle, SessionOutcome, SessionRequest, UpdateSession};
use crate::requests::{Handled, RequestHandler};
use crate::self_update::cleanup_self_update;

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const RELAY_ATTACH_TIMEOUT: Duration = Duration::from_secs(120);

/// Serves one update session over a pipe server: answers requests, starts the session on
/// `Install` and, after a self-update hand-off, stays up to relay until the successor leaves.
pub struct UpdateService {
    config: PlatformConfig,
    server: Arc<PipeServer>,
    handler: RequestHandler,
    pending: Option<UpdateSession>,
    request: SessionRequest,
    running: Option<SessionHandle>,
    relay: Option<ConnectionId>,
}

impl UpdateService {
    pub fn new(server: Arc<PipeServer>, session: UpdateSession, request: SessionRequest) -> Self {
        Self {
            config: session.config().clone(),
            server,
            handler: RequestHandler::new(session.cancel_flag()),
            pending: Some(session),
            request,
            running: None,
            relay: None,
        }
    }

    pub fn with_source(mut self, source: Box<dyn UpdateSource>) -> Self {
        self.handler = self.handler.with_source(source);
        self
    }

    /// Starts the session without waiting for an `Install` request.
    pub fn start_now(&mut self) -> Result<()> {
        self.start_session()
    }

    /// Processes server events until the session is over. Returns `None` when every sender went
    /// away before a session was started.
    pub fn run(mut self, events: Receiver<ServerEvent>) -> Result<Option<SessionOutcome>> {
        let mut outcome: Option<SessionOutcome> = None;
        let mut handed_off_at: Option<Instant> = None;
        loop {
            match events.recv_timeout(POLL_INTERVAL) {
                Ok(ServerEvent::Message { from, message }) => {
                    if message.action == IpcAction::NewProcess {
                        tracing::info!(connection = from, "successor updater attached");
                        self.relay = Some(from);
                    }
                    self.on_message(from, &message)?;
                }
                Ok(ServerEvent::Disconnected(id)) if self.relay == Some(id) => {
                    tracing::info!(connection = id, "successor updater detached");
                    self.relay = None;
                    if let Some(SessionOutcome::HandedOff(hand_off)) = &outcome {
                        if let Err(err) = cleanup_self_update(&self.config, &hand_off.session_id) {
                            tracing::warn!(
                                error = %format!("{err:#}"),
                                "failed to remove self-update files"
                            );
                        }
                        return Ok(outcome);
                    }
                }
                Ok(_) | Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    if self.running.is_none() {
                        return Ok(outcome);
                    }
                }
            }

            if let Some(result) = self.poll_session() {
                match result? {
                    handed_off @ SessionOutcome::HandedOff(_) => {
                        outcome = Some(handed_off);
                        handed_off_at = Some(Instant::now());
                    }
                    installed => return Ok(Some(installed)),
                }
            }

            if let Some(since) = handed_off_at {
                if self.relay.is_none() && since.elapsed() > RELAY_ATTACH_TIMEOUT {
                    tracing::warn!("successor updater never attached; stopping");
                    return Ok(outcome);
                }
            }
        }
    }

    fn on_message(&mut self, from: ConnectionId, message: &IpcMessage) -> Result<()> {
        match self.handler.handle(message) {
            Handled::Reply(reply) => {
                if let Err(err) = self.server.send_to(from, &reply) {
                    tracing::warn!(connection = from, error = %err, "failed to reply");
                }
            }
            Handled::StartInstall => {
                if self.pending.is_some() {
                    self.start_session()?;
                } else {
                    tracing::debug!(connection = from, "install already started");
                }
            }
            Handled::Nothing => {}
        }
        Ok(())
    }

    fn start_session(&mut self) -> Result<()> {
        let Some(session) = self.pending.take() else {
            bail!("the session has already been started");
        };
        let restart = self.handler.restart_info();
        if restart.program.is_some() {
            self.request.file_to_execute_after_update = restart.program.clone();
            self.request.post_update_arguments = restart.arguments.clone();
        }
        tracing::info!("starting update session");
        self.running = Some(session.spawn(self.request.clone())?);
        Ok(())
    }

    fn poll_session(&mut self) -> Option<Result<SessionOutcome>> {
        let handle = self.running.as_ref()?;
        while let Ok(event) = handle.events().try_recv() {
            tracing::debug!(?event, "pipeline event");
        }
        if !handle.is_finished() {
            return None;
        }
        self.running.take().map(SessionHandle::join)
    }
}

/// Successor side: answers requests the previous updater relays from its peers.
pub fn answer_relayed_requests(
    client: Arc<PipeClient>,
    events: Receiver<ClientEvent>,
    mut handler: RequestHandler,
) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("upkeep-relayed-requests".to_string())
        .spawn(move || {
            for event in events {
                let message = match event {
                    ClientEvent::Message(message) => message,
                    ClientEvent::Disconnected => break,
                };
                if message.is_relay_rejection() {
                    tracing::warn!("previous updater already relays for another process");
                    client.close();
                    break;
                }
                match handler.handle(&message) {
                    Handled::Reply(reply) => {
                        if let Err(err) = client.send(&reply) {
                            tracing::warn!(error = %err, "failed to answer relayed request");
                        }
                    }
                    Handled::StartInstall | Handled::Nothing => {}
                }
            }
        })
}
