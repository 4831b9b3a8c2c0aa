use std::collections::BTreeMap;
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, warn};
use upkeep_core::TlvRecord;

use crate::channel::Endpoint;
use crate::error::TransportError;
use crate::frame::{encode_frame, FrameReader, DEFAULT_MAX_FRAME_BYTES};
use crate::message::{IpcAction, IpcMessage};
use crate::pipe::{PipeListener, PipeStream};

pub type ConnectionId = u64;

const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    Connected(ConnectionId),
    Message {
        from: ConnectionId,
        message: IpcMessage,
    },
    Disconnected(ConnectionId),
}

type DisconnectCallback = Box<dyn Fn(ConnectionId) + Send + Sync>;

#[derive(Default)]
struct ConnectionSet {
    writers: BTreeMap<ConnectionId, PipeStream>,
    relay: Option<ConnectionId>,
}

impl ConnectionSet {
    fn write_to(&mut self, id: ConnectionId, frame: &[u8]) -> Result<(), TransportError> {
        let writer = self
            .writers
            .get_mut(&id)
            .ok_or(TransportError::UnknownConnection(id))?;
        if let Err(err) = writer.write_all(frame).and_then(|()| writer.flush()) {
            warn!(connection = id, error = %err, "dropping connection after failed write");
            if let Some(writer) = self.writers.remove(&id) {
                writer.shutdown();
            }
            return Err(err.into());
        }
        Ok(())
    }

    fn broadcast(&mut self, frame: &[u8], include: impl Fn(ConnectionId) -> bool) -> usize {
        let targets = self
            .writers
            .keys()
            .copied()
            .filter(|id| include(*id))
            .collect::<Vec<_>>();
        targets
            .into_iter()
            .filter(|id| self.write_to(*id, frame).is_ok())
            .count()
    }
}

struct Shared {
    connections: Mutex<ConnectionSet>,
    on_disconnect: Mutex<Option<DisconnectCallback>>,
    stopping: AtomicBool,
    next_id: AtomicU64,
    max_frame_bytes: usize,
}

impl Shared {
    fn connections(&self) -> MutexGuard<'_, ConnectionSet> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn designate_relay(&self, id: ConnectionId) -> Result<(), TransportError> {
        let mut set = self.connections();
        if !set.writers.contains_key(&id) {
            return Err(TransportError::UnknownConnection(id));
        }
        if let Some(active) = set.relay {
            return Err(TransportError::RelayAlreadyActive { active });
        }
        set.relay = Some(id);
        info!(connection = id, "relay target designated");
        Ok(())
    }

    fn dispatch(&self, from: ConnectionId, frame: Vec<u8>, events: &Sender<ServerEvent>) {
        let decoded = IpcMessage::decode(&frame);

        if let Ok(message) = &decoded {
            if message.action == IpcAction::NewProcess {
                match self.designate_relay(from) {
                    Ok(()) => {
                        let _ = events.send(ServerEvent::Message {
                            from,
                            message: message.clone(),
                        });
                    }
                    Err(err) => {
                        warn!(connection = from, error = %err, "relay designation rejected");
                        self.reply(from, &IpcMessage::relay_rejected(err.to_string()));
                    }
                }
                return;
            }
        }

        {
            let mut set = self.connections();
            if let Some(relay) = set.relay {
                let wire = match encode_frame(&frame, self.max_frame_bytes) {
                    Ok(wire) => wire,
                    Err(err) => {
                        warn!(connection = from, error = %err, "relay frame rejected");
                        return;
                    }
                };
                let forwarded = if from == relay {
                    set.broadcast(&wire, |id| id != relay)
                } else {
                    set.broadcast(&wire, |id| id == relay)
                };
                debug!(from, relay, forwarded, "frame relayed");
                return;
            }
        }

        match decoded {
            Ok(message) => {
                let _ = events.send(ServerEvent::Message { from, message });
            }
            Err(err) => warn!(connection = from, error = %err, "discarding undecodable message"),
        }
    }

    fn reply(&self, to: ConnectionId, message: &IpcMessage) {
        let sent = encode_frame(&message.encode(), self.max_frame_bytes)
            .and_then(|wire| self.connections().write_to(to, &wire));
        if let Err(err) = sent {
            warn!(connection = to, error = %err, "failed to answer peer");
        }
    }

    fn disconnect(&self, id: ConnectionId, events: &Sender<ServerEvent>) {
        {
            let mut set = self.connections();
            if let Some(writer) = set.writers.remove(&id) {
                writer.shutdown();
            }
            if set.relay == Some(id) {
                set.relay = None;
                info!(connection = id, "relay target disconnected");
            }
        }
        debug!(connection = id, "client disconnected");
        let _ = events.send(ServerEvent::Disconnected(id));
        let callback = self
            .on_disconnect
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(callback) = callback.as_ref() {
            callback(id);
        }
    }
}

/// Listens on one channel, fanning messages out as [`ServerEvent`]s.
///
/// One thread accepts connections and each connection gets its own read thread. Once a peer
/// sends `NewProcess` it becomes the relay target: its frames are forwarded verbatim to every
/// other peer and theirs to it, bypassing the event channel.
pub struct PipeServer {
    endpoint: Endpoint,
    shared: Arc<Shared>,
    accept: Option<JoinHandle<()>>,
}

impl PipeServer {
    pub fn start(endpoint: Endpoint, events: Sender<ServerEvent>) -> Result<Self, TransportError> {
        Self::start_with_limit(endpoint, events, DEFAULT_MAX_FRAME_BYTES)
    }

    pub fn start_with_limit(
        endpoint: Endpoint,
        events: Sender<ServerEvent>,
        max_frame_bytes: usize,
    ) -> Result<Self, TransportError> {
        let listener = PipeListener::bind(&endpoint)?;
        let shared = Arc::new(Shared {
            connections: Mutex::new(ConnectionSet::default()),
            on_disconnect: Mutex::new(None),
            stopping: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            max_frame_bytes,
        });

        let accept_shared = Arc::clone(&shared);
        let accept = thread::Builder::new()
            .name("upkeep-ipc-accept".to_string())
            .spawn(move || accept_loop(listener, accept_shared, events))?;
        info!(channel = endpoint.channel(), "pipe server listening");

        Ok(Self {
            endpoint,
            shared,
            accept: Some(accept),
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn set_disconnect_callback(&self, callback: impl Fn(ConnectionId) + Send + Sync + 'static) {
        *self
            .shared
            .on_disconnect
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Box::new(callback));
    }

    /// Number of peers that accepted the message; zero when nobody is connected.
    pub fn send_to_all(&self, message: &IpcMessage) -> Result<usize, TransportError> {
        let wire = encode_frame(&message.encode(), self.shared.max_frame_bytes)?;
        Ok(self.shared.connections().broadcast(&wire, |_| true))
    }

    pub fn send_to(&self, id: ConnectionId, message: &IpcMessage) -> Result<(), TransportError> {
        let wire = encode_frame(&message.encode(), self.shared.max_frame_bytes)?;
        self.shared.connections().write_to(id, &wire)
    }

    pub fn send_to_all_except(
        &self,
        excluded: ConnectionId,
        message: &IpcMessage,
    ) -> Result<usize, TransportError> {
        let wire = encode_frame(&message.encode(), self.shared.max_frame_bytes)?;
        Ok(self
            .shared
            .connections()
            .broadcast(&wire, |id| id != excluded))
    }

    pub fn designate_relay(&self, id: ConnectionId) -> Result<(), TransportError> {
        self.shared.designate_relay(id)
    }

    pub fn relay_target(&self) -> Option<ConnectionId> {
        self.shared.connections().relay
    }

    pub fn connection_count(&self) -> usize {
        self.shared.connections().writers.len()
    }

    /// Stops accepting, closes every connection and joins the accept thread.
    pub fn shutdown(&mut self) {
        let Some(accept) = self.accept.take() else {
            return;
        };
        self.shared.stopping.store(true, Ordering::SeqCst);
        // A throwaway connection wakes the blocked accept call.
        let _ = PipeStream::connect(&self.endpoint);
        {
            let mut set = self.shared.connections();
            for writer in set.writers.values() {
                writer.shutdown();
            }
            set.writers.clear();
            set.relay = None;
        }
        if accept.join().is_err() {
            warn!("pipe accept thread panicked");
        }
        info!(channel = self.endpoint.channel(), "pipe server stopped");
    }
}

impl Drop for PipeServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn accept_loop(listener: PipeListener, shared: Arc<Shared>, events: Sender<ServerEvent>) {
    loop {
        let stream = match listener.accept() {
            Ok(stream) => stream,
            Err(err) => {
                if shared.stopping.load(Ordering::SeqCst) {
                    break;
                }
                warn!(error = %err, "pipe accept failed");
                thread::sleep(ACCEPT_RETRY_DELAY);
                continue;
            }
        };
        if shared.stopping.load(Ordering::SeqCst) {
            stream.shutdown();
            break;
        }
        let id = shared.next_id.fetch_add(1, Ordering::SeqCst);
        if let Err(err) = register(&shared, id, stream, events.clone()) {
            warn!(connection = id, error = %err, "failed to start connection reader");
        }
    }
}

fn register(
    shared: &Arc<Shared>,
    id: ConnectionId,
    stream: PipeStream,
    events: Sender<ServerEvent>,
) -> std::io::Result<()> {
    let writer = stream.try_clone()?;
    shared.connections().writers.insert(id, writer);
    debug!(connection = id, "client connected");
    let _ = events.send(ServerEvent::Connected(id));

    let reader_shared = Arc::clone(shared);
    let spawned = thread::Builder::new()
        .name(format!("upkeep-ipc-conn-{id}"))
        .spawn(move || read_loop(reader_shared, id, stream, events));
    if let Err(err) = spawned {
        if let Some(writer) = shared.connections().writers.remove(&id) {
            writer.shutdown();
        }
        return Err(err);
    }
    Ok(())
}

fn read_loop(shared: Arc<Shared>, id: ConnectionId, stream: PipeStream, events: Sender<ServerEvent>) {
    let mut reader = FrameReader::new(stream, shared.max_frame_bytes);
    loop {
        match reader.read_next() {
            Ok(Some(frame)) => shared.dispatch(id, frame, &events),
            Ok(None) => break,
            Err(err) => {
                if !shared.stopping.load(Ordering::SeqCst) {
                    warn!(connection = id, error = %err, "connection read failed");
                }
                break;
            }
        }
    }
    shared.disconnect(id, &events);
}
