use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use tracing::{debug, warn};
use upkeep_core::TlvRecord;

use crate::channel::Endpoint;
use crate::error::TransportError;
use crate::frame::{FrameReader, FrameWriter, DEFAULT_MAX_FRAME_BYTES};
use crate::message::IpcMessage;
use crate::pipe::PipeStream;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    Message(IpcMessage),
    Disconnected,
}

/// Connection to exactly one channel, with a background reader feeding [`ClientEvent`]s.
pub struct PipeClient {
    writer: Mutex<FrameWriter<PipeStream>>,
    control: PipeStream,
    connected: Arc<AtomicBool>,
}

impl PipeClient {
    pub fn connect(endpoint: &Endpoint, events: Sender<ClientEvent>) -> Result<Self, TransportError> {
        let stream = PipeStream::connect(endpoint)?;
        let reader = stream.try_clone()?;
        let control = stream.try_clone()?;
        let connected = Arc::new(AtomicBool::new(true));

        let reader_connected = Arc::clone(&connected);
        thread::Builder::new()
            .name("upkeep-ipc-client".to_string())
            .spawn(move || read_loop(reader, reader_connected, events))?;
        debug!(channel = endpoint.channel(), "pipe client connected");

        Ok(Self {
            writer: Mutex::new(FrameWriter::new(stream, DEFAULT_MAX_FRAME_BYTES)),
            control,
            connected,
        })
    }

    pub fn send(&self, message: &IpcMessage) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        writer.write_frame(&message.encode())?;
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn close(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            self.control.shutdown();
        }
    }
}

impl Drop for PipeClient {
    fn drop(&mut self) {
        self.close();
    }
}

fn read_loop(stream: PipeStream, connected: Arc<AtomicBool>, events: Sender<ClientEvent>) {
    let mut reader = FrameReader::new(stream, DEFAULT_MAX_FRAME_BYTES);
    loop {
        match reader.read_next() {
            Ok(Some(frame)) => match IpcMessage::decode(&frame) {
                Ok(message) => {
                    let _ = events.send(ClientEvent::Message(message));
                }
                Err(err) => warn!(error = %err, "discarding undecodable message"),
            },
            Ok(None) => break,
            Err(err) => {
                if connected.load(Ordering::SeqCst) {
                    warn!(error = %err, "pipe client read failed");
                }
                break;
            }
        }
    }
    connected.store(false, Ordering::SeqCst);
    let _ = events.send(ClientEvent::Disconnected);
}
