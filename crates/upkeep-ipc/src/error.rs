use thiserror::Error;
use upkeep_core::CorruptDataError;

use crate::server::ConnectionId;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("pipe io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame length invalid: {reason}")]
    FrameLengthInvalid { reason: String },
    #[error("frame too large: max {max_frame_bytes} got {got_bytes}")]
    FrameTooLarge {
        max_frame_bytes: usize,
        got_bytes: usize,
    },
    #[error("peer disconnected mid-frame after {read} of {expected} bytes")]
    Truncated { read: usize, expected: usize },
    #[error("undecodable message: {0}")]
    Message(#[from] CorruptDataError),
    #[error("connection {active} is already the relay target")]
    RelayAlreadyActive { active: ConnectionId },
    #[error("no connection with id {0}")]
    UnknownConnection(ConnectionId),
    #[error("not connected")]
    NotConnected,
    #[error("message not delivered after {attempts} attempts")]
    NotDelivered { attempts: u32 },
}

impl TransportError {
    /// Whether the same send may succeed later: the peer was missing or the pipe broke.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Io(_) | Self::Truncated { .. } | Self::UnknownConnection(_) | Self::NotConnected
        )
    }
}
