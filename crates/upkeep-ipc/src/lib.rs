mod channel;
mod client;
mod error;
mod frame;
mod message;
mod pipe;
mod retry;
mod server;

pub use channel::{channel_name, Endpoint, PIPE_PREFIX};
pub use client::{ClientEvent, PipeClient};
pub use error::TransportError;
pub use frame::{encode_frame, FrameReader, FrameWriter, DEFAULT_MAX_FRAME_BYTES, FRAME_HEADER_LEN};
pub use message::{ExtraString, IpcAction, IpcMessage, LinkSpan, ResponseKind, UpdateStep};
pub use pipe::{PipeListener, PipeStream};
pub use retry::RetryPolicy;
pub use server::{ConnectionId, PipeServer, ServerEvent};
