//! Data channel transports for host agent sessions.
//!
//! Provides:
//! - Wire helpers (binary frames, base64 text frames)
//! - In-memory loopback channel
//! - WebSocket channel (feature: websocket)

pub mod memory;
pub mod protocol;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use memory::{MemoryChannel, RemoteEnd, RemoteSender};
pub use protocol::{FrameError, HandlerSlot, decode_binary, decode_text, encode_text};
