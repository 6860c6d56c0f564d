//! Data channel abstraction between a session and the remote peer.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::message::{AgentMessage, PayloadType, SessionState};

/// Data channel error.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("Channel closed")]
    Closed,
    #[error("Failed to encode frame: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("Transport error: {0}")]
    Transport(String),
}

/// Receives inbound frames from a [`DataChannel`].
///
/// Called from the channel's receive loop, one frame at a time and in
/// arrival order.
#[async_trait]
pub trait InboundHandler: Send + Sync {
    /// Handle one decoded frame.
    async fn on_message(&self, message: AgentMessage);
}

/// Ordered, reliable delivery of framed messages to and from the remote peer.
///
/// Implementations own framing of outbound messages, so each direction keeps
/// its own strictly increasing sequence numbers.
#[async_trait]
pub trait DataChannel: Send + Sync {
    /// Send terminal data to the remote peer.
    async fn send_stream_data(
        &self,
        payload_type: PayloadType,
        payload: &[u8],
    ) -> Result<(), ChannelError>;

    /// Announce a session lifecycle transition.
    async fn send_session_state(&self, state: SessionState) -> Result<(), ChannelError>;

    /// Route inbound frames to `handler`, replacing any previous handler.
    fn set_handler(&self, handler: Arc<dyn InboundHandler>);

    /// Stop routing inbound frames.
    fn clear_handler(&self);
}
