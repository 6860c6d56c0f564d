//! Wire helpers shared by the data channel transports.
//!
//! Binary transports carry encoded [`AgentMessage`]s as-is. Text transports
//! carry the same bytes base64 encoded.

use std::sync::{Arc, PoisonError, RwLock};

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use hostagent_core::{AgentMessage, DecodeError, InboundHandler};
use thiserror::Error;

/// Error decoding a frame received from the peer.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("Invalid frame: {0}")]
    Decode(#[from] DecodeError),
}

/// Encode a frame for a text transport.
#[must_use]
pub fn encode_text(message: &AgentMessage) -> String {
    BASE64.encode(message.encode())
}

/// Decode a frame received over a text transport.
///
/// # Errors
/// Returns error if the text is not base64 or not a valid frame.
pub fn decode_text(text: &str) -> Result<AgentMessage, FrameError> {
    let raw = BASE64.decode(text.trim())?;
    Ok(AgentMessage::decode(&raw)?)
}

/// Decode a frame received over a binary transport.
///
/// # Errors
/// Returns error if the bytes are not a valid frame.
pub fn decode_binary(raw: &[u8]) -> Result<AgentMessage, FrameError> {
    Ok(AgentMessage::decode(raw)?)
}

/// The inbound handler currently registered on a channel.
#[derive(Default)]
pub struct HandlerSlot {
    handler: RwLock<Option<Arc<dyn InboundHandler>>>,
}

impl HandlerSlot {
    pub fn set(&self, handler: Arc<dyn InboundHandler>) {
        *self.handler.write().unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    pub fn clear(&self) {
        *self.handler.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    #[must_use]
    pub fn is_set(&self) -> bool {
        self.get().is_some()
    }

    fn get(&self) -> Option<Arc<dyn InboundHandler>> {
        self.handler
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Hand `message` to the registered handler.
    ///
    /// Returns `false` when no handler is registered and the frame is dropped.
    pub async fn dispatch(&self, message: AgentMessage) -> bool {
        let Some(handler) = self.get() else {
            tracing::debug!(
                sequence_number = message.sequence_number,
                message_type = %message.message_type,
                "No handler registered, dropping frame"
            );
            return false;
        };
        handler.on_message(message).await;
        true
    }

    /// Decode `result` and dispatch it; malformed frames are logged and dropped.
    pub async fn dispatch_decoded(&self, result: Result<AgentMessage, FrameError>) -> bool {
        match result {
            Ok(message) => self.dispatch(message).await,
            Err(e) => {
                tracing::warn!(error = %e, "Dropping malformed frame");
                false
            }
        }
    }
}
