//! Agent message framing for the session data channel.
//!
//! Wire format (all integers big-endian):
//!
//! ```text
//! offset size field
//! 0      4    header length (offset of the payload length field, 112)
//! 4      32   message type, ASCII, right-padded with spaces
//! 36     4    schema version
//! 40     8    created date (epoch millis)
//! 48     8    sequence number
//! 56     4    flags
//! 60     16   message id (UUID)
//! 76     32   payload digest (SHA-256)
//! 108    4    payload type
//! 112    4    payload length
//! 116    N    payload
//! ```

use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
    time::{SystemTime, UNIX_EPOCH},
};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

/// Current protocol schema version.
pub const SCHEMA_VERSION: u32 = 1;

const MESSAGE_TYPE_LEN: usize = 32;
const DIGEST_LEN: usize = 32;

/// Value of the header length field: every byte before the payload length.
pub const HEADER_LENGTH: u32 = 112;

/// Total bytes preceding the payload.
pub const PREFIX_LEN: usize = HEADER_LENGTH as usize + 4;

/// Frame flag bits.
pub mod flags {
    /// First frame of a stream.
    pub const SYN: u32 = 1;
    /// Last frame of a stream.
    pub const FIN: u32 = 2;
}

/// Kind of frame carried on the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// Remote to local terminal data.
    InputStreamData,
    /// Local to remote terminal data.
    OutputStreamData,
    /// Delivery acknowledgement.
    Acknowledge,
    /// Session lifecycle notification.
    AgentSessionState,
    /// The remote side closed the channel.
    ChannelClosed,
}

impl MessageType {
    /// Wire name of this type.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InputStreamData => "input_stream_data",
            Self::OutputStreamData => "output_stream_data",
            Self::Acknowledge => "acknowledge",
            Self::AgentSessionState => "agent_session_state",
            Self::ChannelClosed => "channel_closed",
        }
    }

    fn from_wire(name: &str) -> Option<Self> {
        match name {
            "input_stream_data" => Some(Self::InputStreamData),
            "output_stream_data" => Some(Self::OutputStreamData),
            "acknowledge" => Some(Self::Acknowledge),
            "agent_session_state" => Some(Self::AgentSessionState),
            "channel_closed" => Some(Self::ChannelClosed),
            _ => None,
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Semantic kind of a frame's payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum PayloadType {
    /// Control frames without typed payload.
    Undefined = 0,
    /// Raw terminal bytes, in either direction.
    Output = 1,
    /// Error text.
    Error = 2,
    /// Terminal size as JSON `{"cols":..,"rows":..}`.
    Size = 3,
    /// Session parameters.
    Parameter = 4,
    /// JSON encoded [`SessionStatePayload`].
    SessionState = 5,
}

impl PayloadType {
    /// Parse a wire value.
    ///
    /// # Errors
    /// Returns error for values outside the known set.
    pub fn from_wire(value: u32) -> Result<Self, DecodeError> {
        Ok(match value {
            0 => Self::Undefined,
            1 => Self::Output,
            2 => Self::Error,
            3 => Self::Size,
            4 => Self::Parameter,
            5 => Self::SessionState,
            other => return Err(DecodeError::UnknownPayloadType(other)),
        })
    }
}

/// Session lifecycle state announced to the remote peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Connected,
    Terminating,
    Terminated,
}

/// Payload of an `agent_session_state` frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SessionStatePayload {
    pub schema_version: u32,
    pub session_state: SessionState,
    pub session_id: String,
}

/// Terminal size carried by `Size` payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalSize {
    pub cols: u16,
    pub rows: u16,
}

/// Decode error.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Frame truncated: need {needed} bytes, got {actual}")]
    Truncated { needed: usize, actual: usize },
    #[error("Unexpected header length {0}")]
    HeaderLength(u32),
    #[error("Message type is not valid ASCII")]
    InvalidMessageType,
    #[error("Unknown message type: {0}")]
    UnknownMessageType(String),
    #[error("Unknown payload type: {0}")]
    UnknownPayloadType(u32),
    #[error("Payload length {declared} does not match {actual} remaining bytes")]
    PayloadLength { declared: usize, actual: usize },
    #[error("Payload digest mismatch")]
    DigestMismatch,
}

/// One unit exchanged over the data channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentMessage {
    pub schema_version: u32,
    pub created_date: u64,
    pub sequence_number: u64,
    pub flags: u32,
    pub message_id: Uuid,
    pub message_type: MessageType,
    pub payload_type: PayloadType,
    pub payload: Bytes,
}

impl AgentMessage {
    /// Encode into the wire representation.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(PREFIX_LEN + self.payload.len());
        buf.put_u32(HEADER_LENGTH);

        let mut name = [b' '; MESSAGE_TYPE_LEN];
        let wire = self.message_type.as_str().as_bytes();
        name[..wire.len()].copy_from_slice(wire);
        buf.put_slice(&name);

        buf.put_u32(self.schema_version);
        buf.put_u64(self.created_date);
        buf.put_u64(self.sequence_number);
        buf.put_u32(self.flags);
        buf.put_slice(self.message_id.as_bytes());
        buf.put_slice(&Sha256::digest(&self.payload));
        buf.put_u32(self.payload_type as u32);
        // Payloads above u32::MAX cannot be framed; chunking keeps them far below.
        #[allow(clippy::cast_possible_truncation)]
        let payload_length = self.payload.len() as u32;
        buf.put_u32(payload_length);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Decode from the wire representation.
    ///
    /// # Errors
    /// Returns error on truncated or malformed input.
    pub fn decode(raw: &[u8]) -> Result<Self, DecodeError> {
        if raw.len() < PREFIX_LEN {
            return Err(DecodeError::Truncated {
                needed: PREFIX_LEN,
                actual: raw.len(),
            });
        }
        let mut buf = raw;

        let header_length = buf.get_u32();
        if header_length != HEADER_LENGTH {
            return Err(DecodeError::HeaderLength(header_length));
        }

        let name = std::str::from_utf8(&raw[4..4 + MESSAGE_TYPE_LEN])
            .map_err(|_| DecodeError::InvalidMessageType)?
            .trim_end_matches(' ');
        let message_type = MessageType::from_wire(name)
            .ok_or_else(|| DecodeError::UnknownMessageType(name.to_string()))?;
        buf.advance(MESSAGE_TYPE_LEN);

        let schema_version = buf.get_u32();
        let created_date = buf.get_u64();
        let sequence_number = buf.get_u64();
        let flags = buf.get_u32();

        let mut id = [0u8; 16];
        buf.copy_to_slice(&mut id);
        let message_id = Uuid::from_bytes(id);

        let mut digest = [0u8; DIGEST_LEN];
        buf.copy_to_slice(&mut digest);

        let payload_type = PayloadType::from_wire(buf.get_u32())?;
        let declared = buf.get_u32() as usize;
        if declared != buf.remaining() {
            return Err(DecodeError::PayloadLength {
                declared,
                actual: buf.remaining(),
            });
        }
        if Sha256::digest(buf).as_slice() != digest.as_slice() {
            return Err(DecodeError::DigestMismatch);
        }

        Ok(Self {
            schema_version,
            created_date,
            sequence_number,
            flags,
            message_id,
            message_type,
            payload_type,
            payload: Bytes::copy_from_slice(buf),
        })
    }

    /// Parse a `Size` payload.
    ///
    /// # Errors
    /// Returns error if the payload is not a valid size document.
    pub fn terminal_size(&self) -> Result<TerminalSize, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }

    /// Parse an `agent_session_state` payload.
    ///
    /// # Errors
    /// Returns error if the payload is not a valid state document.
    pub fn session_state(&self) -> Result<SessionStatePayload, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }
}

/// Builds outbound frames for one direction of a session.
///
/// Owns the direction's sequence counter; every frame gets a fresh message id
/// and is stamped with the time it is built, which callers do right before
/// sending.
#[derive(Debug)]
pub struct MessageFramer {
    schema_version: u32,
    next_sequence: AtomicU64,
}

impl Default for MessageFramer {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageFramer {
    /// Create a framer starting at sequence number 0.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            next_sequence: AtomicU64::new(0),
        }
    }

    /// Build the next frame in this direction.
    pub fn frame(
        &self,
        message_type: MessageType,
        payload_type: PayloadType,
        flags: u32,
        payload: impl Into<Bytes>,
    ) -> AgentMessage {
        AgentMessage {
            schema_version: self.schema_version,
            created_date: now_millis(),
            sequence_number: self.next_sequence.fetch_add(1, Ordering::SeqCst),
            flags,
            message_id: Uuid::new_v4(),
            message_type,
            payload_type,
            payload: payload.into(),
        }
    }

    /// Build an `agent_session_state` frame.
    ///
    /// # Errors
    /// Returns error if the state payload cannot be serialized.
    pub fn session_state(
        &self,
        session_id: &str,
        state: SessionState,
    ) -> Result<AgentMessage, serde_json::Error> {
        let payload = serde_json::to_vec(&SessionStatePayload {
            schema_version: self.schema_version,
            session_state: state,
            session_id: session_id.to_string(),
        })?;
        let flags = if state == SessionState::Connected {
            0
        } else {
            flags::FIN
        };
        Ok(self.frame(
            MessageType::AgentSessionState,
            PayloadType::SessionState,
            flags,
            payload,
        ))
    }

    /// Sequence number the next frame will carry.
    #[must_use]
    pub fn peek_sequence(&self) -> u64 {
        self.next_sequence.load(Ordering::SeqCst)
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
