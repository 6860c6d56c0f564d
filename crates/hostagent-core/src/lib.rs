//! Core abstractions for interactive host agent sessions.
//!
//! This crate provides the fundamental building blocks:
//! - `AgentMessage` - Framed unit exchanged over the data channel
//! - `CancelFlag` - Shared cancel/shutdown/completion signal
//! - `SessionConfig` - Session configuration and audit sink settings
//! - `DataChannel`, `IoHandler`, `ShellProvider` and `AuditSink` traits

pub mod cancel;
pub mod channel;
pub mod config;
pub mod message;
pub mod outcome;
pub mod traits;

pub use cancel::{CancelFlag, CancelState, Outcome};
pub use channel::{ChannelError, DataChannel, InboundHandler};
pub use config::{AuditConfig, ConfigError, SessionConfig};
pub use message::{
    AgentMessage, DecodeError, MessageFramer, MessageType, PayloadType, SessionState,
    SessionStatePayload, TerminalSize,
};
pub use outcome::{OutcomeSnapshot, SessionOutcome};
pub use traits::{
    AuditSink, ERROR_EXIT_CODE, ExecutorError, IoHandler, ResultStatus, ShellControl,
    ShellProvider, SinkError, SpawnedShell,
};
