//! Interactive shell session engine for host agents.
//!
//! Provides:
//! - `ShellPlugin` - Session lifecycle: validate, spawn, pump, tear down
//! - `OutputPump` / `InputPump` - The two data-flow directions
//! - `Transcript` - Local copy of the session output
//! - `validate` - Audit sink encryption pre-flight
//! - `SessionManager` - Run sessions in the background

pub mod manager;
pub mod pump;
pub mod shell;
pub mod transcript;
pub mod validate;

#[cfg(test)]
mod test_support;

pub use manager::{ManagerError, SessionHandle, SessionManager};
pub use pump::{InputPump, LocalIo, OutputPump, PumpStats, STREAM_CHUNK_SIZE, TerminationNotice};
pub use shell::{OUTPUT_DRAIN_TIMEOUT, ShellPlugin};
pub use transcript::Transcript;
pub use validate::{AuditSinks, ValidationError, validate};
