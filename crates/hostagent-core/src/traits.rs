//! Collaborator traits consumed by the session engine.

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::SessionConfig;

/// Exit code reported when a session fails before its process runs.
pub const ERROR_EXIT_CODE: i32 = 1;

/// Final status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    /// The session is still running.
    InProgress,
    /// The process exited with code 0.
    Success,
    /// The process exited non-zero, or the session could not start.
    Failed,
    /// An operator cancelled the session.
    Cancelled,
    /// The agent shut down while the session was running.
    ShutDown,
}

impl ResultStatus {
    /// Map a process exit code to a status.
    #[must_use]
    pub const fn from_exit_code(code: i32) -> Self {
        if code == 0 { Self::Success } else { Self::Failed }
    }
}

impl fmt::Display for ResultStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::InProgress => "InProgress",
            Self::Success => "Success",
            Self::Failed => "Failed",
            Self::Cancelled => "Cancelled",
            Self::ShutDown => "ShutDown",
        };
        f.write_str(s)
    }
}

/// Records the final outcome of a session for the execution framework.
pub trait IoHandler: Send + Sync {
    /// Record the process exit code.
    fn set_exit_code(&self, code: i32);

    /// Record the final status.
    fn set_status(&self, status: ResultStatus);

    /// Record that the session was cancelled.
    fn mark_as_cancelled(&self);

    /// Record that the agent shut down during the session.
    fn mark_as_shutdown(&self);

    /// Append an error message to the session output.
    fn append_error(&self, message: &str);
}

/// Control surface of a spawned local shell.
pub trait ShellControl: Send + Sync {
    /// Terminate the process (and its children where supported).
    ///
    /// # Errors
    /// Returns error if the signal cannot be delivered.
    fn kill(&self) -> std::io::Result<()>;

    /// Resize the terminal. Shells without a terminal ignore this.
    ///
    /// # Errors
    /// Returns error if the terminal rejects the size.
    fn resize(&self, cols: u16, rows: u16) -> std::io::Result<()>;
}

/// A running local shell and its standard streams.
pub struct SpawnedShell {
    /// Writable input of the shell.
    pub stdin: Box<dyn AsyncWrite + Send + Unpin>,
    /// Readable output of the shell.
    pub stdout: Box<dyn AsyncRead + Send + Unpin>,
    /// Resolves to the exit code once the process exits.
    pub exit: BoxFuture<'static, i32>,
    /// Kill and resize.
    pub control: Arc<dyn ShellControl>,
}

impl fmt::Debug for SpawnedShell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpawnedShell").finish_non_exhaustive()
    }
}

/// Executor error.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("Spawn failed: {0}")]
    SpawnFailed(String),
    #[error("Executable not found: {0}")]
    ExecutableNotFound(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Command build error: {0}")]
    CommandBuild(String),
}

/// Spawns the local interpreter for a session.
#[async_trait]
pub trait ShellProvider: Send + Sync {
    /// Spawn a shell for `config`.
    async fn spawn(&self, config: &SessionConfig) -> Result<SpawnedShell, ExecutorError>;
}

/// Audit sink error.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("Failed to provision {sink}: {message}")]
    Provisioning { sink: String, message: String },
    #[error("Sink service unavailable: {0}")]
    Unavailable(String),
}

/// An audit-log destination with an encryption-at-rest property.
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Whether `sink_id` is encrypted at rest.
    async fn is_encrypted(&self, sink_id: &str) -> bool;

    /// Make sure `sink_id` can receive the stream named `stream_name`.
    async fn ensure_provisioned(&self, _sink_id: &str, _stream_name: &str) -> Result<(), SinkError> {
        Ok(())
    }
}
