//! PTY spawning with async standard streams.

use std::{
    collections::HashMap,
    io::{ErrorKind, Read, Write},
    path::PathBuf,
    sync::{Mutex, PoisonError},
};

use portable_pty::{ChildKiller, CommandBuilder, MasterPty, PtySize, native_pty_system};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, DuplexStream},
    sync::{mpsc, oneshot},
};

/// Capacity of the in-process pipes bridging the PTY to async code.
const PIPE_CAPACITY: usize = 64 * 1024;

/// Size of a single PTY read.
const READ_CHUNK: usize = 8192;

/// Exit code reported when the child's status cannot be determined.
pub const UNKNOWN_EXIT_CODE: i32 = -1;

/// PTY error.
#[derive(Debug, thiserror::Error)]
pub enum PtyError {
    #[error("Failed to open PTY: {0}")]
    Open(String),
    #[error("Failed to spawn process: {0}")]
    Spawn(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// What to run inside a new PTY.
#[derive(Debug, Clone)]
pub struct PtyRequest {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub env: HashMap<String, String>,
    pub cols: u16,
    pub rows: u16,
}

impl PtyRequest {
    /// Request for `program` with default size and no extra arguments.
    #[must_use]
    pub fn new(program: impl Into<PathBuf>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: working_dir.into(),
            env: HashMap::new(),
            cols: 80,
            rows: 24,
        }
    }

    /// Append arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set the terminal size.
    #[must_use]
    pub const fn size(mut self, cols: u16, rows: u16) -> Self {
        self.cols = cols;
        self.rows = rows;
        self
    }
}

/// Kill and resize handle for a PTY child.
pub struct PtyControl {
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    master: Mutex<Box<dyn MasterPty + Send>>,
    pid: Option<u32>,
}

impl std::fmt::Debug for PtyControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtyControl").field("pid", &self.pid).finish_non_exhaustive()
    }
}

impl PtyControl {
    /// Process id of the child, when the platform reports one.
    #[must_use]
    pub const fn process_id(&self) -> Option<u32> {
        self.pid
    }

    /// Kill the child.
    ///
    /// # Errors
    /// Returns error if the signal cannot be delivered.
    pub fn kill(&self) -> std::io::Result<()> {
        self.killer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .kill()
    }

    /// Resize the terminal.
    ///
    /// # Errors
    /// Returns error if the PTY rejects the size.
    pub fn resize(&self, cols: u16, rows: u16) -> std::io::Result<()> {
        self.master
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| std::io::Error::other(e.to_string()))
    }
}

/// A child running inside a PTY.
#[derive(Debug)]
pub struct PtyProcess {
    /// Write side of the terminal input.
    pub stdin: DuplexStream,
    /// Read side of the terminal output; reaches EOF when the PTY closes.
    pub stdout: DuplexStream,
    /// Exit code, sent once the child exits.
    pub exit: oneshot::Receiver<i32>,
    /// Kill and resize.
    pub control: PtyControl,
}

/// Spawns processes inside pseudo terminals.
#[derive(Debug, Clone)]
pub struct PtyService {
    term: String,
}

impl Default for PtyService {
    fn default() -> Self {
        Self::new()
    }
}

impl PtyService {
    /// Create a service advertising `xterm-256color`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            term: "xterm-256color".to_string(),
        }
    }

    /// Override the `TERM` value given to children.
    #[must_use]
    pub fn with_term(mut self, term: impl Into<String>) -> Self {
        self.term = term.into();
        self
    }

    /// Spawn `request` inside a new PTY.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    /// Returns error if the PTY cannot be opened or the child cannot start.
    pub fn spawn(&self, request: &PtyRequest) -> Result<PtyProcess, PtyError> {
        let pair = native_pty_system()
            .openpty(PtySize {
                rows: request.rows,
                cols: request.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| PtyError::Open(e.to_string()))?;

        let mut cmd = CommandBuilder::new(&request.program);
        cmd.args(&request.args);
        cmd.cwd(&request.working_dir);
        cmd.env("TERM", &self.term);
        for (key, value) in &request.env {
            cmd.env(key, value);
        }

        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| PtyError::Spawn(e.to_string()))?;
        // The parent must not hold the slave open, or EOF never arrives.
        drop(pair.slave);

        let pid = child.process_id();
        let killer = child.clone_killer();
        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| PtyError::Open(e.to_string()))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| PtyError::Open(e.to_string()))?;

        tracing::debug!(?pid, program = %request.program.display(), "Spawned PTY child");

        let (stdout_local, stdout_remote) = tokio::io::duplex(PIPE_CAPACITY);
        let (stdin_local, stdin_remote) = tokio::io::duplex(PIPE_CAPACITY);
        spawn_output_bridge(reader, stdout_remote);
        spawn_input_bridge(stdin_remote, writer);

        let (exit_tx, exit_rx) = oneshot::channel();
        tokio::task::spawn_blocking(move || {
            let code = match child.wait() {
                Ok(status) => i32::try_from(status.exit_code()).unwrap_or(UNKNOWN_EXIT_CODE),
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to wait for PTY child");
                    UNKNOWN_EXIT_CODE
                }
            };
            tracing::debug!(?pid, code, "PTY child exited");
            let _ = exit_tx.send(code);
        });

        Ok(PtyProcess {
            stdin: stdin_local,
            stdout: stdout_local,
            exit: exit_rx,
            control: PtyControl {
                killer: Mutex::new(killer),
                master: Mutex::new(pair.master),
                pid,
            },
        })
    }
}

/// Copy blocking PTY output into the async pipe until either side closes.
fn spawn_output_bridge(mut reader: Box<dyn Read + Send>, mut pipe: DuplexStream) {
    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(64);

    tokio::task::spawn_blocking(move || {
        let mut buf = [0u8; READ_CHUNK];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.blocking_send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(ref e) if e.kind() == ErrorKind::Interrupted => {}
                // Linux reports EIO once the child side of the PTY is gone.
                Err(e) => {
                    tracing::trace!(error = %e, "PTY read ended");
                    break;
                }
            }
        }
    });

    tokio::spawn(async move {
        while let Some(chunk) = rx.recv().await {
            if pipe.write_all(&chunk).await.is_err() {
                break;
            }
        }
        let _ = pipe.shutdown().await;
    });
}

/// Copy the async input pipe into the blocking PTY writer.
fn spawn_input_bridge(mut pipe: DuplexStream, mut writer: Box<dyn Write + Send>) {
    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(64);

    tokio::spawn(async move {
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            match pipe.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if tx.send(buf[..n].to_vec()).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    tokio::task::spawn_blocking(move || {
        while let Some(chunk) = rx.blocking_recv() {
            if let Err(e) = writer.write_all(&chunk).and_then(|()| writer.flush()) {
                tracing::debug!(error = %e, "PTY write failed");
                break;
            }
        }
    });
}
