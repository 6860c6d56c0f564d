//! Test doubles for the session collaborators.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::FutureExt;
use hostagent_core::{
    AgentMessage, AuditSink, ChannelError, DataChannel, ExecutorError, InboundHandler, IoHandler,
    PayloadType, ResultStatus, SessionConfig, SessionState, ShellControl, ShellProvider,
    SinkError, SpawnedShell,
};
use tokio::{io::DuplexStream, sync::oneshot};

/// A frame the session asked the channel to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sent {
    Data(PayloadType, Vec<u8>),
    State(SessionState),
}

/// Records outbound frames and exposes the registered inbound handler.
#[derive(Default)]
pub struct FakeChannel {
    sent: Mutex<Vec<Sent>>,
    failures_left: Mutex<u32>,
    handler: Mutex<Option<Arc<dyn InboundHandler>>>,
}

impl FakeChannel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_next_sends(&self, count: u32) {
        *self.failures_left.lock().unwrap() = count;
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().unwrap().clone()
    }

    pub fn output_bytes(&self) -> Vec<u8> {
        self.sent()
            .into_iter()
            .filter_map(|s| match s {
                Sent::Data(PayloadType::Output, bytes) => Some(bytes),
                _ => None,
            })
            .flatten()
            .collect()
    }

    pub fn terminating_count(&self) -> usize {
        self.sent()
            .iter()
            .filter(|s| **s == Sent::State(SessionState::Terminating))
            .count()
    }

    pub fn handler(&self) -> Option<Arc<dyn InboundHandler>> {
        self.handler.lock().unwrap().clone()
    }

    pub async fn deliver(&self, message: AgentMessage) {
        if let Some(handler) = self.handler() {
            handler.on_message(message).await;
        }
    }
}

#[async_trait]
impl DataChannel for FakeChannel {
    async fn send_stream_data(&self, payload_type: PayloadType, payload: &[u8]) -> Result<(), ChannelError> {
        {
            let mut left = self.failures_left.lock().unwrap();
            if *left > 0 {
                *left -= 1;
                return Err(ChannelError::Transport("injected".into()));
            }
        }
        self.sent
            .lock()
            .unwrap()
            .push(Sent::Data(payload_type, payload.to_vec()));
        Ok(())
    }

    async fn send_session_state(&self, state: SessionState) -> Result<(), ChannelError> {
        self.sent.lock().unwrap().push(Sent::State(state));
        Ok(())
    }

    fn set_handler(&self, handler: Arc<dyn InboundHandler>) {
        *self.handler.lock().unwrap() = Some(handler);
    }

    fn clear_handler(&self) {
        *self.handler.lock().unwrap() = None;
    }
}

/// Shell control that records calls; kill resolves the exit future.
#[derive(Default)]
pub struct FakeControl {
    resizes: Mutex<Vec<(u16, u16)>>,
    kills: Mutex<u32>,
    exit_tx: Mutex<Option<oneshot::Sender<i32>>>,
}

/// Exit code reported by a killed fake shell.
pub const KILLED_EXIT_CODE: i32 = 137;

impl FakeControl {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn resizes(&self) -> Vec<(u16, u16)> {
        self.resizes.lock().unwrap().clone()
    }

    pub fn kills(&self) -> u32 {
        *self.kills.lock().unwrap()
    }

    /// Simulate the process exiting with `code`.
    pub fn exit(&self, code: i32) {
        if let Some(tx) = self.exit_tx.lock().unwrap().take() {
            let _ = tx.send(code);
        }
    }
}

impl ShellControl for FakeControl {
    fn kill(&self) -> std::io::Result<()> {
        *self.kills.lock().unwrap() += 1;
        self.exit(KILLED_EXIT_CODE);
        Ok(())
    }

    fn resize(&self, cols: u16, rows: u16) -> std::io::Result<()> {
        self.resizes.lock().unwrap().push((cols, rows));
        Ok(())
    }
}

/// Far ends of a fake shell's streams.
pub struct ShellHandle {
    /// Reads what the session wrote to the shell.
    pub stdin: DuplexStream,
    /// Writes shell output; drop to signal end of stream.
    pub stdout: DuplexStream,
    pub control: Arc<FakeControl>,
}

/// Provider handing out in-memory shells.
#[derive(Default)]
pub struct FakeShellProvider {
    fail: bool,
    input_capacity: Option<usize>,
    spawned: Mutex<Vec<ShellHandle>>,
    spawn_count: Mutex<u32>,
}

impl FakeShellProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            fail: true,
            ..Self::default()
        })
    }

    /// Shells whose input pipe holds only `capacity` unread bytes.
    pub fn with_input_capacity(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            input_capacity: Some(capacity),
            ..Self::default()
        })
    }

    pub fn spawn_count(&self) -> u32 {
        *self.spawn_count.lock().unwrap()
    }

    /// Wait for the next spawned shell.
    pub async fn next_shell(&self) -> ShellHandle {
        loop {
            if let Some(handle) = self.spawned.lock().unwrap().pop() {
                return handle;
            }
            tokio::task::yield_now().await;
        }
    }
}

#[async_trait]
impl ShellProvider for FakeShellProvider {
    async fn spawn(&self, _config: &SessionConfig) -> Result<SpawnedShell, ExecutorError> {
        *self.spawn_count.lock().unwrap() += 1;
        if self.fail {
            return Err(ExecutorError::SpawnFailed("no shell".into()));
        }

        let (stdin_local, stdin_remote) = tokio::io::duplex(self.input_capacity.unwrap_or(4096));
        let (stdout_local, stdout_remote) = tokio::io::duplex(4096);
        let (exit_tx, exit_rx) = oneshot::channel();
        let control = FakeControl::new();
        *control.exit_tx.lock().unwrap() = Some(exit_tx);

        self.spawned.lock().unwrap().push(ShellHandle {
            stdin: stdin_remote,
            stdout: stdout_remote,
            control: Arc::clone(&control),
        });

        Ok(SpawnedShell {
            stdin: Box::new(stdin_local),
            stdout: Box::new(stdout_local),
            exit: exit_rx.map(|r| r.unwrap_or(-1)).boxed(),
            control,
        })
    }
}

/// A call made against [`FakeSink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkCall {
    IsEncrypted(String),
    Provision(String, String),
}

/// Audit sink with a fixed encryption answer.
pub struct FakeSink {
    encrypted: bool,
    fail_provision: bool,
    calls: Mutex<Vec<SinkCall>>,
}

impl FakeSink {
    pub fn encrypted(encrypted: bool) -> Self {
        Self {
            encrypted,
            fail_provision: false,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn failing_provision(mut self) -> Self {
        self.fail_provision = true;
        self
    }

    pub fn calls(&self) -> Vec<SinkCall> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl AuditSink for FakeSink {
    async fn is_encrypted(&self, sink_id: &str) -> bool {
        self.calls
            .lock()
            .unwrap()
            .push(SinkCall::IsEncrypted(sink_id.to_string()));
        self.encrypted
    }

    async fn ensure_provisioned(&self, sink_id: &str, stream_name: &str) -> Result<(), SinkError> {
        self.calls
            .lock()
            .unwrap()
            .push(SinkCall::Provision(sink_id.to_string(), stream_name.to_string()));
        if self.fail_provision {
            return Err(SinkError::Provisioning {
                sink: sink_id.to_string(),
                message: "denied".into(),
            });
        }
        Ok(())
    }
}

/// A call made against [`RecordingIo`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IoCall {
    ExitCode(i32),
    Status(ResultStatus),
    Cancelled,
    ShutDown,
    Error(String),
}

/// IoHandler that records every call, duplicates included.
#[derive(Default)]
pub struct RecordingIo {
    calls: Mutex<Vec<IoCall>>,
}

impl RecordingIo {
    pub fn calls(&self) -> Vec<IoCall> {
        self.calls.lock().unwrap().clone()
    }

    fn push(&self, call: IoCall) {
        self.calls.lock().unwrap().push(call);
    }
}

impl IoHandler for RecordingIo {
    fn set_exit_code(&self, code: i32) {
        self.push(IoCall::ExitCode(code));
    }

    fn set_status(&self, status: ResultStatus) {
        self.push(IoCall::Status(status));
    }

    fn mark_as_cancelled(&self) {
        self.push(IoCall::Cancelled);
    }

    fn mark_as_shutdown(&self) {
        self.push(IoCall::ShutDown);
    }

    fn append_error(&self, message: &str) {
        self.push(IoCall::Error(message.to_string()));
    }
}
