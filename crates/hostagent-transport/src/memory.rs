//! In-process loopback data channel.
//!
//! [`MemoryChannel::pair`] returns the agent side, which implements
//! [`DataChannel`], and a [`RemoteEnd`] that plays the control plane. Frames
//! cross in encoded form so both sides exercise the codec.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use hostagent_core::{
    AgentMessage, ChannelError, DataChannel, InboundHandler, MessageFramer, MessageType,
    PayloadType, SessionState, TerminalSize,
};
use tokio::sync::mpsc;
use tokio_stream::{StreamExt, wrappers::UnboundedReceiverStream};

use crate::protocol::{FrameError, HandlerSlot, decode_binary};

/// Agent side of a loopback channel.
pub struct MemoryChannel {
    session_id: String,
    /// Held while a frame is numbered and queued.
    framer: Mutex<MessageFramer>,
    outbound: mpsc::UnboundedSender<Bytes>,
    handler: Arc<HandlerSlot>,
}

impl MemoryChannel {
    /// Create a connected pair for `session_id`.
    ///
    /// Spawns the channel's receive loop, so it must be called from within a
    /// Tokio runtime. The loop ends when the remote end is dropped.
    #[must_use]
    pub fn pair(session_id: impl Into<String>) -> (Arc<Self>, RemoteEnd) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel::<Bytes>();
        let handler = Arc::new(HandlerSlot::default());

        let slot = Arc::clone(&handler);
        tokio::spawn(async move {
            while let Some(raw) = inbound_rx.recv().await {
                slot.dispatch_decoded(decode_binary(&raw)).await;
            }
            tracing::debug!("Loopback receive loop finished");
        });

        let channel = Arc::new(Self {
            session_id: session_id.into(),
            framer: Mutex::new(MessageFramer::new()),
            outbound: outbound_tx,
            handler,
        });
        let remote = RemoteEnd {
            sender: RemoteSender {
                framer: MessageFramer::new(),
                inbound: inbound_tx,
            },
            outbound: outbound_rx,
        };
        (channel, remote)
    }

    /// Whether a session has registered its inbound handler.
    #[must_use]
    pub fn has_handler(&self) -> bool {
        self.handler.is_set()
    }

    /// Number and queue one frame, so queue order matches sequence order.
    fn send_framed(
        &self,
        build: impl FnOnce(&MessageFramer) -> Result<AgentMessage, ChannelError>,
    ) -> Result<(), ChannelError> {
        let framer = self.framer.lock().unwrap_or_else(PoisonError::into_inner);
        let message = build(&framer)?;
        self.outbound
            .send(message.encode())
            .map_err(|_| ChannelError::Closed)
    }
}

#[async_trait]
impl DataChannel for MemoryChannel {
    async fn send_stream_data(
        &self,
        payload_type: PayloadType,
        payload: &[u8],
    ) -> Result<(), ChannelError> {
        self.send_framed(|framer| {
            Ok(framer.frame(
                MessageType::OutputStreamData,
                payload_type,
                0,
                Bytes::copy_from_slice(payload),
            ))
        })
    }

    async fn send_session_state(&self, state: SessionState) -> Result<(), ChannelError> {
        self.send_framed(|framer| Ok(framer.session_state(&self.session_id, state)?))
    }

    fn set_handler(&self, handler: Arc<dyn InboundHandler>) {
        self.handler.set(handler);
    }

    fn clear_handler(&self) {
        self.handler.clear();
    }
}

/// Input half of the remote side.
pub struct RemoteSender {
    framer: MessageFramer,
    inbound: mpsc::UnboundedSender<Bytes>,
}

impl RemoteSender {
    fn push(&self, raw: Bytes) -> Result<(), ChannelError> {
        self.inbound.send(raw).map_err(|_| ChannelError::Closed)
    }

    /// Send terminal input.
    ///
    /// # Errors
    /// Returns error if the agent side is gone.
    pub fn send_input(&self, bytes: &[u8]) -> Result<(), ChannelError> {
        let message = self.framer.frame(
            MessageType::InputStreamData,
            PayloadType::Output,
            0,
            Bytes::copy_from_slice(bytes),
        );
        self.push(message.encode())
    }

    /// Ask the agent to resize its terminal.
    ///
    /// # Errors
    /// Returns error if the agent side is gone.
    pub fn send_resize(&self, cols: u16, rows: u16) -> Result<(), ChannelError> {
        let payload = serde_json::to_vec(&TerminalSize { cols, rows })?;
        let message = self
            .framer
            .frame(MessageType::InputStreamData, PayloadType::Size, 0, payload);
        self.push(message.encode())
    }

    /// Send raw bytes, which need not be a valid frame.
    ///
    /// # Errors
    /// Returns error if the agent side is gone.
    pub fn send_raw(&self, raw: impl Into<Bytes>) -> Result<(), ChannelError> {
        self.push(raw.into())
    }
}

/// Remote side of a loopback channel.
pub struct RemoteEnd {
    sender: RemoteSender,
    outbound: mpsc::UnboundedReceiver<Bytes>,
}

impl std::ops::Deref for RemoteEnd {
    type Target = RemoteSender;

    fn deref(&self) -> &RemoteSender {
        &self.sender
    }
}

impl RemoteEnd {
    /// Next frame sent by the agent, or `None` once the agent side is dropped.
    pub async fn recv(&mut self) -> Option<Result<AgentMessage, FrameError>> {
        let raw = self.outbound.recv().await?;
        Some(decode_binary(&raw))
    }

    /// Split into the input half and a stream of decoded outbound frames.
    #[must_use]
    pub fn into_stream(
        self,
    ) -> (
        RemoteSender,
        impl Stream<Item = Result<AgentMessage, FrameError>>,
    ) {
        let stream = UnboundedReceiverStream::new(self.outbound).map(|raw| decode_binary(&raw));
        (self.sender, stream)
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{Mutex, PoisonError},
        time::Duration,
    };

    use futures::{FutureExt, future::BoxFuture};
    use hostagent_core::{
        AuditSink, CancelFlag, ExecutorError, ResultStatus, SessionConfig, SessionOutcome,
        SessionStatePayload, ShellControl, ShellProvider, SpawnedShell,
    };
    use hostagent_session::ShellPlugin;
    use tokio::sync::oneshot;

    use super::*;

    struct EchoControl {
        exit_tx: Mutex<Option<oneshot::Sender<i32>>>,
    }

    impl EchoControl {
        fn exit(&self, code: i32) {
            let tx = self
                .exit_tx
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            if let Some(tx) = tx {
                let _ = tx.send(code);
            }
        }
    }

    impl ShellControl for EchoControl {
        fn kill(&self) -> std::io::Result<()> {
            self.exit(137);
            Ok(())
        }

        fn resize(&self, _cols: u16, _rows: u16) -> std::io::Result<()> {
            Ok(())
        }
    }

    /// Shell that echoes its input and exits when it reads `exit\n`.
    struct EchoShell;

    #[async_trait]
    impl ShellProvider for EchoShell {
        async fn spawn(&self, _config: &SessionConfig) -> Result<SpawnedShell, ExecutorError> {
            use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

            let (local, remote) = tokio::io::duplex(1024);
            let (stdout, stdin) = tokio::io::split(local);
            let (exit_tx, exit_rx) = oneshot::channel();
            let control = Arc::new(EchoControl {
                exit_tx: Mutex::new(Some(exit_tx)),
            });

            let echo_control = Arc::clone(&control);
            tokio::spawn(async move {
                let (read, mut write) = tokio::io::split(remote);
                let mut lines = BufReader::new(read).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if line == "exit" {
                        break;
                    }
                    let _ = write.write_all(format!("echo:{line}\n").as_bytes()).await;
                }
                drop(write);
                echo_control.exit(0);
            });

            let exit: BoxFuture<'static, i32> = exit_rx.map(|r| r.unwrap_or(-1)).boxed();
            Ok(SpawnedShell {
                stdin: Box::new(stdin),
                stdout: Box::new(stdout),
                exit,
                control,
            })
        }
    }

    struct Encrypted;

    #[async_trait]
    impl AuditSink for Encrypted {
        async fn is_encrypted(&self, _sink_id: &str) -> bool {
            true
        }
    }

    async fn wait_for_handler(channel: &MemoryChannel) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !channel.has_handler() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_session_over_loopback() {
        let (channel, mut remote) = MemoryChannel::pair("loop-1");
        let plugin = Arc::new(ShellPlugin::new(
            Arc::new(EchoShell),
            Arc::new(Encrypted),
            Arc::new(Encrypted),
        ));
        let outcome = Arc::new(SessionOutcome::new());

        let session = {
            let channel: Arc<dyn DataChannel> = channel.clone();
            let outcome = Arc::clone(&outcome);
            let plugin = Arc::clone(&plugin);
            tokio::spawn(async move {
                let config = SessionConfig::new("loop-1");
                plugin
                    .execute(&config, &CancelFlag::new(), outcome.as_ref(), channel)
                    .await;
            })
        };

        wait_for_handler(&channel).await;
        remote.send_raw(&b"not a frame"[..]).unwrap();
        remote.send_resize(120, 40).unwrap();
        remote.send_input(b"hello\n").unwrap();
        remote.send_input(b"exit\n").unwrap();

        let mut output = Vec::new();
        let mut last_sequence = None;
        let state = loop {
            let message = remote.recv().await.unwrap().unwrap();
            if let Some(prev) = last_sequence {
                assert!(message.sequence_number > prev);
            }
            last_sequence = Some(message.sequence_number);

            match message.message_type {
                MessageType::OutputStreamData => output.extend_from_slice(&message.payload),
                MessageType::AgentSessionState => break message.session_state().unwrap(),
                other => panic!("unexpected {other}"),
            }
        };

        session.await.unwrap();
        assert_eq!(output, b"echo:hello\n");
        assert_eq!(
            state,
            SessionStatePayload {
                schema_version: 1,
                session_state: SessionState::Terminating,
                session_id: "loop-1".into(),
            }
        );
        let snap = outcome.snapshot();
        assert_eq!(snap.exit_code, Some(0));
        assert_eq!(snap.status, Some(ResultStatus::Success));
        assert!(!channel.has_handler());
    }

    #[tokio::test]
    async fn test_send_after_remote_dropped() {
        let (channel, remote) = MemoryChannel::pair("s");
        drop(remote);
        assert!(matches!(
            channel.send_stream_data(PayloadType::Output, b"x").await,
            Err(ChannelError::Closed)
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_senders_keep_sequence_order() {
        let (channel, mut remote) = MemoryChannel::pair("s");

        let senders: Vec<_> = (0..8)
            .map(|_| {
                let channel = Arc::clone(&channel);
                tokio::spawn(async move {
                    for _ in 0..50 {
                        channel
                            .send_stream_data(PayloadType::Output, b"x")
                            .await
                            .unwrap();
                    }
                })
            })
            .collect();
        for sender in senders {
            sender.await.unwrap();
        }
        drop(channel);

        let mut sequence = Vec::new();
        while let Some(frame) = remote.recv().await {
            sequence.push(frame.unwrap().sequence_number);
        }
        let expected: Vec<u64> = (0..400).collect();
        assert_eq!(sequence, expected);
    }

    #[tokio::test]
    async fn test_into_stream_decodes_frames() {
        let (channel, remote) = MemoryChannel::pair("s");
        let (_sender, stream) = remote.into_stream();

        channel
            .send_stream_data(PayloadType::Output, b"one")
            .await
            .unwrap();
        channel
            .send_session_state(SessionState::Terminating)
            .await
            .unwrap();
        drop(channel);

        let frames: Vec<_> = stream.collect().await;
        assert_eq!(frames.len(), 2);
        let first = frames[0].as_ref().unwrap();
        assert_eq!(first.payload, Bytes::from_static(b"one"));
        assert_eq!(first.sequence_number, 0);
        assert_eq!(frames[1].as_ref().unwrap().sequence_number, 1);
    }
}
