//! The two data-flow directions of a session.
//!
//! [`OutputPump`] is a task that copies the local shell's output to the data
//! channel. [`InputPump`] is the channel's inbound handler and writes remote
//! input into the shell. Both share a [`LocalIo`], whose one-shot close ends
//! the output read and stops further input writes.

use std::{
    io,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use hostagent_core::{
    AgentMessage, DataChannel, InboundHandler, MessageType, PayloadType, SessionState, ShellControl,
};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::{Mutex, watch},
};

use crate::transcript::Transcript;

/// Maximum number of bytes carried by one output frame.
pub const STREAM_CHUNK_SIZE: usize = 1024;

/// How long closing the shell input may wait for it to flush.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Local shell input handle plus the session's close signal.
pub struct LocalIo {
    stdin: Mutex<Option<BoxedWriter>>,
    closed: AtomicBool,
    close_tx: watch::Sender<bool>,
}

impl std::fmt::Debug for LocalIo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalIo")
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl LocalIo {
    /// Wrap the shell's input.
    #[must_use]
    pub fn new(stdin: BoxedWriter) -> Arc<Self> {
        let (close_tx, _) = watch::channel(false);
        Arc::new(Self {
            stdin: Mutex::new(Some(stdin)),
            closed: AtomicBool::new(false),
            close_tx,
        })
    }

    /// Whether teardown has begun.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Receiver that flips to `true` when [`close`](Self::close) runs.
    #[must_use]
    pub fn closed_signal(&self) -> watch::Receiver<bool> {
        self.close_tx.subscribe()
    }

    /// Write `bytes` to the shell and flush.
    ///
    /// A write still pending when [`close`](Self::close) runs is abandoned, so
    /// a shell that stops reading its input cannot hold up teardown.
    ///
    /// # Errors
    /// Returns `BrokenPipe` after close, or the underlying write error.
    pub async fn write_input(&self, bytes: &[u8]) -> io::Result<()> {
        if self.is_closed() {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        let mut closed = self.closed_signal();

        let mut guard = tokio::select! {
            _ = closed.wait_for(|closed| *closed) => return Err(io::ErrorKind::BrokenPipe.into()),
            guard = self.stdin.lock() => guard,
        };
        let writer = guard
            .as_mut()
            .ok_or_else(|| io::Error::from(io::ErrorKind::BrokenPipe))?;

        tokio::select! {
            _ = closed.wait_for(|closed| *closed) => Err(io::ErrorKind::BrokenPipe.into()),
            written = async {
                writer.write_all(bytes).await?;
                writer.flush().await
            } => written,
        }
    }

    /// Close both directions. Returns `false` if already closed.
    pub async fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.close_tx.send_replace(true);

        let writer = self.stdin.lock().await.take();
        if let Some(mut writer) = writer {
            match tokio::time::timeout(CLOSE_TIMEOUT, writer.shutdown()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::debug!(error = %e, "Error closing shell input"),
                Err(_) => tracing::debug!("Timed out closing shell input"),
            }
        }
        true
    }
}

/// Sends the Terminating notification at most once per session.
pub struct TerminationNotice {
    sent: AtomicBool,
    channel: Arc<dyn DataChannel>,
}

impl TerminationNotice {
    #[must_use]
    pub fn new(channel: Arc<dyn DataChannel>) -> Arc<Self> {
        Arc::new(Self {
            sent: AtomicBool::new(false),
            channel,
        })
    }

    /// Send Terminating unless already sent. Returns whether this call sent it.
    pub async fn send_once(&self) -> bool {
        if self.sent.swap(true, Ordering::SeqCst) {
            return false;
        }
        if let Err(e) = self.channel.send_session_state(SessionState::Terminating).await {
            tracing::warn!(error = %e, "Failed to send Terminating state");
        }
        true
    }
}

/// Counters reported when the output pump exits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PumpStats {
    pub frames_sent: u64,
    pub bytes_sent: u64,
    pub send_failures: u64,
}

/// Copies local shell output into `Output` frames.
pub struct OutputPump<R> {
    reader: R,
    channel: Arc<dyn DataChannel>,
    closed: watch::Receiver<bool>,
    notice: Arc<TerminationNotice>,
    transcript: Option<Transcript>,
    session_id: String,
}

impl<R> OutputPump<R>
where
    R: AsyncRead + Unpin + Send,
{
    #[must_use]
    pub fn new(
        reader: R,
        channel: Arc<dyn DataChannel>,
        local: &LocalIo,
        notice: Arc<TerminationNotice>,
        session_id: impl Into<String>,
    ) -> Self {
        Self {
            reader,
            channel,
            closed: local.closed_signal(),
            notice,
            transcript: None,
            session_id: session_id.into(),
        }
    }

    /// Also copy every chunk read into `transcript`.
    #[must_use]
    pub fn with_transcript(mut self, transcript: Transcript) -> Self {
        self.transcript = Some(transcript);
        self
    }

    /// Pump until end of stream or close, then announce Terminating.
    ///
    /// Send failures are logged and the pump keeps reading.
    pub async fn run(mut self) -> PumpStats {
        let mut buf = vec![0u8; STREAM_CHUNK_SIZE];
        let mut stats = PumpStats::default();
        let mut consecutive_failures: u32 = 0;

        loop {
            let read = tokio::select! {
                biased;
                _ = self.closed.wait_for(|closed| *closed) => break,
                read = self.reader.read(&mut buf) => read,
            };

            match read {
                Ok(0) => break,
                Ok(n) => {
                    if let Some(transcript) = self.transcript.as_mut() {
                        transcript.record(&buf[..n]).await;
                    }
                    match self.channel.send_stream_data(PayloadType::Output, &buf[..n]).await {
                        Ok(()) => {
                            consecutive_failures = 0;
                            stats.frames_sent += 1;
                            stats.bytes_sent += n as u64;
                        }
                        Err(e) => {
                            consecutive_failures += 1;
                            stats.send_failures += 1;
                            tracing::warn!(
                                session_id = %self.session_id,
                                consecutive_failures,
                                error = %e,
                                "Failed to send shell output"
                            );
                        }
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    tracing::debug!(session_id = %self.session_id, error = %e, "Shell output closed");
                    break;
                }
            }
        }

        if let Some(transcript) = self.transcript.as_mut() {
            transcript.finish().await;
        }
        self.notice.send_once().await;
        tracing::debug!(session_id = %self.session_id, ?stats, "Output pump finished");
        stats
    }
}

/// Writes remote input into the local shell.
pub struct InputPump {
    local: Arc<LocalIo>,
    control: Arc<dyn ShellControl>,
    session_id: String,
}

impl InputPump {
    #[must_use]
    pub fn new(local: Arc<LocalIo>, control: Arc<dyn ShellControl>, session_id: impl Into<String>) -> Self {
        Self {
            local,
            control,
            session_id: session_id.into(),
        }
    }
}

#[async_trait]
impl InboundHandler for InputPump {
    async fn on_message(&self, message: AgentMessage) {
        if message.message_type != MessageType::InputStreamData {
            tracing::trace!(message_type = %message.message_type, "Ignoring frame");
            return;
        }
        if self.local.is_closed() {
            tracing::debug!(
                session_id = %self.session_id,
                sequence_number = message.sequence_number,
                "Dropping input after close"
            );
            return;
        }

        match message.payload_type {
            PayloadType::Output => {
                if let Err(e) = self.local.write_input(&message.payload).await {
                    tracing::debug!(session_id = %self.session_id, error = %e, "Failed to write shell input");
                }
            }
            PayloadType::Size => match message.terminal_size() {
                Ok(size) => {
                    if let Err(e) = self.control.resize(size.cols, size.rows) {
                        tracing::warn!(session_id = %self.session_id, error = %e, "Failed to resize terminal");
                    }
                }
                Err(e) => {
                    tracing::warn!(session_id = %self.session_id, error = %e, "Malformed size payload");
                }
            },
            other => {
                tracing::debug!(session_id = %self.session_id, payload_type = ?other, "Ignoring input payload");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use hostagent_core::MessageFramer;

    use super::*;
    use crate::test_support::{FakeChannel, FakeControl, Sent};

    fn pump<R: AsyncRead + Unpin + Send>(
        reader: R,
        channel: &Arc<FakeChannel>,
        local: &LocalIo,
    ) -> OutputPump<R> {
        let channel: Arc<dyn DataChannel> = channel.clone();
        OutputPump::new(reader, Arc::clone(&channel), local, TerminationNotice::new(channel), "s-1")
    }

    #[tokio::test]
    async fn test_output_pump_sends_payload_then_terminating() {
        let channel = FakeChannel::new();
        let local = LocalIo::new(Box::new(tokio::io::sink()));
        let reader = tokio_test::io::Builder::new().read(b"testPayload").build();

        let stats = pump(reader, &channel, &local).run().await;

        assert_eq!(
            channel.sent(),
            vec![
                Sent::Data(PayloadType::Output, b"testPayload".to_vec()),
                Sent::State(SessionState::Terminating),
            ]
        );
        assert_eq!(stats.frames_sent, 1);
    }

    #[tokio::test]
    async fn test_output_pump_preserves_bytes_in_order() {
        let channel = FakeChannel::new();
        let local = LocalIo::new(Box::new(tokio::io::sink()));
        let big = vec![b'x'; STREAM_CHUNK_SIZE * 2 + 17];
        let reader = tokio_test::io::Builder::new()
            .read(b"first ")
            .read(&big)
            .read(b"\x00\xff last")
            .build();

        let stats = pump(reader, &channel, &local).run().await;

        let mut expected = b"first ".to_vec();
        expected.extend_from_slice(&big);
        expected.extend_from_slice(b"\x00\xff last");
        assert_eq!(channel.output_bytes(), expected);
        assert!(channel.sent().iter().all(|s| match s {
            Sent::Data(_, bytes) => bytes.len() <= STREAM_CHUNK_SIZE,
            Sent::State(_) => true,
        }));
        assert_eq!(stats.bytes_sent, expected.len() as u64);
    }

    #[tokio::test]
    async fn test_output_pump_continues_after_send_failure() {
        let channel = FakeChannel::new();
        channel.fail_next_sends(1);
        let local = LocalIo::new(Box::new(tokio::io::sink()));
        let reader = tokio_test::io::Builder::new().read(b"lost").read(b"kept").build();

        let stats = pump(reader, &channel, &local).run().await;

        assert_eq!(channel.output_bytes(), b"kept");
        assert_eq!(stats.send_failures, 1);
        assert_eq!(channel.terminating_count(), 1);
    }

    #[tokio::test]
    async fn test_output_pump_exits_on_close() {
        let channel = FakeChannel::new();
        let local = LocalIo::new(Box::new(tokio::io::sink()));
        let (reader, _writer) = tokio::io::duplex(64);

        let task = tokio::spawn(pump(reader, &channel, &local).run());
        assert!(local.close().await);
        assert!(!local.close().await);

        let stats = task.await.unwrap();
        assert_eq!(stats.frames_sent, 0);
        assert_eq!(channel.sent(), vec![Sent::State(SessionState::Terminating)]);
    }

    #[tokio::test]
    async fn test_output_pump_copies_into_transcript() {
        let channel = FakeChannel::new();
        channel.fail_next_sends(1);
        let local = LocalIo::new(Box::new(tokio::io::sink()));
        let reader = tokio_test::io::Builder::new().read(b"one ").read(b"two").build();
        let transcript = tokio_test::io::Builder::new().write(b"one ").write(b"two").build();

        pump(reader, &channel, &local)
            .with_transcript(Transcript::new(Box::new(transcript)))
            .run()
            .await;

        // The transcript keeps output the channel failed to deliver.
        assert_eq!(channel.output_bytes(), b"two");
    }

    #[tokio::test]
    async fn test_close_abandons_stalled_write() {
        // Nobody reads the far end, so a large write never completes.
        let (stdin, _shell_side) = tokio::io::duplex(16);
        let local = LocalIo::new(Box::new(stdin));

        let writer = {
            let local = Arc::clone(&local);
            tokio::spawn(async move { local.write_input(&[b'a'; 100]).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!writer.is_finished());

        let closed = tokio::time::timeout(std::time::Duration::from_secs(5), local.close())
            .await
            .expect("close waited on the stalled write");
        assert!(closed);

        let err = writer.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[tokio::test]
    async fn test_termination_notice_sent_once() {
        let channel = FakeChannel::new();
        let notice = TerminationNotice::new(channel.clone());
        assert!(notice.send_once().await);
        assert!(!notice.send_once().await);
        assert_eq!(channel.terminating_count(), 1);
    }

    #[tokio::test]
    async fn test_input_pump_writes_input_payload() {
        let writer = tokio_test::io::Builder::new().write(b"ls\n").build();
        let local = LocalIo::new(Box::new(writer));
        let input = InputPump::new(Arc::clone(&local), FakeControl::new(), "s-1");
        let framer = MessageFramer::new();

        input
            .on_message(framer.frame(MessageType::InputStreamData, PayloadType::Output, 0, &b"ls\n"[..]))
            .await;
        // Output frames travelling the wrong way are not written.
        input
            .on_message(framer.frame(MessageType::OutputStreamData, PayloadType::Output, 0, &b"no"[..]))
            .await;

        local.close().await;
    }

    #[tokio::test]
    async fn test_input_pump_drops_after_close() {
        let writer = tokio_test::io::Builder::new().build();
        let local = LocalIo::new(Box::new(writer));
        let input = InputPump::new(Arc::clone(&local), FakeControl::new(), "s-1");
        local.close().await;

        input
            .on_message(MessageFramer::new().frame(
                MessageType::InputStreamData,
                PayloadType::Output,
                0,
                &b"late"[..],
            ))
            .await;
        assert!(local.write_input(b"x").await.is_err());
    }

    #[tokio::test]
    async fn test_input_pump_resizes() {
        let local = LocalIo::new(Box::new(tokio::io::sink()));
        let control = FakeControl::new();
        let input = InputPump::new(local, control.clone(), "s-1");
        let framer = MessageFramer::new();

        input
            .on_message(framer.frame(
                MessageType::InputStreamData,
                PayloadType::Size,
                0,
                &br#"{"cols":132,"rows":43}"#[..],
            ))
            .await;
        input
            .on_message(framer.frame(MessageType::InputStreamData, PayloadType::Size, 0, &b"{bad"[..]))
            .await;

        assert_eq!(control.resizes(), vec![(132, 43)]);
    }
}
