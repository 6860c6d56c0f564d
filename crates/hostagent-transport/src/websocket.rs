//! WebSocket data channel for shell sessions.
//!
//! Each socket runs one session. Binary messages carry encoded frames; text
//! messages carry base64-encoded frames. Closing the socket cancels the
//! session.

use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use axum::{
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::IntoResponse,
};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use hostagent_core::{
    AgentMessage, CancelFlag, ChannelError, DataChannel, InboundHandler, MessageFramer,
    MessageType, PayloadType, SessionConfig, SessionOutcome, SessionState,
};
use hostagent_session::ShellPlugin;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::protocol::{HandlerSlot, decode_binary, decode_text};

/// How long queued frames may take to flush once a session ends.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Agent side of a WebSocket session.
pub struct WsDataChannel {
    session_id: String,
    /// Held while a frame is numbered and queued.
    framer: Mutex<MessageFramer>,
    tx: mpsc::UnboundedSender<Message>,
    handler: HandlerSlot,
}

impl WsDataChannel {
    /// Create a channel queuing outgoing messages on `tx`.
    #[must_use]
    pub fn new(session_id: impl Into<String>, tx: mpsc::UnboundedSender<Message>) -> Self {
        Self {
            session_id: session_id.into(),
            framer: Mutex::new(MessageFramer::new()),
            tx,
            handler: HandlerSlot::default(),
        }
    }

    /// Number and queue one frame, so queue order matches sequence order.
    fn send_framed(
        &self,
        build: impl FnOnce(&MessageFramer) -> Result<AgentMessage, ChannelError>,
    ) -> Result<(), ChannelError> {
        let framer = self.framer.lock().unwrap_or_else(PoisonError::into_inner);
        let message = build(&framer)?;
        self.tx
            .send(Message::Binary(message.encode()))
            .map_err(|_| ChannelError::Closed)
    }

    /// Route one message received from the socket.
    ///
    /// Returns `false` when the peer closed the socket.
    pub async fn receive(&self, message: Message) -> bool {
        match message {
            Message::Binary(data) => {
                self.handler.dispatch_decoded(decode_binary(&data)).await;
            }
            Message::Text(text) => {
                self.handler.dispatch_decoded(decode_text(text.as_str())).await;
            }
            Message::Close(_) => return false,
            Message::Ping(_) | Message::Pong(_) => {}
        }
        true
    }
}

#[async_trait]
impl DataChannel for WsDataChannel {
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

/// State shared by WebSocket session handlers.
#[derive(Clone)]
pub struct WsState {
    pub plugin: Arc<ShellPlugin>,
    /// Template for each session; the session id is generated per socket.
    pub config: SessionConfig,
}

impl WsState {
    /// Create new WebSocket state.
    #[must_use]
    pub const fn new(plugin: Arc<ShellPlugin>, config: SessionConfig) -> Self {
        Self { plugin, config }
    }
}

/// WebSocket upgrade handler.
///
/// Use this as an Axum route handler.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<WsState>) -> impl IntoResponse {
    ws.on_upgrade(|socket| serve_session(socket, state))
}

/// Run one shell session over `socket` until it ends.
pub async fn serve_session(socket: WebSocket, state: WsState) {
    let (sender, receiver) = socket.split();
    let (tx, rx) = mpsc::unbounded_channel::<Message>();

    let send_task = tokio::spawn(
        UnboundedReceiverStream::new(rx)
            .map(Ok::<_, axum::Error>)
            .forward(sender),
    );

    let mut config = state.config.clone();
    config.session_id = Uuid::new_v4().to_string();
    let session_id = config.session_id.clone();

    let channel = Arc::new(WsDataChannel::new(session_id.clone(), tx));
    if let Err(e) = channel.send_session_state(SessionState::Connected).await {
        tracing::warn!(%session_id, error = %e, "Failed to announce session");
    }

    let flag = CancelFlag::new();
    let outcome = SessionOutcome::new();
    let session = state.plugin.execute(
        &config,
        &flag,
        &outcome,
        Arc::clone(&channel) as Arc<dyn DataChannel>,
    );
    relay_socket(receiver, &channel, &flag, session).await;

    let snapshot = outcome.snapshot();
    tracing::info!(
        %session_id,
        status = ?snapshot.status,
        exit_code = ?snapshot.exit_code,
        "WebSocket session ended"
    );

    // The send task drains once every sender is gone.
    drop(channel);
    match tokio::time::timeout(FLUSH_TIMEOUT, send_task).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => tracing::debug!(%session_id, error = %e, "Socket closed before flush"),
        Ok(Err(e)) => tracing::warn!(%session_id, error = %e, "Send task failed"),
        Err(_) => tracing::warn!(%session_id, "Timed out flushing socket"),
    }
}

/// Feed socket messages to `channel` until `session` finishes.
///
/// Frames are dispatched from their own task so a handler stuck writing into
/// the shell never stops the loop from seeing the peer go away. Close, error
/// and end of stream cancel the session.
async fn relay_socket<S, F>(
    mut receiver: S,
    channel: &Arc<WsDataChannel>,
    flag: &CancelFlag,
    session: F,
) where
    S: Stream<Item = Result<Message, axum::Error>> + Unpin,
    F: Future<Output = ()>,
{
    let session_id = channel.session_id.clone();
    let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel::<Message>();
    let dispatcher = {
        let channel = Arc::clone(channel);
        tokio::spawn(async move {
            while let Some(message) = inbound_rx.recv().await {
                channel.receive(message).await;
            }
        })
    };

    tokio::pin!(session);
    let mut peer_open = true;
    loop {
        tokio::select! {
            () = &mut session => break,
            message = receiver.next(), if peer_open => {
                let reason = match message {
                    Some(Ok(Message::Close(_))) => "Peer closed socket",
                    Some(Ok(message)) => {
                        if inbound_tx.send(message).is_err() {
                            tracing::debug!(%session_id, "Inbound dispatcher gone");
                        }
                        continue;
                    }
                    Some(Err(e)) => {
                        tracing::warn!(%session_id, error = %e, "WebSocket error");
                        "WebSocket error"
                    }
                    None => "Peer disconnected",
                };
                tracing::info!(%session_id, reason, "Cancelling session");
                peer_open = false;
                flag.cancel();
            }
        }
    }

    // Input queued behind a stalled write is of no use once the session ended.
    drop(inbound_tx);
    dispatcher.abort();
    if let Err(e) = dispatcher.await {
        if !e.is_cancelled() {
            tracing::warn!(%session_id, error = %e, "Inbound dispatcher failed");
        }
    }
}

/// Create WebSocket router.
///
/// # Example
/// ```ignore
/// let app = Router::new()
///     .merge(create_ws_router(WsState::new(plugin, SessionConfig::default())));
/// ```
#[must_use]
pub fn create_ws_router(state: WsState) -> axum::Router {
    axum::Router::new()
        .route("/ws", axum::routing::get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
