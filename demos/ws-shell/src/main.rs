//! Serve interactive shell sessions over WebSocket.
//!
//! Run with: cargo run -p ws-shell-demo
//!
//! Each connection to `ws://127.0.0.1:3000/ws` gets its own shell. Set
//! `HOSTAGENT_LISTEN` to change the address, `HOSTAGENT_SHELL` to run a
//! different shell and `HOSTAGENT_CONFIG` to load a session template from a
//! JSON file.

use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::Context;
use async_trait::async_trait;
use hostagent_core::{AuditSink, SessionConfig};
use hostagent_executor::PtyShellProvider;
use hostagent_session::ShellPlugin;
use hostagent_transport::websocket::{WsState, create_ws_router};
use tower_http::cors::CorsLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_LISTEN: &str = "127.0.0.1:3000";

/// Audit sink for local runs with nothing to provision.
struct LocalSink;

#[async_trait]
impl AuditSink for LocalSink {
    async fn is_encrypted(&self, _sink_id: &str) -> bool {
        true
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let addr: SocketAddr = std::env::var("HOSTAGENT_LISTEN")
        .unwrap_or_else(|_| DEFAULT_LISTEN.to_string())
        .parse()
        .context("HOSTAGENT_LISTEN is not a socket address")?;

    let template = match std::env::var_os("HOSTAGENT_CONFIG") {
        Some(path) => {
            let path = PathBuf::from(path);
            SessionConfig::from_path(&path)
                .with_context(|| format!("Failed to load {}", path.display()))?
        }
        None => SessionConfig::default(),
    };

    let mut provider = PtyShellProvider::new();
    if let Ok(shell) = std::env::var("HOSTAGENT_SHELL") {
        tracing::info!(%shell, "Using shell override");
        provider = provider.with_shell(shell);
    }

    let plugin = ShellPlugin::new(Arc::new(provider), Arc::new(LocalSink), Arc::new(LocalSink));
    let app = create_ws_router(WsState::new(Arc::new(plugin), template))
        .layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    tracing::info!("Listening on ws://{addr}/ws");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutting down");
        })
        .await
        .context("Server failed")?;
    Ok(())
}
