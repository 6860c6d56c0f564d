//! Session manager for running shell sessions in the background.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use hostagent_core::{CancelFlag, DataChannel, OutcomeSnapshot, SessionConfig, SessionOutcome};
use tokio::{
    sync::{RwLock, watch},
    task::JoinHandle,
};
use uuid::Uuid;

use crate::shell::ShellPlugin;

/// Session manager error.
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("Session not found: {0}")]
    NotFound(String),
    #[error("Session already running: {0}")]
    AlreadyRunning(String),
    #[error("Session manager is shutting down")]
    ShuttingDown,
}

/// Active session state.
struct ActiveSession {
    flag: CancelFlag,
    task: JoinHandle<()>,
}

/// Caller's view of a started session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub session_id: String,
    pub flag: CancelFlag,
    outcome: Arc<SessionOutcome>,
    finished: watch::Receiver<bool>,
}

impl SessionHandle {
    /// Outcome recorded so far.
    #[must_use]
    pub fn outcome(&self) -> OutcomeSnapshot {
        self.outcome.snapshot()
    }

    /// Wait until the session has reported its outcome.
    pub async fn finished(&mut self) -> OutcomeSnapshot {
        // The sender is dropped after the final send, which also ends the wait.
        let _ = self.finished.wait_for(|done| *done).await;
        self.outcome.snapshot()
    }
}

type SessionMap = Arc<RwLock<HashMap<String, ActiveSession>>>;

/// Runs shell sessions as background tasks keyed by session id.
pub struct SessionManager {
    plugin: Arc<ShellPlugin>,
    active_sessions: SessionMap,
    shutting_down: AtomicBool,
}

impl SessionManager {
    /// Create a new session manager.
    #[must_use]
    pub fn new(plugin: Arc<ShellPlugin>) -> Self {
        Self {
            plugin,
            active_sessions: Arc::new(RwLock::new(HashMap::new())),
            shutting_down: AtomicBool::new(false),
        }
    }

    /// Start a session over `channel`.
    ///
    /// A session id is generated when the configuration has none.
    ///
    /// # Errors
    /// Returns error if the id is already running or the manager is shutting
    /// down.
    pub async fn start_session(
        &self,
        mut config: SessionConfig,
        channel: Arc<dyn DataChannel>,
    ) -> Result<SessionHandle, ManagerError> {
        if config.session_id.is_empty() {
            config.session_id = Uuid::new_v4().to_string();
        }
        let session_id = config.session_id.clone();

        // Hold the lock until the entry is inserted so a fast session cannot
        // remove itself before it is registered. `shutdown` raises its flag
        // before draining under this lock, so checking here cannot miss it.
        let mut sessions = self.active_sessions.write().await;
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(ManagerError::ShuttingDown);
        }
        if sessions.contains_key(&session_id) {
            return Err(ManagerError::AlreadyRunning(session_id));
        }

        let flag = CancelFlag::new();
        let outcome = Arc::new(SessionOutcome::new());
        let (finished_tx, finished_rx) = watch::channel(false);

        let task = {
            let plugin = Arc::clone(&self.plugin);
            let flag = flag.clone();
            let outcome = Arc::clone(&outcome);
            let sessions = Arc::clone(&self.active_sessions);
            tokio::spawn(async move {
                plugin
                    .execute(&config, &flag, outcome.as_ref(), channel)
                    .await;
                sessions.write().await.remove(&config.session_id);
                finished_tx.send_replace(true);
            })
        };

        tracing::info!(%session_id, "Session started");
        sessions.insert(
            session_id.clone(),
            ActiveSession {
                flag: flag.clone(),
                task,
            },
        );

        Ok(SessionHandle {
            session_id,
            flag,
            outcome,
            finished: finished_rx,
        })
    }

    /// Cancel a running session.
    ///
    /// # Errors
    /// Returns error if session not found.
    pub async fn cancel_session(&self, session_id: &str) -> Result<(), ManagerError> {
        let sessions = self.active_sessions.read().await;
        let session = sessions
            .get(session_id)
            .ok_or_else(|| ManagerError::NotFound(session_id.to_string()))?;
        if session.flag.cancel() {
            tracing::info!(session_id, "Session cancelled");
        }
        Ok(())
    }

    /// Shut down every session and wait for them to finish.
    ///
    /// New sessions are refused from this point on.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);

        let drained: Vec<(String, ActiveSession)> =
            self.active_sessions.write().await.drain().collect();
        for (_, session) in &drained {
            session.flag.shut_down();
        }
        tracing::info!(sessions = drained.len(), "Shutting down sessions");

        for (session_id, session) in drained {
            if let Err(e) = session.task.await {
                tracing::warn!(%session_id, error = %e, "Session task failed");
            }
        }
    }

    /// Ids of running sessions, sorted.
    pub async fn active_sessions(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.active_sessions.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }
}
