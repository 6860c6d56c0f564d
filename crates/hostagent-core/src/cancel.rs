//! Shared cancellation signal for a running session.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Current state of a [`CancelFlag`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelState {
    /// Work is in progress.
    Running,
    /// An operator cancelled the work.
    Canceled,
    /// The agent is shutting down.
    ShutDown,
    /// The work finished on its own.
    Completed,
}

impl CancelState {
    /// Whether this state is final.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// Terminal outcome returned by [`CancelFlag::wait`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Completed,
    Canceled,
    ShutDown,
}

/// Thread-safe tri-state signal with a blocking wait.
///
/// The first terminal state wins; later transitions are ignored.
#[derive(Debug, Clone)]
pub struct CancelFlag {
    tx: Arc<watch::Sender<CancelState>>,
}

impl Default for CancelFlag {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelFlag {
    /// Create a flag in the `Running` state.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = watch::channel(CancelState::Running);
        Self { tx: Arc::new(tx) }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> CancelState {
        *self.tx.borrow()
    }

    /// Non-blocking poll for cancellation.
    #[must_use]
    pub fn is_canceled(&self) -> bool {
        self.state() == CancelState::Canceled
    }

    /// Non-blocking poll for agent shutdown.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.state() == CancelState::ShutDown
    }

    /// Request cancellation. Returns `false` if the flag was already terminal.
    pub fn cancel(&self) -> bool {
        self.set(CancelState::Canceled)
    }

    /// Signal agent shutdown. Returns `false` if the flag was already terminal.
    pub fn shut_down(&self) -> bool {
        self.set(CancelState::ShutDown)
    }

    /// Mark the work as finished. Returns `false` if the flag was already terminal.
    pub fn complete(&self) -> bool {
        self.set(CancelState::Completed)
    }

    /// Transition from `Running` to `state`.
    pub fn set(&self, state: CancelState) -> bool {
        if !state.is_terminal() {
            return false;
        }
        self.tx.send_if_modified(|current| {
            if current.is_terminal() {
                false
            } else {
                *current = state;
                true
            }
        })
    }

    /// Wait until the flag reaches a terminal state.
    pub async fn wait(&self) -> Outcome {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        let state = rx
            .wait_for(|s| s.is_terminal())
            .await
            .map_or(CancelState::ShutDown, |s| *s);
        match state {
            CancelState::Canceled => Outcome::Canceled,
            CancelState::Completed => Outcome::Completed,
            CancelState::ShutDown | CancelState::Running => Outcome::ShutDown,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_new_flag_is_running() {
        let flag = CancelFlag::new();
        assert_eq!(flag.state(), CancelState::Running);
        assert!(!flag.is_canceled());
        assert!(!flag.is_shut_down());
    }

    #[test]
    fn test_first_terminal_state_wins() {
        let flag = CancelFlag::new();
        assert!(flag.cancel());
        assert!(!flag.shut_down());
        assert!(!flag.complete());
        assert!(flag.is_canceled());
        assert!(!flag.is_shut_down());
    }

    #[test]
    fn test_running_is_not_a_transition() {
        let flag = CancelFlag::new();
        assert!(!flag.set(CancelState::Running));
    }

    #[tokio::test]
    async fn test_wait_returns_immediately_when_terminal() {
        let flag = CancelFlag::new();
        flag.shut_down();
        assert_eq!(flag.wait().await, Outcome::ShutDown);
    }

    #[tokio::test]
    async fn test_wait_wakes_on_completion() {
        let flag = CancelFlag::new();
        let waiter = {
            let flag = flag.clone();
            tokio::spawn(async move { flag.wait().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        flag.complete();
        assert_eq!(waiter.await.unwrap(), Outcome::Completed);
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let flag = CancelFlag::new();
        let other = flag.clone();
        other.cancel();
        assert_eq!(flag.wait().await, Outcome::Canceled);
    }
}
