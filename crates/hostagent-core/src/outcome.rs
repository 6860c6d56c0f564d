//! In-process [`IoHandler`] that keeps the first reported outcome.

use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::Serialize;

use crate::traits::{ERROR_EXIT_CODE, IoHandler, ResultStatus};

/// Snapshot of a session's recorded outcome.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OutcomeSnapshot {
    pub exit_code: Option<i32>,
    pub status: Option<ResultStatus>,
    pub errors: Vec<String>,
}

/// Records exit code and status once; later writes are ignored.
#[derive(Debug, Default)]
pub struct SessionOutcome {
    inner: Mutex<OutcomeSnapshot>,
}

impl SessionOutcome {
    /// Create an empty outcome.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the recorded outcome.
    #[must_use]
    pub fn snapshot(&self) -> OutcomeSnapshot {
        self.lock().clone()
    }

    /// Whether a final status has been recorded.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.lock().status.is_some()
    }

    fn lock(&self) -> MutexGuard<'_, OutcomeSnapshot> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn finish(&self, status: ResultStatus, code: i32) {
        let mut inner = self.lock();
        if inner.status.is_none() {
            inner.status = Some(status);
        }
        if inner.exit_code.is_none() {
            inner.exit_code = Some(code);
        }
    }
}

impl IoHandler for SessionOutcome {
    fn set_exit_code(&self, code: i32) {
        let mut inner = self.lock();
        if let Some(existing) = inner.exit_code {
            tracing::debug!(existing, ignored = code, "Exit code already recorded");
            return;
        }
        inner.exit_code = Some(code);
    }

    fn set_status(&self, status: ResultStatus) {
        let mut inner = self.lock();
        if let Some(existing) = inner.status {
            tracing::debug!(%existing, ignored = %status, "Status already recorded");
            return;
        }
        inner.status = Some(status);
    }

    fn mark_as_cancelled(&self) {
        self.finish(ResultStatus::Cancelled, ERROR_EXIT_CODE);
    }

    fn mark_as_shutdown(&self) {
        self.finish(ResultStatus::ShutDown, ERROR_EXIT_CODE);
    }

    fn append_error(&self, message: &str) {
        self.lock().errors.push(message.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_exit_code_wins() {
        let outcome = SessionOutcome::new();
        outcome.set_exit_code(0);
        outcome.set_status(ResultStatus::Success);
        outcome.set_exit_code(2);
        outcome.set_status(ResultStatus::Failed);

        let snap = outcome.snapshot();
        assert_eq!(snap.exit_code, Some(0));
        assert_eq!(snap.status, Some(ResultStatus::Success));
    }

    #[test]
    fn test_cancel_after_completion_is_ignored() {
        let outcome = SessionOutcome::new();
        outcome.set_exit_code(0);
        outcome.set_status(ResultStatus::Success);
        outcome.mark_as_cancelled();

        assert_eq!(outcome.snapshot().status, Some(ResultStatus::Success));
    }

    #[test]
    fn test_shutdown_sets_error_exit_code() {
        let outcome = SessionOutcome::new();
        assert!(!outcome.is_finished());
        outcome.mark_as_shutdown();

        let snap = outcome.snapshot();
        assert!(outcome.is_finished());
        assert_eq!(snap.status, Some(ResultStatus::ShutDown));
        assert_eq!(snap.exit_code, Some(ERROR_EXIT_CODE));
    }

    #[test]
    fn test_errors_accumulate() {
        let outcome = SessionOutcome::new();
        outcome.append_error("first");
        outcome.append_error("second");
        assert_eq!(outcome.snapshot().errors, vec!["first", "second"]);
    }
}
