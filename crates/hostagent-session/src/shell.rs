//! Interactive shell session plugin.
//!
//! [`ShellPlugin::execute`] validates the audit sinks, opens the transcript,
//! spawns the local shell, runs the two pumps and blocks on the session's
//! [`CancelFlag`]. Whatever
//! ends the session, teardown runs in the same order: stop the process or
//! drain its output, close local I/O, announce Terminating, then report to
//! the [`IoHandler`].

use std::{sync::Arc, time::Duration};

use hostagent_core::{
    AuditSink, CancelFlag, DataChannel, ERROR_EXIT_CODE, IoHandler, Outcome, ResultStatus,
    SessionConfig, ShellProvider, SpawnedShell,
};

use crate::{
    pump::{InputPump, LocalIo, OutputPump, TerminationNotice},
    transcript::Transcript,
    validate::{AuditSinks, validate},
};

/// How long trailing output may keep flowing after the process exits.
pub const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Exit code recorded when the process exit status is unavailable.
const UNKNOWN_EXIT_CODE: i32 = -1;

/// Final report for one session.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Report {
    ShutDown,
    Cancelled,
    Exited(i32),
    Failed(String),
}

/// Forwards exactly one [`Report`] to the handler.
struct Reporter<'a> {
    io: &'a dyn IoHandler,
    reported: bool,
}

impl<'a> Reporter<'a> {
    const fn new(io: &'a dyn IoHandler) -> Self {
        Self { io, reported: false }
    }

    fn finish(&mut self, report: Report) {
        if self.reported {
            tracing::debug!(?report, "Session already reported");
            return;
        }
        self.reported = true;

        match report {
            Report::ShutDown => self.io.mark_as_shutdown(),
            Report::Cancelled => self.io.mark_as_cancelled(),
            Report::Exited(code) => {
                self.io.set_exit_code(code);
                self.io.set_status(ResultStatus::from_exit_code(code));
            }
            Report::Failed(message) => {
                self.io.append_error(&message);
                self.io.set_exit_code(ERROR_EXIT_CODE);
                self.io.set_status(ResultStatus::Failed);
            }
        }
    }
}

/// Runs interactive shell sessions.
pub struct ShellPlugin {
    provider: Arc<dyn ShellProvider>,
    log_sink: Arc<dyn AuditSink>,
    bucket_sink: Arc<dyn AuditSink>,
    drain_timeout: Duration,
}

impl ShellPlugin {
    /// Create a plugin spawning shells from `provider` and checking the two
    /// audit sinks before each session.
    #[must_use]
    pub fn new(
        provider: Arc<dyn ShellProvider>,
        log_sink: Arc<dyn AuditSink>,
        bucket_sink: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            provider,
            log_sink,
            bucket_sink,
            drain_timeout: OUTPUT_DRAIN_TIMEOUT,
        }
    }

    /// Override [`OUTPUT_DRAIN_TIMEOUT`].
    #[must_use]
    pub const fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Run one session to completion.
    ///
    /// Returns once the outcome has been reported to `io`. Pump errors never
    /// end the session; only `flag` and the process exit do.
    pub async fn execute(
        &self,
        config: &SessionConfig,
        flag: &CancelFlag,
        io: &dyn IoHandler,
        channel: Arc<dyn DataChannel>,
    ) {
        let session_id = config.session_id.as_str();
        let mut reporter = Reporter::new(io);

        if flag.is_shut_down() {
            tracing::info!(session_id, "Agent shutting down, session not started");
            reporter.finish(Report::ShutDown);
            return;
        }
        if flag.is_canceled() {
            tracing::info!(session_id, "Session cancelled before start");
            reporter.finish(Report::Cancelled);
            return;
        }

        let sinks = AuditSinks {
            log_group: self.log_sink.as_ref(),
            bucket: self.bucket_sink.as_ref(),
        };
        if let Err(e) = validate(&config.audit, sinks, session_id).await {
            tracing::error!(session_id, error = %e, "Session validation failed");
            reporter.finish(Report::Failed(e.to_string()));
            return;
        }

        let transcript = match config.resolved_transcript_path() {
            Some(path) => match Transcript::create(&path).await {
                Ok(transcript) => Some(transcript),
                Err(e) => {
                    tracing::error!(
                        session_id,
                        path = %path.display(),
                        error = %e,
                        "Failed to create session transcript"
                    );
                    reporter.finish(Report::Failed(format!(
                        "Failed to create session transcript {}: {e}",
                        path.display()
                    )));
                    return;
                }
            },
            None => None,
        };

        let shell = match self.provider.spawn(config).await {
            Ok(shell) => shell,
            Err(e) => {
                tracing::error!(session_id, error = %e, "Failed to start shell");
                reporter.finish(Report::Failed(format!("Failed to start shell: {e}")));
                return;
            }
        };

        let report = self.run(session_id, shell, transcript, flag, channel).await;
        tracing::info!(session_id, ?report, "Session finished");
        reporter.finish(report);
    }

    async fn run(
        &self,
        session_id: &str,
        shell: SpawnedShell,
        transcript: Option<Transcript>,
        flag: &CancelFlag,
        channel: Arc<dyn DataChannel>,
    ) -> Report {
        let SpawnedShell {
            stdin,
            stdout,
            exit,
            control,
        } = shell;

        let local = LocalIo::new(stdin);
        let notice = TerminationNotice::new(Arc::clone(&channel));
        channel.set_handler(Arc::new(InputPump::new(
            Arc::clone(&local),
            Arc::clone(&control),
            session_id,
        )));
        let mut output =
            OutputPump::new(stdout, Arc::clone(&channel), &local, Arc::clone(&notice), session_id);
        if let Some(transcript) = transcript {
            output = output.with_transcript(transcript);
        }
        let mut pump = tokio::spawn(output.run());
        let mut watcher = {
            let flag = flag.clone();
            tokio::spawn(async move {
                let code = exit.await;
                flag.complete();
                code
            })
        };

        let outcome = flag.wait().await;
        tracing::debug!(session_id, ?outcome, "Session outcome");

        let drained = match outcome {
            Outcome::Completed => {
                match tokio::time::timeout(self.drain_timeout, &mut pump).await {
                    Ok(result) => Some(result),
                    Err(_) => {
                        tracing::debug!(session_id, "Shell output still open after exit");
                        None
                    }
                }
            }
            Outcome::Canceled | Outcome::ShutDown => {
                if let Err(e) = control.kill() {
                    tracing::warn!(session_id, error = %e, "Failed to kill shell");
                }
                None
            }
        };

        local.close().await;
        let pumped = match drained {
            Some(result) => result,
            None => pump.await,
        };
        if let Err(e) = pumped {
            tracing::warn!(session_id, error = %e, "Output pump task failed");
        }
        notice.send_once().await;
        channel.clear_handler();

        match outcome {
            Outcome::ShutDown => {
                let _ = tokio::time::timeout(self.drain_timeout, &mut watcher).await;
                Report::ShutDown
            }
            Outcome::Canceled => {
                let _ = tokio::time::timeout(self.drain_timeout, &mut watcher).await;
                Report::Cancelled
            }
            Outcome::Completed => {
                if !watcher.is_finished() {
                    // Completed from outside while the process still runs.
                    if let Err(e) = control.kill() {
                        tracing::warn!(session_id, error = %e, "Failed to kill shell");
                    }
                }
                match tokio::time::timeout(self.drain_timeout, &mut watcher).await {
                    Ok(Ok(code)) => Report::Exited(code),
                    Ok(Err(e)) => {
                        tracing::warn!(session_id, error = %e, "Exit watcher failed");
                        Report::Exited(UNKNOWN_EXIT_CODE)
                    }
                    Err(_) => Report::Exited(UNKNOWN_EXIT_CODE),
                }
            }
        }
    }
}
