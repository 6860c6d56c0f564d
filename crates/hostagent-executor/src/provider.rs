//! [`ShellProvider`] implementations.
//!
//! - [`PtyShellProvider`] runs the session inside a pseudo terminal.
//! - [`GroupShellProvider`] runs it in a process group over plain pipes,
//!   with stderr merged into stdout.

use std::{
    path::PathBuf,
    process::Stdio,
    sync::{Arc, Mutex, PoisonError},
};

use async_trait::async_trait;
use command_group::AsyncCommandGroup;
use futures::FutureExt;
use hostagent_core::{ExecutorError, SessionConfig, ShellControl, ShellProvider, SpawnedShell};
use hostagent_pty::{
    PtyControl, PtyRequest, PtyService, UNKNOWN_EXIT_CODE, default_working_dir,
    get_interactive_shell, get_shell_command,
};
use tokio::sync::oneshot;

use crate::command::{CommandBuildError, CommandBuilder};

impl From<CommandBuildError> for ExecutorError {
    fn from(err: CommandBuildError) -> Self {
        match err {
            CommandBuildError::ExecutableNotFound(program) => Self::ExecutableNotFound(program),
            other => Self::CommandBuild(other.to_string()),
        }
    }
}

fn working_dir(config: &SessionConfig) -> PathBuf {
    config
        .working_directory
        .clone()
        .unwrap_or_else(default_working_dir)
}

/// Spawns session shells inside a PTY.
#[derive(Debug, Clone, Default)]
pub struct PtyShellProvider {
    service: PtyService,
    shell: Option<CommandBuilder>,
}

impl PtyShellProvider {
    /// Provider using the user's login shell.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `command_line` (e.g. `bash --noprofile`) for interactive sessions.
    #[must_use]
    pub fn with_shell(mut self, command_line: impl Into<String>) -> Self {
        self.shell = Some(CommandBuilder::new(command_line));
        self
    }

    async fn program(&self, config: &SessionConfig) -> Result<(PathBuf, Vec<String>), ExecutorError> {
        if let Some(commands) = config.commands.as_deref().filter(|_| config.is_non_interactive()) {
            let (shell, flag) = get_shell_command();
            return Ok((PathBuf::from(shell), vec![flag.to_string(), commands.to_string()]));
        }
        match &self.shell {
            Some(builder) => Ok(builder.build()?.into_resolved().await?),
            None => Ok(get_interactive_shell().await),
        }
    }
}

struct PtyShellControl(PtyControl);

impl ShellControl for PtyShellControl {
    fn kill(&self) -> std::io::Result<()> {
        self.0.kill()
    }

    fn resize(&self, cols: u16, rows: u16) -> std::io::Result<()> {
        self.0.resize(cols, rows)
    }
}

#[async_trait]
impl ShellProvider for PtyShellProvider {
    async fn spawn(&self, config: &SessionConfig) -> Result<SpawnedShell, ExecutorError> {
        let (program, args) = self.program(config).await?;
        let request = PtyRequest::new(program, working_dir(config))
            .args(args)
            .size(config.cols, config.rows);

        let process = self
            .service
            .spawn(&request)
            .map_err(|e| ExecutorError::SpawnFailed(e.to_string()))?;

        tracing::info!(
            session_id = %config.session_id,
            pid = ?process.control.process_id(),
            program = %request.program.display(),
            "Spawned PTY shell"
        );

        let exit = process.exit;
        Ok(SpawnedShell {
            stdin: Box::new(process.stdin),
            stdout: Box::new(process.stdout),
            exit: async move { exit.await.unwrap_or(UNKNOWN_EXIT_CODE) }.boxed(),
            control: Arc::new(PtyShellControl(process.control)),
        })
    }
}

/// Spawns session shells in a process group connected through pipes.
///
/// There is no terminal, so resize requests are ignored. Killing the shell
/// terminates every process in its group.
#[derive(Debug, Clone, Copy, Default)]
pub struct GroupShellProvider;

impl GroupShellProvider {
    /// Create a provider.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

fn group_script(config: &SessionConfig, shell: &str) -> Result<String, CommandBuildError> {
    let body = match config.commands.as_deref().filter(|_| config.is_non_interactive()) {
        Some(commands) => commands.to_string(),
        None if cfg!(windows) => "cmd".to_string(),
        None => format!("exec {}", shlex::try_quote(shell)?),
    };
    if cfg!(windows) {
        Ok(format!("({body}) 2>&1"))
    } else {
        Ok(format!("exec 2>&1\n{body}"))
    }
}

struct GroupShellControl {
    kill_tx: Mutex<Option<oneshot::Sender<()>>>,
}

impl ShellControl for GroupShellControl {
    fn kill(&self) -> std::io::Result<()> {
        let sender = self
            .kill_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(tx) = sender {
            let _ = tx.send(());
        }
        Ok(())
    }

    fn resize(&self, _cols: u16, _rows: u16) -> std::io::Result<()> {
        Ok(())
    }
}

#[async_trait]
impl ShellProvider for GroupShellProvider {
    async fn spawn(&self, config: &SessionConfig) -> Result<SpawnedShell, ExecutorError> {
        let (shell, flag) = get_shell_command();
        let script = group_script(config, &shell)?;

        let mut child = tokio::process::Command::new(&shell)
            .arg(flag)
            .arg(script)
            .current_dir(working_dir(config))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .group_spawn()
            .map_err(|e| ExecutorError::SpawnFailed(e.to_string()))?;

        let stdin = child
            .inner()
            .stdin
            .take()
            .ok_or_else(|| ExecutorError::SpawnFailed("stdin not captured".into()))?;
        let stdout = child
            .inner()
            .stdout
            .take()
            .ok_or_else(|| ExecutorError::SpawnFailed("stdout not captured".into()))?;

        let pid = child.id();
        tracing::info!(session_id = %config.session_id, ?pid, %shell, "Spawned process group shell");

        let (kill_tx, mut kill_rx) = oneshot::channel::<()>();
        let exit = async move {
            tokio::select! {
                status = child.wait() => {
                    return status.ok().and_then(|s| s.code()).unwrap_or(UNKNOWN_EXIT_CODE);
                }
                Ok(()) = &mut kill_rx => {}
            }
            if let Err(e) = child.kill().await {
                tracing::warn!(?pid, error = %e, "Failed to kill process group");
            }
            child
                .wait()
                .await
                .ok()
                .and_then(|s| s.code())
                .unwrap_or(UNKNOWN_EXIT_CODE)
        }
        .boxed();

        Ok(SpawnedShell {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            exit,
            control: Arc::new(GroupShellControl {
                kill_tx: Mutex::new(Some(kill_tx)),
            }),
        })
    }
}
