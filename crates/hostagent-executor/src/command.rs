//! Shell command line parsing.

use std::path::PathBuf;

use hostagent_pty::resolve_executable_path;
use thiserror::Error;

/// Command build error.
#[derive(Debug, Error)]
pub enum CommandBuildError {
    #[error("Shell command cannot be parsed: {0}")]
    InvalidBase(String),
    #[error("Shell command is empty after parsing")]
    EmptyCommand,
    #[error("Executable not found: {0}")]
    ExecutableNotFound(String),
    #[error("Failed to quote command: {0}")]
    QuoteError(#[from] shlex::QuoteError),
}

/// Parsed command parts (program + args).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandParts {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandParts {
    /// Create new command parts.
    #[must_use]
    pub const fn new(program: String, args: Vec<String>) -> Self {
        Self { program, args }
    }

    /// Render the command as a single shell-quoted line.
    ///
    /// # Errors
    /// Returns error if an argument contains a NUL byte.
    pub fn to_command_line(&self) -> Result<String, CommandBuildError> {
        let words = std::iter::once(self.program.as_str()).chain(self.args.iter().map(String::as_str));
        Ok(shlex::try_join(words)?)
    }

    /// Resolve the program to an absolute path.
    ///
    /// # Errors
    /// Returns error if the executable is not found.
    pub async fn into_resolved(self) -> Result<(PathBuf, Vec<String>), CommandBuildError> {
        let Self { program, args } = self;
        let executable = resolve_executable_path(&program)
            .await
            .ok_or(CommandBuildError::ExecutableNotFound(program))?;
        Ok((executable, args))
    }
}

/// Builds a shell invocation from a base command line and extra arguments.
#[derive(Debug, Clone)]
pub struct CommandBuilder {
    /// Base command line, e.g. `bash --noprofile`.
    pub base: String,
    /// Parameters appended after the base.
    pub params: Vec<String>,
}

impl CommandBuilder {
    /// Create a new command builder.
    #[must_use]
    pub fn new<S: Into<String>>(base: S) -> Self {
        Self {
            base: base.into(),
            params: Vec::new(),
        }
    }

    /// Append parameters.
    #[must_use]
    pub fn params<I>(mut self, params: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.params.extend(params.into_iter().map(Into::into));
        self
    }

    /// Split the base command and append the parameters.
    ///
    /// # Errors
    /// Returns error if the base cannot be parsed or is empty.
    pub fn build(&self) -> Result<CommandParts, CommandBuildError> {
        let mut parts = split_command_line(&self.base)?;
        parts.extend(self.params.iter().cloned());

        if parts.is_empty() {
            return Err(CommandBuildError::EmptyCommand);
        }

        let program = parts.remove(0);
        Ok(CommandParts::new(program, parts))
    }
}

fn split_command_line(input: &str) -> Result<Vec<String>, CommandBuildError> {
    #[cfg(windows)]
    {
        let parts = winsplit::split(input);
        if parts.is_empty() {
            Err(CommandBuildError::EmptyCommand)
        } else {
            Ok(parts)
        }
    }

    #[cfg(not(windows))]
    {
        shlex::split(input).ok_or_else(|| CommandBuildError::InvalidBase(input.to_string()))
    }
}
