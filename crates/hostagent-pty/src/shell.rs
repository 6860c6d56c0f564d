//! Cross-platform shell selection.

use std::{
    ffi::OsStr,
    path::{Path, PathBuf},
};

/// Returns the shell program and the flag that makes it run a command string.
///
/// - Windows: `("cmd", "/C")`
/// - Unix-like: the user's shell from `$SHELL`, falling back to `/bin/sh`, with `-c`
#[must_use]
pub fn get_shell_command() -> (String, &'static str) {
    if cfg!(windows) {
        ("cmd".into(), "/C")
    } else {
        UnixShell::current_shell().get_shell_command()
    }
}

/// Returns the program and arguments for an interactive session shell.
///
/// On Windows, prefers PowerShell if available, falling back to cmd.exe.
/// On Unix, returns the user's configured shell from `$SHELL`, started as a
/// login shell when it supports it.
pub async fn get_interactive_shell() -> (PathBuf, Vec<String>) {
    if cfg!(windows) {
        let program = resolve_executable_path("powershell.exe")
            .await
            .unwrap_or_else(|| PathBuf::from("cmd.exe"));
        (program, Vec::new())
    } else {
        let shell = UnixShell::current_shell();
        let args = if shell.login() {
            vec!["-l".to_string()]
        } else {
            Vec::new()
        };
        (shell.path().to_path_buf(), args)
    }
}

/// Resolve an executable by name.
///
/// Absolute paths are accepted as-is when they point at a file; anything else
/// is looked up on the current `PATH`.
pub async fn resolve_executable_path(executable: &str) -> Option<PathBuf> {
    if executable.trim().is_empty() {
        return None;
    }

    let path = Path::new(executable);
    if path.is_absolute() && path.is_file() {
        return Some(path.to_path_buf());
    }

    let executable = executable.to_string();
    tokio::task::spawn_blocking(move || which::which(executable))
        .await
        .ok()
        .and_then(Result::ok)
}

/// Directory a session starts in when none is configured.
///
/// The user's home directory, falling back to the process working directory.
#[must_use]
pub fn default_working_dir() -> PathBuf {
    dirs::home_dir()
        .filter(|p| p.is_dir())
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("/"))
}

/// Unix shell types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnixShell {
    Zsh(PathBuf),
    Bash(PathBuf),
    Sh(PathBuf),
    Other(PathBuf),
}

impl UnixShell {
    /// Get the shell path.
    #[must_use]
    pub fn path(&self) -> &Path {
        match self {
            Self::Zsh(p) | Self::Bash(p) | Self::Sh(p) | Self::Other(p) => p,
        }
    }

    /// Whether this shell supports login mode.
    #[must_use]
    pub const fn login(&self) -> bool {
        matches!(self, Self::Zsh(_) | Self::Bash(_))
    }

    /// Get the current shell from `$SHELL`.
    #[must_use]
    pub fn current_shell() -> Self {
        std::env::var("SHELL")
            .ok()
            .and_then(|shell| Self::from_path(Path::new(&shell)))
            .unwrap_or_else(|| Self::Sh(PathBuf::from("/bin/sh")))
    }

    /// Classify an absolute path to an existing shell binary.
    #[must_use]
    pub fn from_path(path: &Path) -> Option<Self> {
        if !(path.is_absolute() && path.is_file()) {
            return None;
        }
        Some(Self::classify(path))
    }

    fn classify(path: &Path) -> Self {
        let path_buf = path.to_path_buf();
        match path.file_name().and_then(OsStr::to_str) {
            Some("zsh") => Self::Zsh(path_buf),
            Some("bash") => Self::Bash(path_buf),
            Some("sh") => Self::Sh(path_buf),
            _ => Self::Other(path_buf),
        }
    }

    /// Get shell command tuple.
    #[must_use]
    pub fn get_shell_command(&self) -> (String, &'static str) {
        (self.path().to_string_lossy().into_owned(), "-c")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_by_file_name() {
        assert_eq!(
            UnixShell::classify(Path::new("/usr/bin/zsh")),
            UnixShell::Zsh(PathBuf::from("/usr/bin/zsh"))
        );
        assert_eq!(
            UnixShell::classify(Path::new("/bin/bash")),
            UnixShell::Bash(PathBuf::from("/bin/bash"))
        );
        assert!(matches!(
            UnixShell::classify(Path::new("/usr/local/bin/fish")),
            UnixShell::Other(_)
        ));
    }

    #[test]
    fn test_login_support() {
        assert!(UnixShell::Bash(PathBuf::from("/bin/bash")).login());
        assert!(!UnixShell::Sh(PathBuf::from("/bin/sh")).login());
    }

    #[test]
    fn test_default_working_dir_exists() {
        assert!(default_working_dir().is_dir());
    }

    #[test]
    fn test_relative_path_is_rejected() {
        assert_eq!(UnixShell::from_path(Path::new("bash")), None);
    }

    #[cfg(unix)]
    #[test]
    fn test_shell_command_uses_dash_c() {
        let (_, flag) = get_shell_command();
        assert_eq!(flag, "-c");
    }

    #[tokio::test]
    async fn test_resolve_empty_executable() {
        assert_eq!(resolve_executable_path("   ").await, None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_resolve_absolute_executable() {
        assert_eq!(
            resolve_executable_path("/bin/sh").await,
            Some(PathBuf::from("/bin/sh"))
        );
    }
}
