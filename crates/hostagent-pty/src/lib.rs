//! Cross-platform PTY spawning for host agent sessions.
//!
//! Provides:
//! - `PtyService` - Spawn a process inside a pseudo terminal with async pipes
//! - Shell detection utilities for Unix and Windows

pub mod service;
pub mod shell;

pub use service::{PtyControl, PtyError, PtyProcess, PtyRequest, PtyService, UNKNOWN_EXIT_CODE};
pub use shell::{
    default_working_dir, get_interactive_shell, get_shell_command, resolve_executable_path,
};
