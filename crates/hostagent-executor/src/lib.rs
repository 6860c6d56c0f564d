//! Local shell providers and dependency seams for host agent sessions.
//!
//! Provides:
//! - `PtyShellProvider` and `GroupShellProvider` - `ShellProvider` implementations
//! - Command line parsing for shell overrides
//! - `ExecDep` / `FileSysDep` seams and the artifact resource

pub mod artifact;
pub mod command;
pub mod deps;
pub mod provider;

pub use artifact::{ArtifactError, ArtifactResource, ArtifactStore, ResourceInfo, ResourceKind};
pub use command::{CommandBuildError, CommandBuilder, CommandParts};
pub use deps::{DefaultExecDep, DefaultFileSys, ExecDep, FileSysDep, PluginRunner};
pub use provider::{GroupShellProvider, PtyShellProvider};
