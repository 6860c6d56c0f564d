//! Session configuration.

use std::{collections::HashMap, path::Path, path::PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Default terminal width for new sessions.
pub const DEFAULT_COLS: u16 = 80;

/// Default terminal height for new sessions.
pub const DEFAULT_ROWS: u16 = 24;

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid session configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Audit-log destinations and their encryption requirements.
///
/// An empty sink name means the sink is not configured and is skipped
/// entirely during validation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct AuditConfig {
    /// Streaming log group receiving the session transcript.
    pub cloud_watch_log_group: String,
    /// Refuse to start unless the log group is encrypted.
    pub cloud_watch_encryption_enabled: bool,
    /// Bulk-storage bucket receiving the session transcript.
    #[serde(rename = "OutputS3BucketName")]
    pub output_s3_bucket_name: String,
    /// Key prefix inside the bucket.
    #[serde(rename = "OutputS3KeyPrefix")]
    pub output_s3_key_prefix: String,
    /// Refuse to start unless the bucket is encrypted.
    #[serde(rename = "S3EncryptionEnabled")]
    pub s3_encryption_enabled: bool,
}

/// Configuration for one interactive session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct SessionConfig {
    /// Session identifier assigned by the control plane.
    pub session_id: String,

    /// Working directory for the local shell.
    pub working_directory: Option<PathBuf>,

    /// Commands to run instead of an interactive login shell.
    pub commands: Option<String>,

    /// Audit sinks.
    #[serde(flatten)]
    pub audit: AuditConfig,

    /// File receiving a copy of the session output. Relative paths resolve
    /// against the working directory.
    pub transcript_path: Option<PathBuf>,

    /// Initial terminal width.
    pub cols: u16,

    /// Initial terminal height.
    pub rows: u16,

    /// Arbitrary metadata for embedder-specific needs.
    pub metadata: HashMap<String, Value>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            session_id: String::new(),
            working_directory: None,
            commands: None,
            audit: AuditConfig::default(),
            transcript_path: None,
            cols: DEFAULT_COLS,
            rows: DEFAULT_ROWS,
            metadata: HashMap::new(),
        }
    }
}

impl SessionConfig {
    /// Create a configuration with only a session id.
    #[must_use]
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            ..Self::default()
        }
    }

    /// Parse a configuration from JSON.
    ///
    /// # Errors
    /// Returns error if the JSON is malformed.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load a configuration from a JSON file.
    ///
    /// # Errors
    /// Returns error if the file cannot be read or parsed.
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&raw)
    }

    /// Whether this session runs fixed commands rather than an interactive shell.
    #[must_use]
    pub fn is_non_interactive(&self) -> bool {
        self.commands
            .as_deref()
            .is_some_and(|c| !c.trim().is_empty())
    }

    /// Where the session transcript is written, if anywhere.
    #[must_use]
    pub fn resolved_transcript_path(&self) -> Option<PathBuf> {
        let path = self.transcript_path.as_ref()?;
        match &self.working_directory {
            Some(dir) if path.is_relative() => Some(dir.join(path)),
            _ => Some(path.clone()),
        }
    }

    /// Get a metadata value by key.
    #[must_use]
    pub fn get_metadata(&self, key: &str) -> Option<&Value> {
        self.metadata.get(key)
    }

    /// Set a metadata value.
    pub fn set_metadata(&mut self, key: impl Into<String>, value: Value) {
        self.metadata.insert(key.into(), value);
    }
}
