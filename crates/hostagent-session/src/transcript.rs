//! Local copy of a session's shell output.
//!
//! The file is what the audit sinks later pick up, so it receives exactly the
//! bytes sent to the data channel, in the same order.

use std::{
    io,
    path::{Path, PathBuf},
};

use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Append-only session transcript.
///
/// Write errors are logged once and disable the transcript; they never end
/// the session.
pub struct Transcript {
    writer: Option<BoxedWriter>,
    path: Option<PathBuf>,
}

impl std::fmt::Debug for Transcript {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transcript")
            .field("path", &self.path)
            .field("open", &self.writer.is_some())
            .finish()
    }
}

impl Transcript {
    /// Write the transcript into `writer`.
    #[must_use]
    pub fn new(writer: BoxedWriter) -> Self {
        Self {
            writer: Some(writer),
            path: None,
        }
    }

    /// Create the transcript file at `path`, creating parent directories.
    ///
    /// An existing file is truncated.
    ///
    /// # Errors
    /// Returns error if the directory or file cannot be created.
    pub async fn create(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = tokio::fs::File::create(path).await?;
        tracing::debug!(path = %path.display(), "Session transcript created");
        Ok(Self {
            writer: Some(Box::new(BufWriter::new(file))),
            path: Some(path.to_path_buf()),
        })
    }

    /// Path of the transcript file, if it is backed by one.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Whether output is still being recorded.
    #[must_use]
    pub const fn is_open(&self) -> bool {
        self.writer.is_some()
    }

    /// Append `bytes`.
    pub async fn record(&mut self, bytes: &[u8]) {
        let Some(writer) = self.writer.as_mut() else {
            return;
        };
        if let Err(e) = writer.write_all(bytes).await {
            tracing::warn!(path = ?self.path, error = %e, "Session transcript disabled");
            self.writer = None;
        }
    }

    /// Flush and close.
    pub async fn finish(&mut self) {
        let Some(mut writer) = self.writer.take() else {
            return;
        };
        if let Err(e) = writer.shutdown().await {
            tracing::warn!(path = ?self.path, error = %e, "Failed to flush session transcript");
        }
    }
}
