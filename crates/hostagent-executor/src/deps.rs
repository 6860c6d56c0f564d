//! Narrow dependency seams for document execution and filesystem access.
//!
//! Components take these as trait objects so tests can substitute doubles.
//! The production implementations delegate straight to the runtime.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use hostagent_core::ResultStatus;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Document handling error.
#[derive(Debug, Error)]
pub enum ExecDepError {
    #[error("Document is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Document has no steps")]
    NoSteps,
    #[error("Step {index} has no action")]
    MissingAction { index: usize },
}

/// One plugin invocation parsed from a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginState {
    /// Step name, unique within the document.
    pub id: String,
    /// Plugin that runs the step.
    pub name: String,
    /// Plugin input.
    pub configuration: Value,
}

/// Result of one plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginResult {
    pub plugin_name: String,
    pub status: ResultStatus,
    pub code: i32,
    pub output: String,
}

/// Where a parsed document runs and stores its output.
#[derive(Debug, Clone, Default)]
pub struct DocumentContext {
    pub orchestration_dir: PathBuf,
    pub s3_bucket: String,
    pub s3_key_prefix: String,
    pub message_id: String,
    pub document_id: String,
    pub default_working_directory: PathBuf,
}

/// Runs the plugins of a parsed document.
#[async_trait]
pub trait PluginRunner: Send + Sync {
    async fn execute_document(
        &self,
        plugins: Vec<PluginState>,
        document_id: &str,
        document_created_date: &str,
    ) -> HashMap<String, PluginResult>;
}

/// Dependency on document parsing and execution.
#[async_trait]
pub trait ExecDep: Send + Sync {
    /// Parse a raw document into plugin invocations.
    ///
    /// # Errors
    /// Returns error if the document is malformed.
    fn parse_document(
        &self,
        document: &[u8],
        context: &DocumentContext,
    ) -> Result<Vec<PluginState>, ExecDepError>;

    /// Run `plugins` through `runner`, keyed by step id.
    async fn execute_document(
        &self,
        runner: &dyn PluginRunner,
        plugins: Vec<PluginState>,
        document_id: &str,
        document_created_date: &str,
    ) -> HashMap<String, PluginResult>;
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawDocument {
    #[serde(default)]
    main_steps: Vec<RawStep>,
}

#[derive(Deserialize)]
struct RawStep {
    #[serde(default)]
    name: String,
    #[serde(default)]
    action: String,
    #[serde(default)]
    inputs: Value,
}

/// Production [`ExecDep`].
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultExecDep;

#[async_trait]
impl ExecDep for DefaultExecDep {
    fn parse_document(
        &self,
        document: &[u8],
        context: &DocumentContext,
    ) -> Result<Vec<PluginState>, ExecDepError> {
        let raw: RawDocument = serde_json::from_slice(document)?;
        if raw.main_steps.is_empty() {
            return Err(ExecDepError::NoSteps);
        }

        raw.main_steps
            .into_iter()
            .enumerate()
            .map(|(index, step)| {
                if step.action.is_empty() {
                    return Err(ExecDepError::MissingAction { index });
                }
                let mut configuration = step.inputs;
                if let Value::Object(map) = &mut configuration {
                    map.entry("workingDirectory").or_insert_with(|| {
                        Value::String(context.default_working_directory.display().to_string())
                    });
                }
                let id = if step.name.is_empty() {
                    format!("{}-{index}", step.action)
                } else {
                    step.name
                };
                Ok(PluginState {
                    id,
                    name: step.action,
                    configuration,
                })
            })
            .collect()
    }

    async fn execute_document(
        &self,
        runner: &dyn PluginRunner,
        plugins: Vec<PluginState>,
        document_id: &str,
        document_created_date: &str,
    ) -> HashMap<String, PluginResult> {
        tracing::debug!(document_id, plugins = plugins.len(), "Running subcommand");
        runner
            .execute_document(plugins, document_id, document_created_date)
            .await
    }
}

/// Dependency on filesystem utilities.
#[async_trait]
pub trait FileSysDep: Send + Sync {
    async fn exists(&self, path: &Path) -> bool;

    async fn read_file(&self, path: &Path) -> std::io::Result<Vec<u8>>;

    async fn rename(&self, from: &Path, to: &Path) -> std::io::Result<()>;
}

/// Production [`FileSysDep`] backed by `tokio::fs`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultFileSys;

#[async_trait]
impl FileSysDep for DefaultFileSys {
    async fn exists(&self, path: &Path) -> bool {
        tokio::fs::try_exists(path).await.unwrap_or(false)
    }

    async fn read_file(&self, path: &Path) -> std::io::Result<Vec<u8>> {
        tokio::fs::read(path).await
    }

    async fn rename(&self, from: &Path, to: &Path) -> std::io::Result<()> {
        tokio::fs::rename(from, to).await
    }
}
