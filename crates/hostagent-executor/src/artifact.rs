//! Remote artifact resources stored in an object store bucket.
//!
//! A resource is described by a location `{"path": "<url>"}`. The path may be
//! `s3://bucket/key`, a path-style `https://host/bucket/key` URL, or a
//! virtual-hosted `https://bucket.s3.<region>.amazonaws.com/key` URL. Files
//! land under `<destination>/<bucket>/<key>`.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::deps::FileSysDep;

/// File extension of JSON documents.
pub const JSON_EXTENSION: &str = ".json";
/// File extension of YAML documents.
pub const YAML_EXTENSION: &str = ".yaml";

/// Artifact error.
#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("Location info could not be parsed, check the JSON format: {0}")]
    InvalidLocation(#[source] serde_json::Error),
    #[error("Source path must be specified")]
    MissingPath,
    #[error("Source path is not an object store URL: {0}")]
    InvalidUrl(String),
    #[error("Could not download a directory, provide the path to a file with an extension")]
    DirectoryPath,
    #[error("Object store request failed: {0}")]
    Store(String),
    #[error("Failed to move downloaded content into place: {0}")]
    Rename(#[source] std::io::Error),
}

/// Location info sent with a command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationInfo {
    #[serde(default)]
    pub path: String,
}

/// Bucket and key of an object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectUrl {
    pub bucket: String,
    pub key: String,
}

impl ObjectUrl {
    /// Parse an object store URL.
    ///
    /// # Errors
    /// Returns error if the URL has no bucket.
    pub fn parse(url: &str) -> Result<Self, ArtifactError> {
        let invalid = || ArtifactError::InvalidUrl(url.to_string());

        if let Some(rest) = url.strip_prefix("s3://") {
            let (bucket, key) = rest.split_once('/').unwrap_or((rest, ""));
            if bucket.is_empty() {
                return Err(invalid());
            }
            return Ok(Self::new(bucket, key));
        }

        let rest = url
            .strip_prefix("https://")
            .or_else(|| url.strip_prefix("http://"))
            .ok_or_else(invalid)?;
        let (host, path) = rest.split_once('/').unwrap_or((rest, ""));

        // Virtual-hosted style: the bucket is the first label before ".s3".
        if let Some(idx) = host.find(".s3.").or_else(|| host.find(".s3-")) {
            let bucket = &host[..idx];
            if !bucket.is_empty() {
                return Ok(Self::new(bucket, path));
            }
        }

        let (bucket, key) = path.split_once('/').unwrap_or((path, ""));
        if bucket.is_empty() {
            return Err(invalid());
        }
        Ok(Self::new(bucket, key))
    }

    fn new(bucket: &str, key: &str) -> Self {
        Self {
            bucket: bucket.to_string(),
            key: key.to_string(),
        }
    }

    /// Key prefix of the directory holding this object, with trailing `/`.
    #[must_use]
    pub fn directory_prefix(&self) -> &str {
        self.key.rfind('/').map_or("", |idx| &self.key[..=idx])
    }
}

/// Whether the resource is a script or a structured document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceKind {
    Script,
    Document,
}

/// Where a resource lands locally and how it is run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceInfo {
    pub kind: ResourceKind,
    pub local_destination_path: PathBuf,
    pub starter_file: String,
    pub resource_extension: String,
    pub entire_dir: bool,
}

/// Object store access.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Keys of every object under `prefix`.
    async fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, ArtifactError>;

    /// Download one object into `destination_dir`, returning the local file.
    ///
    /// The returned file name is chosen by the store; the caller renames it.
    async fn download(
        &self,
        bucket: &str,
        key: &str,
        destination_dir: &Path,
    ) -> Result<PathBuf, ArtifactError>;
}

/// Default root for downloaded artifacts.
#[must_use]
pub fn default_download_root() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("hostagent")
        .join("download")
}

fn is_directory_path(path: &str) -> bool {
    path.ends_with('/')
}

fn extension_of(file: &str) -> String {
    Path::new(file)
        .extension()
        .map(|ext| format!(".{}", ext.to_string_lossy()))
        .unwrap_or_default()
}

fn file_name_of(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}

fn join_key(root: &Path, key: &str) -> PathBuf {
    key.split('/')
        .filter(|segment| !segment.is_empty())
        .fold(root.to_path_buf(), |path, segment| path.join(segment))
}

/// An artifact stored in an object store bucket.
#[derive(Debug, Clone)]
pub struct ArtifactResource {
    pub info: LocationInfo,
}

impl ArtifactResource {
    /// Build a resource from JSON location info.
    ///
    /// # Errors
    /// Returns error if the location info is not valid JSON.
    pub fn new(location_info: &str) -> Result<Self, ArtifactError> {
        let info = serde_json::from_str(location_info).map_err(ArtifactError::InvalidLocation)?;
        Ok(Self { info })
    }

    /// Check that the mandatory fields are present.
    ///
    /// # Errors
    /// Returns error if the path is empty.
    pub fn validate_location_info(&self) -> Result<(), ArtifactError> {
        if self.info.path.is_empty() {
            return Err(ArtifactError::MissingPath);
        }
        Ok(())
    }

    fn object(&self) -> Result<ObjectUrl, ArtifactError> {
        self.validate_location_info()?;
        ObjectUrl::parse(&self.info.path)
    }

    /// Describe where the resource lands under `destination_dir`.
    ///
    /// Directory downloads are always scripts. Single files are documents
    /// when they end in `.json` or `.yaml`, scripts otherwise.
    ///
    /// # Errors
    /// Returns error if the location cannot be parsed.
    pub fn populate_resource_info(
        &self,
        destination_dir: Option<&Path>,
        entire_dir: bool,
    ) -> Result<ResourceInfo, ArtifactError> {
        let root = destination_dir.map_or_else(default_download_root, Path::to_path_buf);
        let object = self.object()?;
        let bucket_root = root.join(&object.bucket);

        if entire_dir {
            let starter_file = file_name_of(&self.info.path).to_string();
            let local_destination_path =
                join_key(&bucket_root, object.directory_prefix()).join(&starter_file);
            return Ok(ResourceInfo {
                kind: ResourceKind::Script,
                resource_extension: extension_of(&starter_file),
                local_destination_path,
                starter_file,
                entire_dir: true,
            });
        }

        let local_destination_path = join_key(&bucket_root, &object.key);
        let starter_file = file_name_of(&object.key).to_string();
        let resource_extension = extension_of(&starter_file);
        let kind = if resource_extension == JSON_EXTENSION || resource_extension == YAML_EXTENSION {
            ResourceKind::Document
        } else {
            ResourceKind::Script
        };
        Ok(ResourceInfo {
            kind,
            local_destination_path,
            starter_file,
            resource_extension,
            entire_dir: false,
        })
    }

    /// Download the resource, or the directory holding it when `entire_dir`.
    ///
    /// Returns the local paths of the downloaded files.
    ///
    /// # Errors
    /// Returns error if the path names a directory, the store fails, or a
    /// downloaded file cannot be moved into place.
    pub async fn download(
        &self,
        store: &dyn ArtifactStore,
        fs: &dyn FileSysDep,
        entire_dir: bool,
        destination_dir: Option<&Path>,
    ) -> Result<Vec<PathBuf>, ArtifactError> {
        let root = destination_dir.map_or_else(default_download_root, Path::to_path_buf);
        let object = self.object()?;

        let keys = if entire_dir {
            if is_directory_path(&self.info.path) {
                return Err(ArtifactError::DirectoryPath);
            }
            store
                .list_objects(&object.bucket, object.directory_prefix())
                .await?
        } else {
            vec![object.key.clone()]
        };

        tracing::info!(bucket = %object.bucket, count = keys.len(), "Downloading artifacts");

        let mut downloaded = Vec::with_capacity(keys.len());
        for key in keys.iter().filter(|k| !is_directory_path(k)) {
            let target = join_key(&root.join(&object.bucket), key);
            let local_dir = target
                .parent()
                .map_or_else(|| root.clone(), Path::to_path_buf);

            tracing::debug!(%key, dir = %local_dir.display(), "Downloading object");
            let temp_path = store.download(&object.bucket, key, &local_dir).await?;
            if temp_path != target {
                fs.rename(&temp_path, &target)
                    .await
                    .map_err(ArtifactError::Rename)?;
            }
            downloaded.push(target);
        }
        Ok(downloaded)
    }
}
