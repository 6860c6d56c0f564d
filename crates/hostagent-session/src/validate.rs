//! Pre-flight audit sink checks.

use hostagent_core::{AuditConfig, AuditSink, traits::SinkError};
use thiserror::Error;

/// Validation error.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Log group {0} is not encrypted. Choose an encrypted log group or disable encryption enforcement")]
    LogGroupNotEncrypted(String),
    #[error("Bucket {0} is not encrypted. Choose an encrypted bucket or disable encryption enforcement")]
    BucketNotEncrypted(String),
    #[error(transparent)]
    Sink(#[from] SinkError),
}

/// Sinks a session writes its transcript to.
#[derive(Clone, Copy)]
pub struct AuditSinks<'a> {
    pub log_group: &'a dyn AuditSink,
    pub bucket: &'a dyn AuditSink,
}

/// Check the configured audit sinks before a session starts.
///
/// A sink with an empty name is skipped. When enforcement is off for a sink
/// its encryption is never queried, but it is still provisioned. When
/// enforcement is on and the sink is unencrypted, validation fails before
/// provisioning.
///
/// # Errors
/// Returns error naming the first sink that is unencrypted or fails to
/// provision.
pub async fn validate(
    audit: &AuditConfig,
    sinks: AuditSinks<'_>,
    stream_name: &str,
) -> Result<(), ValidationError> {
    if !audit.cloud_watch_log_group.is_empty() {
        let group = audit.cloud_watch_log_group.as_str();
        if audit.cloud_watch_encryption_enabled && !sinks.log_group.is_encrypted(group).await {
            return Err(ValidationError::LogGroupNotEncrypted(group.to_string()));
        }
        sinks.log_group.ensure_provisioned(group, stream_name).await?;
        tracing::debug!(log_group = group, stream_name, "Log group ready");
    }

    if !audit.output_s3_bucket_name.is_empty() {
        let bucket = audit.output_s3_bucket_name.as_str();
        if audit.s3_encryption_enabled && !sinks.bucket.is_encrypted(bucket).await {
            return Err(ValidationError::BucketNotEncrypted(bucket.to_string()));
        }
        sinks
            .bucket
            .ensure_provisioned(bucket, &audit.output_s3_key_prefix)
            .await?;
        tracing::debug!(bucket, "Bucket ready");
    }

    Ok(())
}
