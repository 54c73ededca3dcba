//! AWS S3 implementation of the CloudStorage trait
//!
//! This module provides an AWS S3 implementation of the CloudStorage
//! trait for mirroring the database file to Amazon S3.

use std::path::Path;
use aws_sdk_s3::Client as S3Client;
use aws_sdk_s3::error::SdkError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::fs as tokio_fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info};

use crate::config::BackupConfig;
use crate::database::{BackupError, Result};
use super::{CloudStorage, FileMetaData, ProgressCallback, UploadProgress};

/// Provides AWS S3 storage for database backups
pub struct S3CloudStorage {
    /// S3 client
    client: S3Client,
    /// S3 bucket name
    bucket: String,
    /// Prefix for backup objects
    prefix: String,
}

impl S3CloudStorage {
    /// Create a new S3CloudStorage with the given configuration
    pub async fn new(config: &BackupConfig) -> Result<Self> {
        // Default credential provider chain, including OIDC when AWS_ROLE_ARN is set
        let aws_config = aws_config::from_env()
            .region(aws_types::region::Region::new(config.aws_region.clone()))
            .load()
            .await;

        let client = S3Client::new(&aws_config);

        match client.head_bucket().bucket(&config.s3_bucket_name).send().await {
            Ok(_) => {
                info!(bucket = %config.s3_bucket_name, "Connected to S3 bucket");
            }
            Err(err) => {
                error!(bucket = %config.s3_bucket_name, error = %err, "Failed to access S3 bucket");
                return Err(BackupError::Transport(format!(
                    "Failed to access S3 bucket {}: {}",
                    &config.s3_bucket_name, err
                )));
            }
        }

        Ok(Self {
            client,
            bucket: config.s3_bucket_name.clone(),
            prefix: "backups/".to_string(),
        })
    }

    /// Get the S3 key for a remote path
    fn object_key(&self, remote_path: &str) -> String {
        format!("{}{}", self.prefix, remote_path.trim_start_matches('/'))
    }

    /// Map AWS S3 errors to BackupError
    fn map_s3_error<E: std::fmt::Debug>(&self, error: SdkError<E>, operation: &str) -> BackupError {
        match &error {
            SdkError::ServiceError(service_err) => {
                if service_err.raw().http().status() == 404 {
                    BackupError::RemoteNotFound
                } else {
                    BackupError::Transport(format!("S3 service error during {}: {:?}", operation, error))
                }
            }
            SdkError::TimeoutError(_) => {
                BackupError::Transport(format!("S3 timeout during {}: {:?}", operation, error))
            }
            SdkError::DispatchFailure(err) => {
                BackupError::Transport(format!("S3 dispatch error during {}: {:?}", operation, err))
            }
            _ => BackupError::Transport(format!("S3 error during {}: {:?}", operation, error)),
        }
    }
}

#[async_trait]
impl CloudStorage for S3CloudStorage {
    async fn upload(
        &self,
        local_file: &Path,
        remote_path: &str,
        on_progress: ProgressCallback<'_>,
    ) -> Result<FileMetaData> {
        let body = tokio_fs::read(local_file).await?;
        let total_bytes = body.len() as u64;
        let key = self.object_key(remote_path);

        if let Some(callback) = on_progress {
            callback(UploadProgress { bytes_sent: 0, total_bytes });
        }

        debug!(bucket = %self.bucket, key = %key, total_bytes, "Uploading backup to S3");
        if let Err(err) = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(body.into())
            .send()
            .await
        {
            error!(key = %key, error = %err, "Failed to upload backup to S3");
            return Err(self.map_s3_error(err, "upload"));
        }

        if let Some(callback) = on_progress {
            callback(UploadProgress { bytes_sent: total_bytes, total_bytes });
        }

        info!(key = %key, "Uploaded backup to S3");

        // S3 assigns Last-Modified; ask for it instead of trusting the local clock
        self.metadata(remote_path).await
    }

    async fn metadata(&self, remote_path: &str) -> Result<FileMetaData> {
        let key = self.object_key(remote_path);

        debug!(bucket = %self.bucket, key = %key, "Fetching backup metadata from S3");
        let resp = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|err| self.map_s3_error(err, "metadata"))?;

        let last_update_date = resp
            .last_modified()
            .and_then(|modified| DateTime::<Utc>::from_timestamp(modified.secs(), modified.subsec_nanos()))
            .ok_or_else(|| {
                BackupError::Transport(format!("S3 object {} has no Last-Modified", key))
            })?;

        Ok(FileMetaData {
            path: remote_path.to_string(),
            last_update_date,
        })
    }

    async fn download(&self, remote_path: &str, local_file: &Path) -> Result<()> {
        let key = self.object_key(remote_path);

        debug!(bucket = %self.bucket, key = %key, "Downloading backup from S3");
        let resp = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(err) => {
                error!(key = %key, error = %err, "Failed to download backup from S3");
                return Err(self.map_s3_error(err, "download"));
            }
        };

        if let Some(parent) = local_file.parent() {
            if !parent.exists() {
                tokio_fs::create_dir_all(parent).await?;
            }
        }

        let body = resp
            .body
            .collect()
            .await
            .map_err(|e| BackupError::Transport(format!("Failed to read S3 response body: {}", e)))?;

        let mut file = tokio_fs::File::create(local_file).await?;
        file.write_all(&body.into_bytes()).await?;
        file.flush().await?;
        file.sync_all().await?;

        info!(key = %key, dest = %local_file.display(), "Downloaded backup from S3");
        Ok(())
    }
}
