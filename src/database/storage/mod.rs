//! Storage module for database backup/restore operations
//!
//! This module provides the transport used to mirror the database file to
//! remote blob storage. Implementations carry no policy: they move bytes and
//! report what the remote side knows about an object.

use std::path::Path;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::warn;

use crate::config::BackupConfig;
use crate::database::{BackupError, Result};

pub mod local_storage;
pub mod s3_storage;

/// Remote descriptor of a stored object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMetaData {
    /// Remote path of the object
    pub path: String,
    /// Provider-assigned last modification time
    pub last_update_date: DateTime<Utc>,
}

/// Progress of an upload in bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadProgress {
    pub bytes_sent: u64,
    pub total_bytes: u64,
}

/// Optional progress callback passed to [`CloudStorage::upload`]
pub type ProgressCallback<'a> = Option<&'a (dyn Fn(UploadProgress) + Send + Sync)>;

/// Provides a unified interface for remote blob storage
///
/// Missing objects must be reported as [`BackupError::RemoteNotFound`];
/// any other remote failure as [`BackupError::Transport`].
#[async_trait]
pub trait CloudStorage: Send + Sync {
    /// Upload a local file to a remote path
    ///
    /// # Arguments
    /// * `local_file` - Path of the file to upload
    /// * `remote_path` - Destination path in remote storage
    /// * `on_progress` - Optional callback invoked as bytes are sent
    ///
    /// Returns the descriptor of the stored object, whose timestamp is the
    /// authoritative time of the backup.
    async fn upload(
        &self,
        local_file: &Path,
        remote_path: &str,
        on_progress: ProgressCallback<'_>,
    ) -> Result<FileMetaData>;

    /// Fetch the descriptor of a remote object without downloading it
    async fn metadata(&self, remote_path: &str) -> Result<FileMetaData>;

    /// Download a remote object to a local file
    ///
    /// # Arguments
    /// * `remote_path` - Path of the object in remote storage
    /// * `local_file` - Path where the object should be written
    async fn download(&self, remote_path: &str, local_file: &Path) -> Result<()>;
}

/// Create a storage provider based on the current configuration
///
/// This function will check AWS availability and create either an S3 storage
/// provider or fall back to local storage if AWS is unavailable.
pub async fn create_storage_provider(config: &BackupConfig) -> Result<Box<dyn CloudStorage>> {
    config.ensure_local_backup_dir().map_err(|e| {
        BackupError::Config(format!("Failed to create local backup directory: {}", e))
    })?;

    if config.should_use_aws().await {
        match s3_storage::S3CloudStorage::new(config).await {
            Ok(provider) => Ok(Box::new(provider)),
            Err(e) => {
                warn!(error = %e, "Failed to create S3 storage provider, falling back to local storage");
                Ok(Box::new(local_storage::LocalCloudStorage::new(config)))
            }
        }
    } else {
        Ok(Box::new(local_storage::LocalCloudStorage::new(config)))
    }
}
