//! Local filesystem implementation of the CloudStorage trait
//!
//! This module provides a directory-backed blob store for development and as
//! a fallback when AWS S3 is unavailable. Remote paths map to files under the
//! configured directory; a file's modification time is its last update date.

use std::path::{Component, Path, PathBuf};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::fs as tokio_fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info};

use crate::config::BackupConfig;
use crate::database::{BackupError, Result};

use super::{CloudStorage, FileMetaData, ProgressCallback, UploadProgress};

const COPY_CHUNK_SIZE: usize = 64 * 1024;

/// Provides local filesystem storage for database backups
pub struct LocalCloudStorage {
    /// Base directory standing in for the remote bucket
    root: PathBuf,
}

impl LocalCloudStorage {
    /// Create a new LocalCloudStorage with the given configuration
    pub fn new(config: &BackupConfig) -> Self {
        Self::with_root(config.local_backup_dir.clone())
    }

    /// Create a new LocalCloudStorage rooted at the given directory
    pub fn with_root(root: PathBuf) -> Self {
        Self { root }
    }

    /// Get the local path backing a remote path
    fn object_path(&self, remote_path: &str) -> Result<PathBuf> {
        let relative = Path::new(remote_path);
        let is_plain = !remote_path.is_empty()
            && relative
                .components()
                .all(|component| matches!(component, Component::Normal(_)));

        if !is_plain {
            return Err(BackupError::Transport(format!(
                "invalid remote path: {:?}",
                remote_path
            )));
        }

        Ok(self.root.join(relative))
    }

    async fn read_metadata(&self, remote_path: &str, object_path: &Path) -> Result<FileMetaData> {
        let metadata = match tokio_fs::metadata(object_path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(BackupError::RemoteNotFound);
            }
            Err(e) => return Err(BackupError::Transport(e.to_string())),
        };

        let modified = metadata
            .modified()
            .map_err(|e| BackupError::Transport(e.to_string()))?;

        Ok(FileMetaData {
            path: remote_path.to_string(),
            last_update_date: DateTime::<Utc>::from(modified),
        })
    }
}

fn transport(e: std::io::Error) -> BackupError {
    BackupError::Transport(e.to_string())
}

#[async_trait]
impl CloudStorage for LocalCloudStorage {
    async fn upload(
        &self,
        local_file: &Path,
        remote_path: &str,
        on_progress: ProgressCallback<'_>,
    ) -> Result<FileMetaData> {
        let dest_path = self.object_path(remote_path)?;
        if let Some(parent) = dest_path.parent() {
            tokio_fs::create_dir_all(parent).await.map_err(transport)?;
        }

        let mut source = tokio_fs::File::open(local_file).await?;
        let total_bytes = source.metadata().await?.len();

        // Written next to the destination and renamed, so readers never see a partial object
        let partial_path = dest_path.with_extension("partial");
        let mut dest = tokio_fs::File::create(&partial_path).await.map_err(transport)?;

        debug!(
            source = %local_file.display(),
            remote = remote_path,
            total_bytes,
            "Uploading to local storage"
        );

        let mut buffer = vec![0u8; COPY_CHUNK_SIZE];
        let mut bytes_sent = 0u64;
        loop {
            let read = source.read(&mut buffer).await?;
            if read == 0 {
                break;
            }
            dest.write_all(&buffer[..read]).await.map_err(transport)?;
            bytes_sent += read as u64;
            if let Some(callback) = on_progress {
                callback(UploadProgress { bytes_sent, total_bytes });
            }
        }
        dest.flush().await.map_err(transport)?;
        dest.sync_all().await.map_err(transport)?;
        drop(dest);

        tokio_fs::rename(&partial_path, &dest_path).await.map_err(transport)?;

        info!(remote = remote_path, bytes = bytes_sent, "Stored backup in local storage");
        self.read_metadata(remote_path, &dest_path).await
    }

    async fn metadata(&self, remote_path: &str) -> Result<FileMetaData> {
        let object_path = self.object_path(remote_path)?;
        self.read_metadata(remote_path, &object_path).await
    }

    async fn download(&self, remote_path: &str, local_file: &Path) -> Result<()> {
        let source_path = self.object_path(remote_path)?;

        if !tokio_fs::try_exists(&source_path).await.map_err(transport)? {
            return Err(BackupError::RemoteNotFound);
        }

        if let Some(parent) = local_file.parent() {
            if !parent.exists() {
                tokio_fs::create_dir_all(parent).await?;
            }
        }

        tokio_fs::copy(&source_path, local_file).await.map_err(transport)?;
        tokio_fs::File::open(local_file)
            .await
            .map_err(transport)?
            .sync_all()
            .await
            .map_err(transport)?;

        debug!(remote = remote_path, dest = %local_file.display(), "Downloaded from local storage");
        Ok(())
    }
}
