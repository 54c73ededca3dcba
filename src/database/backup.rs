//! SQLite database backup and restore against cloud storage
//!
//! A backup snapshots the live database with `VACUUM INTO`, uploads the
//! snapshot to the user's namespace and records the provider's timestamp.
//! A restore downloads into a temporary file next to the database, checks
//! it, then renames it over the database path. The rename is the only step
//! that touches the live file, so any earlier failure leaves it intact.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use chrono::{DateTime, Utc};
use sqlx::{Connection, SqliteConnection};
use tempfile::{tempdir, NamedTempFile};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::auth::{AuthProvider, User};
use crate::database::backup_naming::remote_backup_path;
use crate::database::preferences::PreferenceStore;
use crate::database::storage::{CloudStorage, FileMetaData, UploadProgress};
use crate::database::{BackupError, Result};
use crate::db::DbPool;

/// Result of a successful backup
#[derive(Debug, Clone, PartialEq)]
pub struct BackupReport {
    /// Remote path the snapshot was uploaded to
    pub remote_path: String,
    /// Provider timestamp of the uploaded object
    pub uploaded_at: DateTime<Utc>,
    /// Size of the snapshot in bytes
    pub size_bytes: u64,
    /// Duration of the whole operation
    pub duration: Duration,
}

/// Result of a successful restore
///
/// The in-memory handles to the old database are stale once this is
/// returned; the hosting process has to restart.
#[derive(Debug, Clone, PartialEq)]
pub struct RestoreReport {
    /// Remote path the database was restored from
    pub remote_path: String,
    /// When the local file was replaced
    pub restored_at: DateTime<Utc>,
}

/// The local database file and a pool connected to it
#[derive(Clone)]
pub struct LocalDatabase {
    pool: DbPool,
    path: PathBuf,
}

impl LocalDatabase {
    pub fn new(pool: DbPool, path: impl Into<PathBuf>) -> Self {
        Self {
            pool,
            path: path.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write a consistent copy of the database to `dest`
    pub async fn snapshot_to(&self, dest: &Path) -> Result<u64> {
        let dest_path = dest
            .to_str()
            .ok_or_else(|| BackupError::Serialization("Invalid snapshot path".to_string()))?;

        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| BackupError::Serialization(format!("Failed to acquire connection: {}", e)))?;

        // VACUUM INTO runs in its own read transaction and produces a compacted copy
        let vacuum_sql = format!("VACUUM INTO '{}'", dest_path.replace('\'', "''"));
        sqlx::query(&vacuum_sql)
            .execute(&mut *conn)
            .await
            .map_err(|e| BackupError::Serialization(format!("Failed to execute VACUUM INTO: {}", e)))?;

        let size = tokio::fs::metadata(dest)
            .await
            .map_err(|e| BackupError::Serialization(e.to_string()))?
            .len();

        debug!(dest = %dest.display(), size, "Database snapshot written");
        Ok(size)
    }

    /// Replace the database file with `candidate` after checking it is a sound SQLite file
    ///
    /// `candidate` must live on the same filesystem as the database so the
    /// rename is atomic.
    pub async fn replace_with(&self, candidate: &Path) -> Result<()> {
        verify_database(candidate).await?;

        let staged = tokio::fs::File::open(candidate)
            .await
            .map_err(|e| BackupError::Replace(format!("Failed to open downloaded backup: {}", e)))?;
        staged
            .sync_all()
            .await
            .map_err(|e| BackupError::Replace(format!("Failed to sync downloaded backup: {}", e)))?;
        drop(staged);

        tokio::fs::rename(candidate, &self.path)
            .await
            .map_err(|e| BackupError::Replace(format!("Failed to swap database file: {}", e)))?;

        // Make the rename durable before reporting success
        if let Some(dir) = self.path.parent() {
            let dir = if dir.as_os_str().is_empty() { Path::new(".") } else { dir };
            if let Ok(handle) = tokio::fs::File::open(dir).await {
                if let Err(e) = handle.sync_all().await {
                    warn!(error = %e, "Failed to sync database directory after restore");
                }
            }
        }

        info!(path = %self.path.display(), "Local database replaced");
        Ok(())
    }

    /// Directory for temporary files that will be renamed over the database
    fn staging_dir(&self) -> PathBuf {
        match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }
}

/// Check that a file is a readable, intact SQLite database
async fn verify_database(path: &Path) -> Result<()> {
    let db_url = format!("sqlite:{}?mode=ro", path.display());
    let mut conn = SqliteConnection::connect(&db_url)
        .await
        .map_err(|e| BackupError::Replace(format!("Downloaded backup cannot be opened: {}", e)))?;

    let check: String = sqlx::query_scalar("PRAGMA integrity_check")
        .fetch_one(&mut conn)
        .await
        .map_err(|e| BackupError::Replace(format!("Downloaded backup is not a database: {}", e)))?;

    let _ = conn.close().await;

    if check != "ok" {
        return Err(BackupError::Replace(format!(
            "Downloaded backup failed integrity check: {}",
            check
        )));
    }

    Ok(())
}

/// Performs backups and restores of one local database for the current session
///
/// Every dependency is injected. Clones share one lock, so a backup or
/// restore from any clone (the orchestrator's or the scheduled job's) never
/// overlaps another.
#[derive(Clone)]
pub struct BackupEngine {
    database: LocalDatabase,
    storage: Arc<dyn CloudStorage>,
    auth: Arc<dyn AuthProvider>,
    preferences: Arc<dyn PreferenceStore>,
    exclusive: Arc<Mutex<()>>,
}

impl BackupEngine {
    pub fn new(
        database: LocalDatabase,
        storage: Arc<dyn CloudStorage>,
        auth: Arc<dyn AuthProvider>,
        preferences: Arc<dyn PreferenceStore>,
    ) -> Self {
        Self {
            database,
            storage,
            auth,
            preferences,
            exclusive: Arc::new(Mutex::new(())),
        }
    }

    fn current_user(&self) -> Result<User> {
        self.auth
            .state()
            .borrow()
            .user()
            .cloned()
            .ok_or(BackupError::NotAuthenticated)
    }

    /// Snapshot the database, upload it and record the upload's timestamp
    ///
    /// Nothing is written to preferences unless the upload succeeded and the
    /// session that started the backup is still the current one.
    pub async fn perform_backup(&self) -> Result<BackupReport> {
        let start_time = Instant::now();
        let _guard = self.exclusive.lock().await;
        let user = self.current_user()?;
        let remote_path = remote_backup_path(&user)?;

        let temp_dir = tempdir().map_err(|e| BackupError::Serialization(e.to_string()))?;
        let snapshot_path = temp_dir.path().join("snapshot.db");
        let size_bytes = self.database.snapshot_to(&snapshot_path).await?;

        info!(user = %user.id, remote = %remote_path, size_bytes, "Uploading database backup");
        let on_progress = |progress: UploadProgress| {
            debug!(
                sent = progress.bytes_sent,
                total = progress.total_bytes,
                "Backup upload progress"
            );
        };
        let meta = self
            .storage
            .upload(&snapshot_path, &remote_path, Some(&on_progress))
            .await
            .map_err(into_transport)?;

        if self.current_user().ok().as_ref() != Some(&user) {
            warn!(user = %user.id, "Session ended during upload, not recording backup");
            return Err(BackupError::NotAuthenticated);
        }

        self.preferences
            .save_last_backup_date(Some(meta.last_update_date))
            .await?;

        let report = BackupReport {
            remote_path,
            uploaded_at: meta.last_update_date,
            size_bytes,
            duration: start_time.elapsed(),
        };
        info!(
            user = %user.id,
            remote = %report.remote_path,
            uploaded_at = %report.uploaded_at,
            size_bytes = report.size_bytes,
            duration_ms = report.duration.as_millis() as u64,
            "Database backup completed"
        );
        Ok(report)
    }

    /// Download the user's backup and swap it in for the local database
    pub async fn perform_restore(&self) -> Result<RestoreReport> {
        let _guard = self.exclusive.lock().await;
        let user = self.current_user()?;
        let remote_path = remote_backup_path(&user)?;

        let staging = NamedTempFile::new_in(self.database.staging_dir())
            .map_err(|e| BackupError::Replace(format!("Failed to create staging file: {}", e)))?;

        info!(user = %user.id, remote = %remote_path, "Downloading database backup");
        self.storage.download(&remote_path, staging.path()).await?;

        // The staging file is removed on drop if the swap never happens
        let staging_path = staging.into_temp_path();
        self.database.replace_with(&staging_path).await?;
        if let Err(e) = staging_path.keep() {
            debug!(error = %e, "Staging file already moved");
        }

        let report = RestoreReport {
            remote_path,
            restored_at: Utc::now(),
        };
        info!(
            user = %user.id,
            remote = %report.remote_path,
            db = %self.database.path().display(),
            restored_at = %report.restored_at,
            "Database restore completed, restart required"
        );
        Ok(report)
    }

    /// Learn the remote backup's timestamp without downloading it
    pub async fn fetch_remote_metadata(&self) -> Result<FileMetaData> {
        let user = self.current_user()?;
        let remote_path = remote_backup_path(&user)?;
        self.storage.metadata(&remote_path).await
    }
}

/// Upload failures are transport failures regardless of how the adapter classified them
fn into_transport(error: BackupError) -> BackupError {
    match error {
        BackupError::Transport(_) | BackupError::NotAuthenticated => error,
        other => BackupError::Transport(other.to_string()),
    }
}
