use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use tracing::warn;

use crate::auth::User;
use crate::database::{DATABASE_PATH, SETTINGS_PATH};
use crate::orchestrator::OrchestratorConfig;
use crate::scheduler::JobConstraints;

/// Configuration for cloud backup and restore
#[derive(Debug, Clone)]
pub struct BackupConfig {
    /// The database file mirrored to the cloud
    pub database_path: PathBuf,
    /// SQLite file holding backup preferences
    pub settings_path: PathBuf,
    /// Whether AWS S3 should be used for backup storage
    pub use_aws: bool,
    /// S3 bucket name for database backups
    pub s3_bucket_name: String,
    /// AWS region for S3 operations
    pub aws_region: String,
    /// Directory standing in for remote storage when AWS is unavailable
    pub local_backup_dir: PathBuf,
    /// Period of the background backup job
    pub backup_interval: Duration,
    /// Attempts per background run before it is reported as failed
    pub backup_max_attempts: u32,
    /// User to sign in as at startup, if any
    pub user_id: Option<String>,
    /// Address the HTTP surface listens on
    pub bind_addr: SocketAddr,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from(DATABASE_PATH),
            settings_path: PathBuf::from(SETTINGS_PATH),
            use_aws: false,
            s3_bucket_name: String::new(),
            aws_region: String::from("us-west-2"),
            local_backup_dir: PathBuf::from("./backups"),
            backup_interval: Duration::from_secs(24 * 60 * 60),
            backup_max_attempts: 3,
            user_id: None,
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
        }
    }
}

impl BackupConfig {
    /// Load backup configuration from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let database_path = env::var("DATABASE_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.database_path);

        let settings_path = env::var("SETTINGS_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.settings_path);

        let use_aws = env::var("BACKUP_USE_AWS")
            .map(|v| v.to_lowercase() == "true")
            .unwrap_or(false);

        let s3_bucket_name = env::var("BACKUP_S3_BUCKET").unwrap_or_default();

        let aws_region = env::var("AWS_REGION").unwrap_or(defaults.aws_region);

        let local_backup_dir = env::var("BACKUP_LOCAL_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.local_backup_dir);

        let backup_interval = env::var("BACKUP_INTERVAL_HOURS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|hours| *hours > 0)
            .map(|hours| Duration::from_secs(hours * 60 * 60))
            .unwrap_or(defaults.backup_interval);

        let backup_max_attempts = env::var("BACKUP_MAX_ATTEMPTS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.backup_max_attempts);

        let user_id = env::var("BACKUP_USER_ID").ok().filter(|id| !id.trim().is_empty());

        let bind_addr = match env::var("BIND_ADDR") {
            Ok(addr) => addr.parse().unwrap_or_else(|e| {
                warn!(addr = %addr, error = %e, "Invalid BIND_ADDR, using default");
                defaults.bind_addr
            }),
            Err(_) => defaults.bind_addr,
        };

        Self {
            database_path,
            settings_path,
            use_aws,
            s3_bucket_name,
            aws_region,
            local_backup_dir,
            backup_interval,
            backup_max_attempts,
            user_id,
            bind_addr,
        }
    }

    /// Check if AWS should be used based on configuration and connectivity
    pub async fn should_use_aws(&self) -> bool {
        use aws_sdk_s3::Client as S3Client;
        use aws_types::region::Region;

        if !self.use_aws {
            return false;
        }

        if self.s3_bucket_name.is_empty() {
            warn!("BACKUP_USE_AWS is set but BACKUP_S3_BUCKET is empty, using local storage");
            return false;
        }

        match async {
            let aws_config = aws_config::from_env()
                .region(Region::new(self.aws_region.clone()))
                .load()
                .await;

            let client = S3Client::new(&aws_config);

            client.head_bucket()
                .bucket(&self.s3_bucket_name)
                .send()
                .await
        }.await {
            Ok(_) => true,
            Err(err) => {
                warn!(error = %err, "AWS S3 connectivity check failed, falling back to local storage");
                false
            }
        }
    }

    /// Ensure local backup directory exists
    pub fn ensure_local_backup_dir(&self) -> std::io::Result<()> {
        if !self.local_backup_dir.exists() {
            std::fs::create_dir_all(&self.local_backup_dir)?;
        }
        Ok(())
    }

    /// User the local auth provider starts signed in as
    pub fn initial_user(&self) -> Option<User> {
        self.user_id.clone().map(|id| User { id })
    }

    /// Scheduling settings handed to the orchestrator
    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            schedule_period: self.backup_interval,
            constraints: JobConstraints {
                max_attempts: self.backup_max_attempts.max(1),
                ..JobConstraints::default()
            },
        }
    }
}
