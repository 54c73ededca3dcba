//! Database module for the local SQLite file and its cloud backup/restore

pub mod storage;

pub mod backup;
pub mod backup_naming;
pub mod preferences;

/// SQLite database file path
pub const DATABASE_PATH: &str = "db.sqlite";

/// SQLite file holding backup preferences, kept apart from the restorable database
pub const SETTINGS_PATH: &str = "settings.sqlite";

/// Error type for backup/restore operations
///
/// Errors are fanned out to every observer of the orchestrator, so the type
/// is `Clone` and I/O errors are flattened to their kind and message.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BackupError {
    #[error("Not authenticated")]
    NotAuthenticated,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("No backup found in remote storage")]
    RemoteNotFound,

    #[error("Failed to snapshot database: {0}")]
    Serialization(String),

    #[error("Failed to replace local database: {0}")]
    Replace(String),

    #[error("IO error ({kind:?}): {message}")]
    Io {
        kind: std::io::ErrorKind,
        message: String,
    },

    #[error("Preference store error: {0}")]
    Preferences(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Scheduler error: {0}")]
    Scheduler(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Backup orchestrator has stopped")]
    OrchestratorStopped,
}

impl From<std::io::Error> for BackupError {
    fn from(error: std::io::Error) -> Self {
        BackupError::Io {
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

impl From<sqlx::Error> for BackupError {
    fn from(error: sqlx::Error) -> Self {
        BackupError::Preferences(error.to_string())
    }
}

impl From<sqlx::migrate::MigrateError> for BackupError {
    fn from(error: sqlx::migrate::MigrateError) -> Self {
        BackupError::Preferences(format!("migration failed: {}", error))
    }
}

/// Result type for backup/restore operations
pub type Result<T> = std::result::Result<T, BackupError>;
