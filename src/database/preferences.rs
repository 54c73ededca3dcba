//! Persisted backup preferences
//!
//! Two scalar fields: whether backup is enabled and when the last backup
//! happened. The orchestrator and the background job both read and write
//! them; the store itself holds no policy.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
#[cfg(test)]
use mockall::automock;
use sqlx::Row;
use tracing::debug;

use crate::database::Result;
use crate::db::DbPool;

/// Preference storage consumed by the orchestrator, engine and scheduler
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PreferenceStore: Send + Sync {
    /// Whether the user has enabled cloud backup
    async fn is_backup_enabled(&self) -> Result<bool>;

    /// Persist the backup-enabled toggle
    async fn set_backup_enabled(&self, enabled: bool) -> Result<()>;

    /// Time of the last known backup, if any
    async fn last_backup_date(&self) -> Result<Option<DateTime<Utc>>>;

    /// Persist (or clear) the time of the last known backup
    async fn save_last_backup_date(&self, date: Option<DateTime<Utc>>) -> Result<()>;

    /// Clear the last backup date and disable backup as a single write
    async fn reset_backup_state(&self) -> Result<()>;
}

/// SQLite-backed preference store with a single settings row
#[derive(Clone)]
pub struct SqlitePreferenceStore {
    pool: DbPool,
}

impl SqlitePreferenceStore {
    /// Create a store over a pool whose migrations have already run
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PreferenceStore for SqlitePreferenceStore {
    async fn is_backup_enabled(&self) -> Result<bool> {
        let row = sqlx::query("SELECT backup_enabled FROM backup_preferences WHERE id = 1")
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(row.try_get::<bool, _>("backup_enabled")?),
            None => Ok(false),
        }
    }

    async fn set_backup_enabled(&self, enabled: bool) -> Result<()> {
        debug!(enabled, "Saving backup preference");
        sqlx::query(
            r#"
            INSERT INTO backup_preferences (id, backup_enabled) VALUES (1, ?)
            ON CONFLICT(id) DO UPDATE SET backup_enabled = excluded.backup_enabled
            "#,
        )
        .bind(enabled)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn last_backup_date(&self) -> Result<Option<DateTime<Utc>>> {
        let row = sqlx::query("SELECT last_backup_date FROM backup_preferences WHERE id = 1")
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(row.try_get::<Option<DateTime<Utc>>, _>("last_backup_date")?),
            None => Ok(None),
        }
    }

    async fn save_last_backup_date(&self, date: Option<DateTime<Utc>>) -> Result<()> {
        debug!(date = ?date, "Saving last backup date");
        sqlx::query(
            r#"
            INSERT INTO backup_preferences (id, last_backup_date) VALUES (1, ?)
            ON CONFLICT(id) DO UPDATE SET last_backup_date = excluded.last_backup_date
            "#,
        )
        .bind(date)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn reset_backup_state(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO backup_preferences (id, backup_enabled, last_backup_date) VALUES (1, 0, NULL)
            ON CONFLICT(id) DO UPDATE SET backup_enabled = 0, last_backup_date = NULL
            "#,
        )
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        debug!("Reset backup preferences");
        Ok(())
    }
}
