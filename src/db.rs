use sqlx::{
    migrate::MigrateDatabase,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
    Pool, Sqlite,
};
use std::path::Path;
use std::str::FromStr;

use crate::database::Result;

// Database connection pool type
pub type DbPool = Pool<Sqlite>;

fn sqlite_url(path: &Path) -> String {
    format!("sqlite:{}", path.display())
}

/// Open the application database that gets mirrored to the cloud
///
/// The database uses a rollback journal rather than WAL: a restore renames a
/// new file over this path, and a leftover `-wal` file would be replayed
/// against the restored database.
pub async fn init_db(path: &Path) -> std::result::Result<DbPool, sqlx::Error> {
    let url = sqlite_url(path);

    if !Sqlite::database_exists(&url).await.unwrap_or(false) {
        Sqlite::create_database(&url).await?;
    }

    let options = SqliteConnectOptions::from_str(&url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Delete);

    SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
}

/// Open the settings database holding backup preferences, running migrations if necessary
pub async fn init_settings_db(path: &Path) -> Result<DbPool> {
    let url = sqlite_url(path);

    let options = SqliteConnectOptions::from_str(&url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal);

    let pool = SqlitePoolOptions::new()
        .max_connections(2)
        .connect_with(options)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;

    Ok(pool)
}
