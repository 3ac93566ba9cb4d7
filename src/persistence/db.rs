//! `SQLite` connection pool setup and schema bootstrap.

use std::path::Path;
use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;

use crate::{AppError, Result};

use super::schema;

/// Alias for the shared `SQLite` pool.
pub type Database = SqlitePool;

/// Open (creating if needed) the database file at `path` and apply schema.
///
/// # Errors
///
/// Returns `AppError::Db` if the directory, connection, or schema
/// bootstrap fails.
pub async fn connect(path: &Path) -> Result<Database> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .map_err(|err| AppError::Db(format!("failed to create db dir: {err}")))?;
    }

    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal);

    let pool = SqlitePoolOptions::new()
        .max_connections(4)
        .connect_with(options)
        .await?;

    schema::bootstrap_schema(&pool).await?;
    Ok(pool)
}

/// Open a private in-memory database with schema applied.
///
/// The pool holds a single connection that never expires, since every
/// `SQLite` memory connection is its own database.
///
/// # Errors
///
/// Returns `AppError::Db` if the connection or schema bootstrap fails.
pub async fn connect_memory() -> Result<Database> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await?;

    schema::bootstrap_schema(&pool).await?;
    Ok(pool)
}
