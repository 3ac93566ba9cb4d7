//! `SQLite` schema bootstrap logic.
//!
//! All table definitions use `CREATE TABLE IF NOT EXISTS`, so the
//! bootstrap is safe to re-run on every server startup.

use sqlx::SqlitePool;

use crate::Result;

/// Apply all table definitions to the connected `SQLite` database.
///
/// # Errors
///
/// Returns `AppError::Db` if any DDL statement fails.
pub async fn bootstrap_schema(pool: &SqlitePool) -> Result<()> {
    let ddl = r"
CREATE TABLE IF NOT EXISTS checkpoint (
    id                TEXT PRIMARY KEY NOT NULL,
    agent_id          TEXT NOT NULL,
    description       TEXT,
    tags              TEXT NOT NULL,
    payload           BLOB NOT NULL,
    compressed        INTEGER NOT NULL CHECK(compressed IN (0, 1)),
    checksum          TEXT NOT NULL,
    message_count     INTEGER NOT NULL,
    prompt_tokens     INTEGER NOT NULL,
    completion_tokens INTEGER NOT NULL,
    total_tokens      INTEGER NOT NULL,
    bytes_in          INTEGER,
    bytes_out         INTEGER,
    created_at        TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_checkpoint_agent ON checkpoint(agent_id, created_at);
";

    sqlx::raw_sql(ddl).execute(pool).await?;
    Ok(())
}
