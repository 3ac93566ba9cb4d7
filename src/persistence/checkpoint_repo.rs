//! Checkpoint repository for `SQLite` persistence.
//!
//! Checkpoints are immutable: the repository inserts and reads, nothing
//! else. The payload column holds the serialized (and possibly gzipped)
//! snapshot exactly as it was checksummed.

use std::sync::Arc;

use chrono::{SecondsFormat, Utc};

use crate::models::checkpoint::{CheckpointMetadata, CompressionStats, TokenUsage};
use crate::{AppError, Result};

use super::db::Database;

/// A persisted checkpoint: descriptive fields plus the stored payload.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredCheckpoint {
    /// Descriptive fields.
    pub metadata: CheckpointMetadata,
    /// Serialized snapshot bytes as checksummed.
    pub payload: Vec<u8>,
    /// Whether `payload` is gzip-compressed.
    pub compressed: bool,
}

/// Repository wrapper around `SQLite` for checkpoint records.
#[derive(Clone)]
pub struct CheckpointRepo {
    db: Arc<Database>,
}

/// Internal row struct for `SQLite` deserialization.
#[derive(sqlx::FromRow)]
struct CheckpointRow {
    id: String,
    agent_id: String,
    description: Option<String>,
    tags: String,
    payload: Vec<u8>,
    compressed: i64,
    checksum: String,
    message_count: i64,
    prompt_tokens: i64,
    completion_tokens: i64,
    total_tokens: i64,
    bytes_in: Option<i64>,
    bytes_out: Option<i64>,
    created_at: String,
}

impl CheckpointRow {
    fn into_stored(self) -> Result<StoredCheckpoint> {
        let tags: Vec<String> = serde_json::from_str(&self.tags)
            .map_err(|e| AppError::Db(format!("invalid tags: {e}")))?;
        let created_at = chrono::DateTime::parse_from_rfc3339(&self.created_at)
            .map_err(|e| AppError::Db(format!("invalid created_at: {e}")))?
            .with_timezone(&Utc);

        let compression_stats = match (self.bytes_in, self.bytes_out) {
            (Some(bytes_in), Some(bytes_out)) => {
                let bytes_in = from_column(bytes_in, "bytes_in")?;
                let bytes_out = from_column(bytes_out, "bytes_out")?;
                #[allow(clippy::cast_precision_loss)] // payload sizes stay far below 2^52
                let ratio = if bytes_in == 0 {
                    1.0
                } else {
                    bytes_out as f64 / bytes_in as f64
                };
                Some(CompressionStats {
                    bytes_in,
                    bytes_out,
                    ratio,
                })
            }
            _ => None,
        };

        Ok(StoredCheckpoint {
            metadata: CheckpointMetadata {
                id: self.id,
                agent_id: self.agent_id,
                description: self.description,
                tags,
                message_count: from_column(self.message_count, "message_count")?,
                token_usage: TokenUsage {
                    prompt_tokens: from_column(self.prompt_tokens, "prompt_tokens")?,
                    completion_tokens: from_column(self.completion_tokens, "completion_tokens")?,
                    total_tokens: from_column(self.total_tokens, "total_tokens")?,
                },
                compression_stats,
                checksum: self.checksum,
                created_at,
            },
            payload: self.payload,
            compressed: self.compressed != 0,
        })
    }
}

fn from_column(value: i64, column: &str) -> Result<u64> {
    u64::try_from(value).map_err(|_| AppError::Db(format!("negative {column}: {value}")))
}

fn to_column(value: u64, column: &str) -> Result<i64> {
    i64::try_from(value).map_err(|_| AppError::Db(format!("{column} out of range: {value}")))
}

const SELECT_COLUMNS: &str = "SELECT id, agent_id, description, tags, payload, compressed, checksum,
            message_count, prompt_tokens, completion_tokens, total_tokens,
            bytes_in, bytes_out, created_at
     FROM checkpoint";

impl CheckpointRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert a new checkpoint record.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Checkpoint` if the id already exists, or
    /// `AppError::Db` if the insert fails.
    pub async fn insert(&self, stored: &StoredCheckpoint) -> Result<()> {
        let meta = &stored.metadata;
        let tags = serde_json::to_string(&meta.tags)?;
        let created_at = meta.created_at.to_rfc3339_opts(SecondsFormat::Micros, true);
        let (bytes_in, bytes_out) = match meta.compression_stats {
            Some(stats) => (
                Some(to_column(stats.bytes_in, "bytes_in")?),
                Some(to_column(stats.bytes_out, "bytes_out")?),
            ),
            None => (None, None),
        };

        let result = sqlx::query(
            "INSERT INTO checkpoint (id, agent_id, description, tags, payload, compressed, checksum,
                 message_count, prompt_tokens, completion_tokens, total_tokens,
                 bytes_in, bytes_out, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        )
        .bind(&meta.id)
        .bind(&meta.agent_id)
        .bind(&meta.description)
        .bind(&tags)
        .bind(&stored.payload)
        .bind(i64::from(stored.compressed))
        .bind(&meta.checksum)
        .bind(to_column(meta.message_count, "message_count")?)
        .bind(to_column(meta.token_usage.prompt_tokens, "prompt_tokens")?)
        .bind(to_column(meta.token_usage.completion_tokens, "completion_tokens")?)
        .bind(to_column(meta.token_usage.total_tokens, "total_tokens")?)
        .bind(bytes_in)
        .bind(bytes_out)
        .bind(&created_at)
        .execute(self.db.as_ref())
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(err)) if err.is_unique_violation() => Err(
                AppError::Checkpoint(format!("checkpoint {} already exists", meta.id)),
            ),
            Err(err) => Err(err.into()),
        }
    }

    /// Retrieve a checkpoint by identifier.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn get_by_id(&self, id: &str) -> Result<Option<StoredCheckpoint>> {
        let row: Option<CheckpointRow> = sqlx::query_as(&format!("{SELECT_COLUMNS} WHERE id = ?1"))
            .bind(id)
            .fetch_optional(self.db.as_ref())
            .await?;
        row.map(CheckpointRow::into_stored).transpose()
    }

    /// List all checkpoints for an agent, oldest first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list_for_agent(&self, agent_id: &str) -> Result<Vec<StoredCheckpoint>> {
        let rows: Vec<CheckpointRow> = sqlx::query_as(&format!(
            "{SELECT_COLUMNS} WHERE agent_id = ?1 ORDER BY created_at ASC, rowid ASC"
        ))
        .bind(agent_id)
        .fetch_all(self.db.as_ref())
        .await?;
        rows.into_iter().map(CheckpointRow::into_stored).collect()
    }

    /// Most recent checkpoint for an agent.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn latest_for_agent(&self, agent_id: &str) -> Result<Option<StoredCheckpoint>> {
        let row: Option<CheckpointRow> = sqlx::query_as(&format!(
            "{SELECT_COLUMNS} WHERE agent_id = ?1 ORDER BY created_at DESC, rowid DESC LIMIT 1"
        ))
        .bind(agent_id)
        .fetch_optional(self.db.as_ref())
        .await?;
        row.map(CheckpointRow::into_stored).transpose()
    }

    /// Number of stored checkpoints for an agent.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn count_for_agent(&self, agent_id: &str) -> Result<u64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM checkpoint WHERE agent_id = ?1")
            .bind(agent_id)
            .fetch_one(self.db.as_ref())
            .await?;
        from_column(count, "count")
    }
}
