//! Error types shared across the application.

use std::fmt::{Display, Formatter};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all domain failure modes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// Persistence failure when interacting with `SQLite`.
    Db(String),
    /// Duplex transport failure (socket bind, send, upgrade).
    Transport(String),
    /// Malformed or unrecognised client frame.
    Protocol(String),
    /// Checkpoint creation or restore failure.
    Checkpoint(String),
    /// Stored checkpoint payload failed checksum verification.
    Integrity(String),
    /// Handoff protocol failure outside the transition table.
    Handoff(String),
    /// Handoff phase change not present in the transition table.
    InvalidTransition(String),
    /// Agent rotation failure.
    Rotation(String),
    /// Requested entity does not exist.
    NotFound(String),
    /// File-system or I/O operation failure.
    Io(String),
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Db(msg) => write!(f, "db: {msg}"),
            Self::Transport(msg) => write!(f, "transport: {msg}"),
            Self::Protocol(msg) => write!(f, "protocol: {msg}"),
            Self::Checkpoint(msg) => write!(f, "checkpoint: {msg}"),
            Self::Integrity(msg) => write!(f, "integrity: {msg}"),
            Self::Handoff(msg) => write!(f, "handoff: {msg}"),
            Self::InvalidTransition(msg) => write!(f, "invalid transition: {msg}"),
            Self::Rotation(msg) => write!(f, "rotation: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        Self::Db(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Checkpoint(format!("serialization failed: {err}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
