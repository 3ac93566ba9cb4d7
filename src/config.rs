//! Global configuration parsing and validation.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::{AppError, Result};

/// Listener settings for the duplex endpoint.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ServerConfig {
    /// Interface address to bind.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// HTTP port serving `/ws` and `/health`.
    #[serde(default = "default_http_port")]
    pub http_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            http_port: default_http_port(),
        }
    }
}

fn default_bind_address() -> String {
    "127.0.0.1".into()
}

fn default_http_port() -> u16 {
    3100
}

/// Per-connection queueing and backpressure thresholds.
///
/// Watermarks are fractions of `queue_capacity` in `0.0..=1.0`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct TransportConfig {
    /// Outbound ring queue capacity per connection.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Drop the oldest queued message when full instead of rejecting.
    #[serde(default = "default_true")]
    pub overwrite_oldest: bool,
    /// Queue usage at which a `PAUSE` signal is emitted.
    #[serde(default = "default_high_watermark")]
    pub high_watermark: f64,
    /// Queue usage at which a `SLOW_DOWN` advisory is emitted.
    #[serde(default = "default_slow_down_watermark")]
    pub slow_down_watermark: f64,
    /// Queue usage at or below which a paused connection is resumed.
    #[serde(default = "default_low_watermark")]
    pub low_watermark: f64,
    /// Suggested send rate (messages per second) carried by `SLOW_DOWN`.
    #[serde(default = "default_suggested_rate")]
    pub suggested_rate: u32,
    /// Batch `ACK` signals on a timer instead of one per command.
    #[serde(default = "default_true")]
    pub auto_ack: bool,
    /// Flush interval for batched acknowledgments.
    #[serde(default = "default_ack_interval_ms")]
    pub ack_interval_ms: u64,
    /// Maximum messages drained from the ring queue per writer wake-up.
    #[serde(default = "default_drain_batch")]
    pub drain_batch: usize,
    /// Capacity of the direct outbound channel (replies and signals).
    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            overwrite_oldest: true,
            high_watermark: default_high_watermark(),
            slow_down_watermark: default_slow_down_watermark(),
            low_watermark: default_low_watermark(),
            suggested_rate: default_suggested_rate(),
            auto_ack: true,
            ack_interval_ms: default_ack_interval_ms(),
            drain_batch: default_drain_batch(),
            outbound_buffer: default_outbound_buffer(),
        }
    }
}

impl TransportConfig {
    /// Auto-ack flush interval as a [`Duration`].
    #[must_use]
    pub fn ack_interval(&self) -> Duration {
        Duration::from_millis(self.ack_interval_ms)
    }
}

fn default_queue_capacity() -> usize {
    10_000
}

fn default_high_watermark() -> f64 {
    0.8
}

fn default_slow_down_watermark() -> f64 {
    0.6
}

fn default_low_watermark() -> f64 {
    0.3
}

fn default_suggested_rate() -> u32 {
    10
}

fn default_ack_interval_ms() -> u64 {
    1000
}

fn default_drain_batch() -> usize {
    256
}

fn default_outbound_buffer() -> usize {
    256
}

/// Default policy applied to lazily created auto-checkpoint engines.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct AutoCheckpointConfig {
    /// Whether automatic triggers are armed.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Periodic checkpoint interval; 0 disables the timer.
    #[serde(default = "default_interval_minutes")]
    pub interval_minutes: u64,
    /// Messages observed before a checkpoint; 0 disables.
    #[serde(default = "default_message_threshold")]
    pub message_threshold: u64,
    /// Cumulative token total before a checkpoint; 0 disables.
    #[serde(default = "default_token_threshold")]
    pub token_threshold: u64,
    /// Minimum spacing between non-forced checkpoints.
    #[serde(default = "default_cooldown_seconds")]
    pub cooldown_seconds: u64,
    /// Gzip snapshot payloads.
    #[serde(default = "default_true")]
    pub compress: bool,
    /// Prefix for generated checkpoint descriptions.
    #[serde(default = "default_description_prefix")]
    pub description_prefix: String,
}

impl Default for AutoCheckpointConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_minutes: default_interval_minutes(),
            message_threshold: default_message_threshold(),
            token_threshold: default_token_threshold(),
            cooldown_seconds: default_cooldown_seconds(),
            compress: true,
            description_prefix: default_description_prefix(),
        }
    }
}

/// Longest accepted auto-checkpoint interval (one year).
pub const MAX_INTERVAL_MINUTES: u64 = 525_600;

fn default_interval_minutes() -> u64 {
    10
}

fn default_message_threshold() -> u64 {
    50
}

fn default_token_threshold() -> u64 {
    100_000
}

fn default_cooldown_seconds() -> u64 {
    30
}

fn default_description_prefix() -> String {
    "Auto-checkpoint".into()
}

/// Context-window rotation thresholds.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct RotationConfig {
    /// Context window size of the hosted model, in tokens.
    #[serde(default = "default_context_window_tokens")]
    pub context_window_tokens: u64,
    /// Fraction of the window at which rotation is recommended.
    #[serde(default = "default_rotate_at_ratio")]
    pub rotate_at_ratio: f64,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            context_window_tokens: default_context_window_tokens(),
            rotate_at_ratio: default_rotate_at_ratio(),
        }
    }
}

fn default_context_window_tokens() -> u64 {
    200_000
}

fn default_rotate_at_ratio() -> f64 {
    0.9
}

/// Handoff protocol defaults.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct HandoffConfig {
    /// Expiry applied when a request carries `timeout_ms = 0`.
    #[serde(default = "default_handoff_timeout_ms")]
    pub default_timeout_ms: u64,
    /// How often overdue handoffs are swept.
    #[serde(default = "default_sweep_interval_seconds")]
    pub sweep_interval_seconds: u64,
    /// Retry ceiling applied when a request carries `max_retries = 0`.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for HandoffConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: default_handoff_timeout_ms(),
            sweep_interval_seconds: default_sweep_interval_seconds(),
            max_retries: default_max_retries(),
        }
    }
}

fn default_handoff_timeout_ms() -> u64 {
    300_000
}

fn default_sweep_interval_seconds() -> u64 {
    5
}

fn default_max_retries() -> u32 {
    2
}

fn default_true() -> bool {
    true
}

fn default_db_path() -> PathBuf {
    PathBuf::from(".continuity").join("checkpoints.db")
}

/// Global configuration parsed from `config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// `SQLite` database file backing the checkpoint store.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    /// Listener settings.
    #[serde(default)]
    pub server: ServerConfig,
    /// Per-connection queueing and flow control.
    #[serde(default)]
    pub transport: TransportConfig,
    /// Default auto-checkpoint policy.
    #[serde(default)]
    pub auto_checkpoint: AutoCheckpointConfig,
    /// Context-window rotation thresholds.
    #[serde(default)]
    pub rotation: RotationConfig,
    /// Handoff protocol defaults.
    #[serde(default)]
    pub handoff: HandoffConfig,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            server: ServerConfig::default(),
            transport: TransportConfig::default(),
            auto_checkpoint: AutoCheckpointConfig::default(),
            rotation: RotationConfig::default(),
            handoff: HandoffConfig::default(),
        }
    }
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Socket address string for the listener.
    #[must_use]
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.bind_address, self.server.http_port)
    }

    fn validate(&self) -> Result<()> {
        let transport = &self.transport;

        if transport.queue_capacity == 0 {
            return Err(AppError::Config(
                "transport.queue_capacity must be greater than zero".into(),
            ));
        }

        if transport.outbound_buffer == 0 || transport.drain_batch == 0 {
            return Err(AppError::Config(
                "transport.outbound_buffer and transport.drain_batch must be greater than zero"
                    .into(),
            ));
        }

        if transport.auto_ack && transport.ack_interval_ms == 0 {
            return Err(AppError::Config(
                "transport.ack_interval_ms must be greater than zero when auto_ack is enabled"
                    .into(),
            ));
        }

        let in_unit = |v: f64| (0.0..=1.0).contains(&v);
        if !in_unit(transport.low_watermark)
            || !in_unit(transport.slow_down_watermark)
            || !in_unit(transport.high_watermark)
        {
            return Err(AppError::Config(
                "transport watermarks must lie within 0.0..=1.0".into(),
            ));
        }

        if transport.low_watermark >= transport.high_watermark
            || transport.slow_down_watermark > transport.high_watermark
        {
            return Err(AppError::Config(
                "transport watermarks must satisfy low < high and slow_down <= high".into(),
            ));
        }

        if self.auto_checkpoint.interval_minutes > MAX_INTERVAL_MINUTES {
            return Err(AppError::Config(format!(
                "auto_checkpoint.interval_minutes must not exceed {MAX_INTERVAL_MINUTES}"
            )));
        }

        if self.rotation.rotate_at_ratio <= 0.0 || self.rotation.rotate_at_ratio > 1.0 {
            return Err(AppError::Config(
                "rotation.rotate_at_ratio must lie within (0.0, 1.0]".into(),
            ));
        }

        if self.handoff.default_timeout_ms == 0 {
            return Err(AppError::Config(
                "handoff.default_timeout_ms must be greater than zero".into(),
            ));
        }

        Ok(())
    }
}
