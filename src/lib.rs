#![forbid(unsafe_code)]

//! Session continuity for multi-agent gateways: checkpoints, rotation,
//! handoff, and flow-controlled event streaming.

pub mod checkpoint;
pub mod config;
pub mod errors;
pub mod events;
pub mod models;
pub mod orchestrator;
pub mod persistence;
pub mod services;
pub mod transport;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};
