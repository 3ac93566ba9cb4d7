#![forbid(unsafe_code)]

//! `agent-continuity` server binary.
//!
//! Bootstraps configuration, opens the checkpoint database, wires the
//! continuity services, and serves the WebSocket event transport until a
//! shutdown signal arrives.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use agent_continuity::config::GlobalConfig;
use agent_continuity::persistence::db;
use agent_continuity::services::Services;
use agent_continuity::transport::ws;
use agent_continuity::{AppError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "agent-continuity", about = "Agent session continuity server", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("agent-continuity server bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    let config = Arc::new(GlobalConfig::load_from_path(&args.config)?);
    info!("configuration loaded");

    let db = Arc::new(db::connect(&config.db_path).await?);
    info!(db_path = %config.db_path.display(), "database connected");

    let services = Services::build(Arc::clone(&config), db);
    let ct = CancellationToken::new();
    let sweeper_handle = services.spawn_background(ct.clone());

    let bind = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .map_err(|err| AppError::Transport(format!("failed to bind {bind}: {err}")))?;

    let ws_ct = ct.clone();
    let ws_registry = Arc::clone(&services.registry);
    let ws_handle = tokio::spawn(async move {
        if let Err(err) = ws::serve(listener, ws_registry, ws_ct).await {
            error!(%err, "websocket transport failed");
        }
    });

    info!(%bind, "continuity server ready");

    shutdown_signal().await;
    info!("shutdown signal received");
    ct.cancel();
    services.shutdown();

    let _ = tokio::join!(ws_handle, sweeper_handle);
    info!("agent-continuity shut down");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            tracing::error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
