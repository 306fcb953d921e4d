#![forbid(unsafe_code)]

//! `mcp-relay` — distributed MCP transport server binary.
//!
//! Bootstraps configuration, starts the shared-store pool and its
//! reaper, the message poller, and the streamable HTTP transport.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use mcp_relay::config::GlobalConfig;
use mcp_relay::persistence::pool::PoolManager;
use mcp_relay::rpc::handler::{EmptyCatalog, HandlerRegistry};
use mcp_relay::transport::http::{self, AppState};
use mcp_relay::transport::poller::MessagePoller;
use mcp_relay::{AppError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "mcp-relay", about = "Distributed MCP transport server", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Override the configured instance id.
    #[arg(long)]
    instance_id: Option<String>,

    /// Override the configured HTTP port.
    #[arg(long)]
    port: Option<u16>,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("mcp-relay server bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    // ── Load configuration ──────────────────────────────
    let mut config = GlobalConfig::load_from_path(&args.config)?;
    if let Some(instance_id) = args.instance_id {
        config.instance_id = instance_id;
    }
    if let Some(port) = args.port {
        config.http_port = port;
    }
    let config = Arc::new(config);
    info!(instance_id = %config.instance_id, "configuration loaded");

    // ── Start shared store pool ─────────────────────────
    let pool_manager = Arc::new(PoolManager::new(
        config.datastore.clone(),
        config.reaper,
    ));
    pool_manager.start().await?;
    let db = Arc::new(pool_manager.pool()?);
    info!("shared store connected");

    // ── Build shared application state ──────────────────
    let handlers = HandlerRegistry::new();
    let state = Arc::new(AppState::new(
        Arc::clone(&config),
        db,
        handlers,
        Arc::new(EmptyCatalog),
    ));

    // ── Start the delivery poller ───────────────────────
    let poller = MessagePoller::new(
        config.poller,
        Arc::clone(&state.registry),
        state.sessions.clone(),
        state.server_requests.clone(),
        state.counter.clone(),
    );
    poller.start();

    // ── Start the HTTP transport ────────────────────────
    let ct = CancellationToken::new();
    let http_ct = ct.clone();
    let http_state = Arc::clone(&state);
    let http_handle = tokio::spawn(async move {
        if let Err(err) = http::serve(http_state, http_ct).await {
            error!(%err, "transport failed");
        }
    });

    info!("mcp-relay ready");

    // ── Wait for shutdown signal ────────────────────────
    shutdown_signal().await;
    info!("shutdown signal received");
    ct.cancel();

    poller.stop().await;
    let _ = http_handle.await;
    pool_manager.shutdown().await;

    info!("mcp-relay shut down");
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
