#![forbid(unsafe_code)]

//! `duplex-responder`: serves the responder routes over TCP.
//!
//! Bootstraps configuration, binds the framed transport, and optionally
//! the HTTP liveness probe, then runs until SIGINT/SIGTERM.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use duplex_watchdog::auth::UserStore;
use duplex_watchdog::config::GlobalConfig;
use duplex_watchdog::roles::responder::{responder_router, ResponderSettings};
use duplex_watchdog::transport::server::{bind, spawn_server};
use duplex_watchdog::transport::ConnectionContext;
use duplex_watchdog::{probe, AppError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "duplex-responder", about = "Duplex session responder", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file. Defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Override `transport.port`.
    #[arg(long)]
    port: Option<u16>,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("duplex-responder bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    // ── Load configuration ──────────────────────────────
    let mut config = match args.config {
        Some(ref path) => GlobalConfig::load_from_path(path)?,
        None => GlobalConfig::default(),
    };
    if let Some(port) = args.port {
        config.transport.port = port;
    }
    info!(
        users = config.users.len(),
        watchdog = ?config.watchdog.mode,
        "configuration loaded"
    );

    // ── Start transports ────────────────────────────────
    let ct = CancellationToken::new();
    let ctx = ConnectionContext::new(responder_router(ResponderSettings::from_config(&config)))
        .with_users(UserStore::new(config.users.clone()));

    let listener = bind(config.transport_addr()?).await?;
    let server_handle = spawn_server(listener, ctx, ct.clone());

    let probe_handle = match config.probe_addr()? {
        Some(addr) => {
            let listener = tokio::net::TcpListener::bind(addr)
                .await
                .map_err(|err| AppError::Transport(format!("failed to bind probe on {addr}: {err}")))?;
            let probe_ct = ct.clone();
            Some(tokio::spawn(async move {
                if let Err(err) = probe::serve_probe(listener, probe_ct).await {
                    error!(%err, "liveness probe failed");
                }
            }))
        }
        None => None,
    };

    info!("duplex-responder ready");

    // ── Wait for shutdown signal ────────────────────────
    shutdown_signal().await;
    info!("shutdown signal received");
    ct.cancel();

    let _ = server_handle.await;
    if let Some(handle) = probe_handle {
        let _ = handle.await;
    }
    info!("duplex-responder shut down");

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
