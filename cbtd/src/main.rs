//! Compiler backend tester - ledger daemon.

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use cbt_common::{ErrorCode, LogConfig, LogFormat, init_logging};
use cbtd::{AppState, DaemonConfig, DumpRetention, Ledger, create_router, serve};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "cbtd")]
#[command(author, version, about = "CBT daemon - job ledger for compiler backend testing")]
struct Cli {
    /// Path to the daemon configuration (TOML)
    #[arg(short, long, env = "CBTD_CONFIG")]
    config: Option<PathBuf>,

    /// Address to listen on
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// Ledger snapshot file (JSON)
    #[arg(long)]
    state_file: Option<PathBuf>,

    /// Directory for uploaded dump archives
    #[arg(long)]
    media_dir: Option<PathBuf>,

    /// Also write daily-rotated logs into this directory
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Log as JSON lines instead of human-readable text
    #[arg(long)]
    json_logs: bool,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut log_config = LogConfig::from_env("cbtd");
    if cli.verbose {
        log_config = log_config.with_level("debug");
    }
    if cli.json_logs {
        log_config = log_config.with_format(LogFormat::Json);
    }
    if let Some(dir) = &cli.log_dir {
        log_config = log_config.with_dir(dir);
    }
    let _log_guards = init_logging(&log_config)?;

    info!("Starting CBT daemon...");

    let mut config = match &cli.config {
        Some(path) => DaemonConfig::load(path)?,
        None => {
            warn!("No configuration file given, using defaults");
            DaemonConfig::default()
        }
    };
    if let Some(bind) = cli.bind {
        config.bind = bind;
    }
    if let Some(path) = cli.state_file {
        config.state_file = Some(path);
    }
    if let Some(dir) = cli.media_dir {
        config.media_dir = dir;
    }
    config.validate().context("invalid daemon configuration")?;

    let ledger = match &config.state_file {
        Some(path) => {
            let ledger = Ledger::load_from_file(path).map_err(|e| {
                error!(error_code = %e.code().code_string(), "{}", e);
                e
            })?;
            info!("Ledger snapshot at {:?}", path);
            Arc::new(ledger)
        }
        None => {
            info!("Ledger in-memory only (no persistence)");
            Arc::new(Ledger::new())
        }
    };

    let state = AppState::new(Arc::clone(&ledger), &config);
    info!("Dump archives stored under {:?}", state.dumps.media_dir());
    let dispatcher = Arc::clone(&state.dispatcher);
    let retention = Arc::new(DumpRetention::new(
        Arc::clone(&ledger),
        state.dumps.clone(),
        config.dump_retention(),
        config.retention_interval(),
    ));

    let dispatcher_task = dispatcher.start();
    let retention_task = retention.start();

    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .map_err(|e| {
            error!(
                error_code = %ErrorCode::InternalBindFailed.code_string(),
                "Failed to bind {}: {}", config.bind, e
            );
            e
        })
        .with_context(|| format!("failed to bind {}", config.bind))?;

    let router = create_router(state);
    tokio::select! {
        result = serve(listener, router) => {
            result.context("ledger API server failed")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    dispatcher_task.abort();
    retention_task.abort();
    info!("CBT daemon stopped");
    Ok(())
}
