//! vigil-scan - threat-scan intake, resolution and alerting service
//!
//! Startup order: configuration, tracing, database, pipeline wiring, workers,
//! HTTP server. Ctrl-C stops the server and cancels the workers.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use vigil_common::config::TomlConfig;
use vigil_scan::{build_router, db, spawn_workers, AppState};

#[derive(Debug, Parser)]
#[command(name = "vigil-scan", version, about = "Threat-scan intake and alerting service")]
struct Args {
    /// Path to TOML config (falls back to ~/.config/vigil/vigil.toml)
    #[arg(short, long, env = "VIGIL_CONFIG")]
    config: Option<PathBuf>,

    /// Override `[server] port`
    #[arg(short, long, env = "VIGIL_PORT")]
    port: Option<u16>,

    /// Override `[database] path`
    #[arg(long, env = "VIGIL_DATABASE")]
    database: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Config first: the log level may come from it
    let (mut config, config_source) = TomlConfig::load(args.config.as_deref())?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.logging.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting vigil-scan v{}", env!("CARGO_PKG_VERSION"));
    match &config_source {
        Some(path) => info!("Configuration loaded from {}", path.display()),
        None => warn!("No configuration file found, running with compiled defaults"),
    }

    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(path) = args.database {
        config.database.path = Some(path);
    }

    let db_path = config.database.resolved_path();
    info!("Database path: {}", db_path.display());
    let pool = match db::init_database_pool(&db_path).await {
        Ok(pool) => {
            info!("Connected to database");
            pool
        }
        Err(e) => {
            error!("Failed to open database: {}", e);
            return Err(e.into());
        }
    };

    let state = AppState::from_config(pool, &config)?;

    let cancel = CancellationToken::new();
    let workers = spawn_workers(&state, cancel.clone());
    let app = build_router(state);

    let addr = format!("{}:{}", config.server.bind, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("bind {}", addr))?;
    info!("vigil-scan listening on http://{}", addr);
    info!("Health check: http://{}/health", addr);

    let shutdown = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
            info!("Shutdown requested");
            shutdown.cancel();
        })
        .await?;

    cancel.cancel();
    for worker in workers {
        if let Err(e) = worker.await {
            warn!("Worker ended abnormally: {}", e);
        }
    }
    info!("vigil-scan stopped");

    Ok(())
}
