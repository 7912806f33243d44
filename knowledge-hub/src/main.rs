use anyhow::{Context, Result};
use clap::Parser;
use knowledge_hub::api;
use knowledge_hub_core::{BackendMode, Config, StorageManager};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "knowledge-hub")]
#[command(about = "Knowledge base document store with git, database and hybrid backends")]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, env = "KB_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address
    #[arg(short, long, default_value = "127.0.0.1:3000")]
    addr: String,

    /// Backend mode, overriding the configuration file
    #[arg(short, long)]
    mode: Option<BackendMode>,

    /// Base directory, overriding the configuration file
    #[arg(long)]
    base_path: Option<PathBuf>,

    /// Remote repository URL, overriding the configuration file
    #[arg(long)]
    remote_url: Option<String>,

    /// Disable access control (every caller may do anything)
    #[arg(long)]
    no_access_control: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(mode) = cli.mode {
        config.mode = mode;
    }
    if let Some(base_path) = cli.base_path {
        config.base_path = base_path;
    }
    if let Some(url) = cli.remote_url {
        config.remote_url = Some(url);
    }
    if cli.no_access_control {
        config.access_control_enabled = false;
    }

    let manager = Arc::new(
        StorageManager::open(config)
            .await
            .context("opening storage")?,
    );
    let app = api::router(manager.clone());

    let listener = TcpListener::bind(&cli.addr)
        .await
        .with_context(|| format!("binding {}", cli.addr))?;
    info!(addr = %cli.addr, mode = %manager.mode(), "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    manager.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}
