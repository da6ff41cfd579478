mod cli;
mod config;
mod error;
mod proxmox;
mod server;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use crate::cli::Args;
use crate::config::Config;
use crate::proxmox::{ProxmoxApi, ProxmoxEngine};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    workstation_common::init_logging(&args.log_level).context("failed to initialize logging")?;

    let config = Config::load(&args.config)
        .context("failed to load configuration")?
        .with_cli_overrides(&args);

    info!(
        listen = %config.server.listen_address,
        proxmox_host = %config.proxmox.host,
        "starting engine adapter"
    );

    let api = ProxmoxApi::new(&config.proxmox).context("failed to build Proxmox API client")?;
    let engine = ProxmoxEngine::connect(api, config.proxmox.primary_node.clone())
        .await
        .context("failed to connect to Proxmox")?;

    let app = server::router(Arc::new(engine));
    let listener = tokio::net::TcpListener::bind(&config.server.listen_address)
        .await
        .with_context(|| format!("failed to bind {}", config.server.listen_address))?;

    axum::serve(listener, app)
        .await
        .context("engine adapter server stopped")?;

    Ok(())
}
