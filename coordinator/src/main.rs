mod cli;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use coordinator::config::SeedConfig;
use coordinator::coordinator::Coordinator;
use coordinator::store::{MemoryStore, Store};
use tracing::info;

use crate::cli::Args;

/// Truthy per the environment-variable convention used throughout the
/// workspace (`PROXMOX_VERIFY_SSL` in `engine-adapter`): present and not
/// one of the common "off" spellings.
fn env_is_truthy(name: &str) -> bool {
    std::env::var(name)
        .map(|v| !matches!(v.to_lowercase().as_str(), "" | "false" | "0"))
        .unwrap_or(false)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    workstation_common::init_logging(&args.log_level).context("failed to initialize logging")?;

    if !env_is_truthy("RUN_COORDINATOR") {
        info!("RUN_COORDINATOR is not set, exiting without starting the control loop");
        return Ok(());
    }

    let seed = if args.dev {
        info!("--dev set, seeding the in-memory store with a demo fleet");
        SeedConfig::demo()
    } else {
        SeedConfig::load(&args.config).context("failed to load configuration")?
    };

    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    seed.apply(&store).await.context("failed to seed store")?;

    let coordinator = Coordinator::instance(store);
    coordinator.start().await;

    info!("coordinator started, entering idle wait");
    loop {
        tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
        if !coordinator.is_active().await {
            anyhow::bail!("coordinator control loop exited unexpectedly");
        }
    }
}
