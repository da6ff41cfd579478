//! Command-line argument parsing for the engine adapter daemon.

use clap::Parser;

/// Engine adapter — exposes a hypervisor node's VM lifecycle over JSON-RPC.
#[derive(Parser, Debug)]
#[command(name = "engine-adapter")]
#[command(about = "Workstation engine adapter - hypervisor JSON-RPC endpoint")]
#[command(version)]
pub struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/workstation-coordinator/engine-adapter.yaml")]
    pub config: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    pub log_level: String,

    /// Address to listen on for the JSON-RPC endpoint
    #[arg(long)]
    pub listen: Option<String>,
}
