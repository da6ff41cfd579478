//! Command-line argument parsing for the coordinator daemon.

use clap::Parser;

/// Coordinator — drives workstation reservations through their lifecycle.
#[derive(Parser, Debug)]
#[command(name = "coordinator")]
#[command(about = "Workstation coordinator - reservation control loop")]
#[command(version)]
pub struct Args {
    /// Path to configuration file (engines/hosts/templates/tags seed)
    #[arg(short, long, default_value = "/etc/workstation-coordinator/coordinator.yaml")]
    pub config: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    pub log_level: String,

    /// Seed the in-memory store with a demo engine/template/tag set
    /// instead of requiring a config file, for running the coordinator
    /// against nothing but a reachable engine adapter.
    #[arg(long)]
    pub dev: bool,
}
