//! Configuration for the engine adapter daemon.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

use crate::cli::Args;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub proxmox: ProxmoxConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            proxmox: ProxmoxConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a YAML file, falling back to defaults if the
    /// file doesn't exist (mirrors how `coordinator` treats a missing config
    /// file as "use defaults" rather than a hard error, since both binaries
    /// are meant to run out of the box against environment-variable config).
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Config =
            serde_yaml::from_str(&content).with_context(|| "failed to parse config file")?;
        Ok(config)
    }

    pub fn with_cli_overrides(mut self, args: &Args) -> Self {
        if let Some(ref listen) = args.listen {
            self.server.listen_address = listen.clone();
        }
        self
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_address: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0:5000".to_string(),
        }
    }
}

/// Proxmox connection settings, sourced from the environment per spec §6.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProxmoxConfig {
    pub host: String,
    pub user: String,
    pub password: String,
    pub verify_ssl: bool,
    pub primary_node: String,
}

impl Default for ProxmoxConfig {
    fn default() -> Self {
        Self {
            host: std::env::var("PROXMOX_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            user: std::env::var("PROXMOX_USER").unwrap_or_else(|_| "root@pam".to_string()),
            password: std::env::var("PROXMOX_PASSWORD")
                .unwrap_or_else(|_| "Qwerty123".to_string()),
            verify_ssl: std::env::var("PROXMOX_VERIFY_SSL")
                .map(|v| v != "False" && v != "false" && v != "0")
                .unwrap_or(true),
            primary_node: std::env::var("PROXMOX_PRIMARY_NODE")
                .unwrap_or_else(|_| "pve".to_string()),
        }
    }
}
