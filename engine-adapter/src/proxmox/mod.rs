//! Proxmox VE driver: a thin REST client (`api`) plus the engine logic
//! layer (`engine`) that adapts it to the hypervisor RPC surface.

pub mod api;
pub mod engine;

pub use api::ProxmoxApi;
pub use engine::ProxmoxEngine;
