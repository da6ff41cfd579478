//! Uniform client for talking to a hypervisor engine adapter over
//! JSON-RPC 2.0 / HTTP (spec §4.1), plus the convergence helper engine
//! adapters and coordinator workers both rely on.

pub mod client;
pub mod error;
pub mod types;
pub mod wait;
pub mod wire;

pub use client::{EngineClient, EngineRpcClient};
pub use error::{Error, Result};
pub use types::NetworkInfo;
pub use wait::wait_until_true;
