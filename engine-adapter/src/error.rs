//! Error types for the Proxmox-backed engine adapter.

use thiserror::Error;

/// Errors surfaced by the Proxmox driver before they're translated into a
/// JSON-RPC error object on the wire.
#[derive(Error, Debug)]
pub enum AdapterError {
    #[error("failed to reach Proxmox API: {0}")]
    ConnectionFailed(String),

    #[error("Proxmox API returned an error: {0}")]
    ApiError(String),

    #[error("VM not found: {0}")]
    VmNotFound(String),

    #[error("unknown template: {0}")]
    UnknownTemplate(String),

    #[error("timed out waiting for {0}")]
    Timeout(String),

    #[error("malformed Proxmox response: {0}")]
    Malformed(String),
}

impl AdapterError {
    /// JSON-RPC error code for this failure. Mirrors the convention that
    /// application errors live in the `-32000..-32099` "server error" band
    /// reserved by the JSON-RPC 2.0 spec.
    pub fn rpc_code(&self) -> i64 {
        match self {
            AdapterError::VmNotFound(_) => -32001,
            AdapterError::UnknownTemplate(_) => -32002,
            AdapterError::Timeout(_) => -32003,
            AdapterError::ConnectionFailed(_) => -32010,
            AdapterError::ApiError(_) => -32011,
            AdapterError::Malformed(_) => -32012,
        }
    }
}

pub type Result<T> = std::result::Result<T, AdapterError>;
