//! Error types for the hypervisor RPC abstraction layer.

use thiserror::Error;

/// Errors that can occur while talking to an engine adapter.
#[derive(Error, Debug)]
pub enum Error {
    /// The HTTP request itself failed (connection refused, DNS, TLS, ...).
    #[error("transport error calling engine: {0}")]
    Transport(String),

    /// The engine adapter returned a JSON-RPC error object.
    #[error("rpc error {code}: {message}")]
    Rpc {
        code: i64,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// A convergence wait (`wait_until_true`) exhausted its timeout.
    #[error("timed out waiting for condition: {0}")]
    Timeout(String),

    /// `create_vm` was called against a template the engine doesn't know about.
    #[error("unknown template: {0}")]
    UnknownTemplate(String),

    /// The response body didn't match the shape the caller expected.
    #[error("malformed response from engine: {0}")]
    Malformed(String),
}

pub type Result<T> = std::result::Result<T, Error>;
