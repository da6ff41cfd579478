//! Error types for the coordinator's control loop and handlers (spec §7).

use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum Error {
    #[error("no engine has capacity for this reservation")]
    Capacity,

    #[error("no template matches the requested tags")]
    TemplateNotFound,

    #[error("reservation window must be at least 15 minutes")]
    WindowTooShort,

    #[error("reservation {0} is in an inconsistent state")]
    Anomaly(Uuid),

    #[error("hypervisor call failed: {0}")]
    Hypervisor(#[from] hypervisor_rpc::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
