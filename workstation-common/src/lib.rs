//! Shared ambient helpers for the workstation coordinator workspace.

pub mod logging;

pub use logging::init_logging;
