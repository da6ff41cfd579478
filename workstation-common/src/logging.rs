//! Structured logging setup shared by every binary in the workspace.

use anyhow::Result;
use tracing_subscriber::{
    fmt::{self, time::ChronoLocal},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Initialize console logging for a binary.
///
/// `level` is used only when `RUST_LOG` is unset, so operators can always
/// override verbosity per-module without touching the config file.
pub fn init_logging(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_timer(ChronoLocal::new("%Y-%m-%d %H:%M:%S%.3f".to_string())),
        )
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_logging_accepts_standard_levels() {
        // init_logging installs a process-global subscriber, so we only
        // exercise the filter-construction path here rather than calling it.
        let filter = EnvFilter::new("info");
        assert_eq!(filter.to_string(), "info");
    }
}
