//! Structured logging configuration.

use llm_dispatch_core::{Error, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_FILTER: &str = "info,llm_dispatch=debug";

/// Install the global subscriber: `RUST_LOG`-driven filter plus a stdout
/// formatting layer, JSON-encoded when `json` is set.
pub fn configure_tracing(json: bool) -> Result<()> {
    // Basic EnvFilter
    let env_filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| DEFAULT_FILTER.into()),
    );

    let registry = tracing_subscriber::registry().with(env_filter);

    let installed = if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_current_span(false))
            .try_init()
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()
    };

    installed.map_err(|e| Error::internal(format!("Failed to install tracing subscriber: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_install_is_reported() {
        // The first call installs a subscriber; later calls must fail cleanly.
        let _ = configure_tracing(false);
        assert!(configure_tracing(true).is_err());
    }
}
