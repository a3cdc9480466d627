//! Tracing setup for embedding applications and tests.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global subscriber: `RUST_LOG` if set, `info` otherwise.
///
/// Safe to call more than once; later calls are no-ops.
pub fn init() {
    init_with_default("info");
}

/// Like [`init`] with a different fallback filter
pub fn init_with_default(default_filter: &str) {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        init();
        init_with_default("debug");
        tracing::info!("still logging");
    }
}
