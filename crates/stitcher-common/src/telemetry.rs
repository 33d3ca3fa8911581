//! Structured logging setup for stitcher binaries and tests.

use tracing_subscriber::EnvFilter;

/// Default directive when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "stitcher=debug,info";

/// Install a global fmt subscriber. `RUST_LOG` wins over `default_filter`.
///
/// Safe to call more than once: later calls are ignored, so every test can
/// call it without coordinating.
pub fn init_logging(default_filter: &str) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_target(true)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_twice_is_harmless() {
        init_logging(DEFAULT_FILTER);
        init_logging("warn");
        tracing::info!(target: "stitcher", "logging initialised");
    }
}
