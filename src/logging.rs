//! Logging setup for the CLI.
//!
//! - Writes to stderr, keeping stdout for plans and JSON
//! - Configurable via the RUST_LOG environment variable (default `info`)
//! - `--verbose` raises the default to `debug`

use std::io;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Default filter directive when RUST_LOG is unset.
pub fn default_directive(verbose: bool) -> &'static str {
    if verbose {
        "responsive_images=debug,info"
    } else {
        "info"
    }
}

/// Install the global subscriber. Later calls are ignored.
pub fn init_logging(verbose: bool) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbose)));

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(io::stderr)
        .with_target(false);

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_layer)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbose_raises_crate_level() {
        assert_eq!(default_directive(false), "info");
        assert!(default_directive(true).contains("responsive_images=debug"));
    }

    #[test]
    fn init_twice_is_harmless() {
        init_logging(false);
        init_logging(true);
    }
}
