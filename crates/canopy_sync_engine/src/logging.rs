//! Logging switch.

use tracing_subscriber::EnvFilter;

/// Default filter directive when `RUST_LOG` is unset.
pub const DEFAULT_DIRECTIVE: &str = "canopy=debug";

/// Turns engine logging on or off.
///
/// Enabling installs a global `fmt` subscriber filtered by `RUST_LOG`, or
/// by [`DEFAULT_DIRECTIVE`] when that is unset. Only the first successful
/// call installs a subscriber; later calls are harmless. Disabling leaves
/// an installed subscriber in place, since a global subscriber cannot be
/// removed, and returns false.
pub fn enable_logging(enabled: bool) -> bool {
    if !enabled {
        return false;
    }
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVE));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .is_ok()
}
