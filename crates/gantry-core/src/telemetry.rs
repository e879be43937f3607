//! Tracing initialisation for Gantry binaries.

use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Initialise the global tracing subscriber.
///
/// Verbose mode lowers the default level to DEBUG; `RUST_LOG` overrides
/// either default when set. With `json` the subscriber emits
/// newline-delimited JSON lines so pipeline logs can themselves be
/// aggregated. Safe to call more than once; only the first call per
/// process takes effect.
pub fn init_tracing(json: bool, verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);
    if json {
        builder.json().try_init().ok();
    } else {
        builder.try_init().ok();
    }
}
