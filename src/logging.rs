//! Diagnostic output.
//!
//! Nothing is installed unless diagnostics are enabled, in which case every
//! event of this crate goes to stderr. `RUST_LOG` overrides the default
//! `socksify=debug` filter.
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "socksify=debug";

/// Install the stderr subscriber when `enabled`.
///
/// A subscriber that is already installed is left in place.
pub fn init(enabled: bool) {
  if !enabled {
    return;
  }
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
  let _ = tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(std::io::stderr)
    .with_ansi(false)
    .without_time()
    .try_init();
}
