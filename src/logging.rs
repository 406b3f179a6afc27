//! Log output setup.
//!
//! The crate logs through `tracing`. Binaries and tests that want to see the
//! output call [`init_tracing`], which installs a `fmt` subscriber filtered by
//! the `GRIDWEAVE_LOG` environment variable (for example
//! `GRIDWEAVE_LOG=gridweave=debug`). Without it, `info` and above are shown.

use tracing_subscriber::EnvFilter;

/// Environment variable holding the log filter.
pub const LOG_ENV: &str = "GRIDWEAVE_LOG";

/// Installs the global subscriber. Later calls, or calls after another
/// subscriber was installed, do nothing.
pub fn init_tracing() {
  let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
  let _ = tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_target(true)
    .try_init();
}
