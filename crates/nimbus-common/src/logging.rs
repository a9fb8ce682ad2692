//! Process-wide logging sink.
//!
//! All components log through `tracing` macros; this module owns the
//! single subscriber installation so embedders control where output goes.

use crate::error::{NimbusError, Result};
use tracing_subscriber::{fmt, EnvFilter};

/// Installs the process-wide logging sink with the given filter directive
/// (e.g. `"info"` or `"nimbus_cache=debug"`).
///
/// Returns an error if the directive is invalid or a sink is already
/// installed.
pub fn init_logging(filter: &str) -> Result<()> {
    fmt()
        .with_env_filter(
            EnvFilter::try_new(filter)
                .map_err(|e| NimbusError::Config(format!("invalid log filter: {e}")))?,
        )
        .with_target(true)
        .with_thread_ids(true)
        .try_init()
        .map_err(|_| NimbusError::Config("logging already initialized".into()))
}

/// Installs a logging sink suitable for tests; repeated calls are no-ops.
pub fn init_test_logging() {
    let _ = fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
