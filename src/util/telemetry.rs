//! Telemetry helpers for structured logging.
//!
//! The scheduler logs through `tracing`; the host application decides where
//! that output goes. Hosts with their own subscriber need nothing from here.

/// Install a default env-filtered fmt subscriber if none is set.
///
/// Safe to call more than once; later calls are no-ops.
pub fn init_tracing() {
    if tracing::dispatcher::has_been_set() {
        return;
    }
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}
