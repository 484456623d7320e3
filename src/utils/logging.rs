//! Tracing setup.
//!
//! The library only emits `tracing` events; embedding applications and tests
//! install a subscriber with [`init_tracing`]. The filter comes from
//! `RUST_LOG`, defaulting to `info`.

use tracing_subscriber::EnvFilter;

/// Install a global fmt subscriber. Calling it more than once is harmless.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

/// Like [`init_tracing`] but writes through the test harness capture
pub fn init_test_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}
