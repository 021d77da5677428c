//! sniproxy/src/logging.rs
//! Logging initialization and runtime updates (SPEC_FULL.md §6.I).

use std::sync::{Mutex, Once, OnceLock};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{filter::EnvFilter, fmt, reload::Handle as ReloadHandle, reload::Layer as ReloadLayer};

static LOG_INIT: Once = Once::new();
static RELOAD_HANDLE: OnceLock<Mutex<ReloadHandle<EnvFilter, tracing_subscriber::Registry>>> =
    OnceLock::new();

/// Initializes the global `tracing` subscriber exactly once. `default` is an
/// `EnvFilter` directive string (e.g. `"info"` or `"sniproxy=debug,warn"`).
pub fn init_logging(default: &str) {
    LOG_INIT.call_once(|| {
        let filter = EnvFilter::new(default);
        let (reload_layer, handle) = ReloadLayer::new(filter);
        let subscriber = tracing_subscriber::registry()
            .with(reload_layer)
            .with(fmt::layer());
        tracing::subscriber::set_global_default(subscriber).unwrap();
        let _ = RELOAD_HANDLE.set(Mutex::new(handle));
    });
}

/// Updates the active filter directive at runtime, e.g. in response to an
/// operator-triggered reload signal. No-op if logging was never
/// initialized.
pub fn set_log_level(directive: &str) -> bool {
    match RELOAD_HANDLE.get() {
        Some(handle) => handle
            .lock()
            .unwrap()
            .reload(EnvFilter::new(directive))
            .is_ok(),
        None => false,
    }
}
