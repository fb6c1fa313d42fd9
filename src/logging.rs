//! overpass/src/logging.rs
//! Logging initialization and runtime updates.

use crate::state::RELOAD_HANDLE;
use std::sync::Once;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{filter::EnvFilter, fmt, reload::Layer as ReloadLayer};

static LOG_INIT: Once = Once::new();

// Initialize logging once. A subscriber installed by the host wins.
pub fn init_logging(default: &str) {
    LOG_INIT.call_once(|| {
        let filter = EnvFilter::new(default);
        let (reload_layer, handle) = ReloadLayer::new(filter);
        let subscriber = tracing_subscriber::registry()
            .with(reload_layer)
            .with(fmt::layer());
        if tracing::subscriber::set_global_default(subscriber).is_ok() {
            *RELOAD_HANDLE.lock().unwrap() = Some(handle);
        }
    });
}

/// Swaps the active filter. Returns false if logging was never initialized here.
pub fn set_log_level(level: &str) -> bool {
    match RELOAD_HANDLE.lock().unwrap().as_ref() {
        Some(handle) => handle.reload(EnvFilter::new(level)).is_ok(),
        None => false,
    }
}
