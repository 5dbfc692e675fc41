//! Capture backend implementations.

pub mod alsa;

use std::sync::Arc;

use crate::registrar;

/// Register the built-in backends. Call once before selecting a backend;
/// explicit registration avoids any dependence on initialisation order.
pub fn register_builtin() {
    registrar::register(Arc::new(alsa::AlsaCaptureBackend::default()));
}
