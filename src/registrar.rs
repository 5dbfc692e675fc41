//! Capture backend registry.
//!
//! Backends self-register at startup by name and priority; the map is
//! lazily allocated on first insert so registration tolerates running
//! before any other part of the crate is initialised. Selection prefers an
//! explicit user choice, then the saved setting, then the highest-priority
//! registered backend.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, OnceLock};

use anyhow::Result;

use crate::pipeline::CapturePipeline;

/// A source of raw PCM callbacks. Opening a backend starts its device
/// thread(s), which feed the pipeline through
/// [`CapturePipeline::add_mic`] and optionally
/// [`CapturePipeline::add_echo`].
pub trait CaptureBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Preference when no configured backend matches; higher wins.
    fn priority(&self) -> i32 {
        0
    }

    /// Start capturing into `pipeline`. The returned handle stops the
    /// device when dropped.
    fn open(&self, pipeline: Arc<CapturePipeline>) -> Result<Box<dyn CaptureStream>>;
}

/// Handle to a running capture device.
pub trait CaptureStream: Send {
    fn is_alive(&self) -> bool {
        true
    }
}

fn registry() -> &'static Mutex<BTreeMap<&'static str, Arc<dyn CaptureBackend>>> {
    static REGISTRY: OnceLock<Mutex<BTreeMap<&'static str, Arc<dyn CaptureBackend>>>> =
        OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(BTreeMap::new()))
}

/// Insert a backend, replacing any previous registration under the same name.
pub fn register(backend: Arc<dyn CaptureBackend>) {
    let name = backend.name();
    registry().lock().expect("registry mutex").insert(name, backend);
    log::info!("registrar: registered capture backend \"{name}\"");
}

pub fn unregister(name: &str) {
    registry().lock().expect("registry mutex").remove(name);
}

pub fn registered_names() -> Vec<&'static str> {
    registry().lock().expect("registry mutex").keys().copied().collect()
}

/// Pick a backend: explicit `choice` if registered, else the `saved`
/// setting if registered, else the highest-priority backend. `None` when
/// nothing is registered; the caller must abort capture in that case.
pub fn find(choice: Option<&str>, saved: &str) -> Option<Arc<dyn CaptureBackend>> {
    let map = registry().lock().expect("registry mutex");
    if let Some(choice) = choice.filter(|c| !c.is_empty()) {
        if let Some(backend) = map.get(choice) {
            return Some(backend.clone());
        }
    }
    if let Some(backend) = map.get(saved) {
        return Some(backend.clone());
    }
    map.values().max_by_key(|b| b.priority()).cloned()
}
