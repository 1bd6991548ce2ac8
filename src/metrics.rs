//! Metrics sink capability boundary (spec.md §4.3 step 3, §7).

use std::collections::HashMap;
use std::sync::Mutex;

/// Observations the bundling engine reports as bundles are promoted.
pub trait BundleMetrics: Send + Sync {
    fn observe_bundle_size(&self, datatype: &str, bytes: u64);
}

/// No-op sink for runs that don't care about metrics.
pub struct NullMetrics;

impl BundleMetrics for NullMetrics {
    fn observe_bundle_size(&self, _datatype: &str, _bytes: u64) {}
}

/// In-memory metrics double used by tests to assert on what the engine
/// reported without standing up a real metrics backend.
#[derive(Default)]
pub struct InMemoryMetrics {
    sizes: Mutex<HashMap<String, Vec<u64>>>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sizes_for(&self, datatype: &str) -> Vec<u64> {
        self.sizes
            .lock()
            .expect("metrics mutex poisoned")
            .get(datatype)
            .cloned()
            .unwrap_or_default()
    }
}

impl BundleMetrics for InMemoryMetrics {
    fn observe_bundle_size(&self, datatype: &str, bytes: u64) {
        self.sizes
            .lock()
            .expect("metrics mutex poisoned")
            .entry(datatype.to_string())
            .or_default()
            .push(bytes);
    }
}
