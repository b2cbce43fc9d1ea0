//! Pluggable metrics provider.
//!
//! Counter names are contract: `tasks_succeeded`, `tasks_failed`,
//! `cache_hits`, `cache_sets`, `dedup_joins`. Histogram: `task_duration_ms`.

use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};

pub trait MetricsProvider: Send + Sync {
    fn inc(&self, name: &str, value: f64);
    fn observe(&self, name: &str, value: f64);
}

/// Default provider: counters and raw histogram samples in memory.
#[derive(Default)]
pub struct InMemoryMetrics {
    counters: Mutex<HashMap<String, f64>>,
    histograms: Mutex<HashMap<String, Vec<f64>>>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter(&self, name: &str) -> f64 {
        self.counters.lock().get(name).copied().unwrap_or(0.0)
    }

    pub fn samples(&self, name: &str) -> Vec<f64> {
        self.histograms.lock().get(name).cloned().unwrap_or_default()
    }
}

impl MetricsProvider for InMemoryMetrics {
    fn inc(&self, name: &str, value: f64) {
        *self.counters.lock().entry(name.to_string()).or_insert(0.0) += value;
    }

    fn observe(&self, name: &str, value: f64) {
        self.histograms
            .lock()
            .entry(name.to_string())
            .or_default()
            .push(value);
    }
}

static PROVIDER: Lazy<RwLock<Arc<dyn MetricsProvider>>> =
    Lazy::new(|| RwLock::new(Arc::new(InMemoryMetrics::new())));

/// Swap the global provider (shared across flow runs).
pub fn set_metrics_provider(provider: Arc<dyn MetricsProvider>) {
    *PROVIDER.write() = provider;
}

pub fn metrics_provider() -> Arc<dyn MetricsProvider> {
    Arc::clone(&PROVIDER.read())
}
