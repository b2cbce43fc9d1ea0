//! Lightweight fire-and-forget event bus.
//!
//! Subscribers are global and shared across flow runs. Emission never affects
//! task outcomes: a panicking subscriber is contained and logged at debug.
//!
//! Engine events (payload fields are contract):
//! `flow_started`, `flow_completed`, `task_started`, `task_succeeded`,
//! `task_failed`, `task_retry`, `middleware_error`.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::debug;

type Subscriber = Arc<dyn Fn(&Value) + Send + Sync>;

static SUBSCRIBERS: Lazy<RwLock<HashMap<String, Vec<Subscriber>>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// Register a callback for one event name.
pub fn subscribe(event: &str, callback: impl Fn(&Value) + Send + Sync + 'static) {
    SUBSCRIBERS
        .write()
        .entry(event.to_string())
        .or_default()
        .push(Arc::new(callback));
}

/// Emit an event to every subscriber of `event`.
pub fn emit(event: &str, payload: Value) {
    let subscribers: Vec<Subscriber> = match SUBSCRIBERS.read().get(event) {
        Some(subs) => subs.clone(),
        None => return,
    };
    for callback in subscribers {
        if catch_unwind(AssertUnwindSafe(|| callback(&payload))).is_err() {
            debug!(event, "event subscriber panicked");
        }
    }
}

/// Drop every subscriber. Test support.
pub fn clear() {
    SUBSCRIBERS.write().clear();
}
