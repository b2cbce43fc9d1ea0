//! Structured logging: subscriber setup and the per-task log middleware.

use std::time::Instant;

use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;

use crate::config;
use crate::context;
use crate::middleware::{self, MiddlewareFuture, Next};
use crate::task::Task;

/// Initialize the global tracing subscriber.
///
/// `RUST_LOG` wins when set; otherwise the `LOG_LEVEL` environment variable
/// (default `info`). Safe to call more than once.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config::config().log_level.clone()));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Register the structured task-log middleware unless
/// `DISABLE_STRUCTURED_LOGS` is truthy.
pub fn register_structured_logging() {
    if config::config().disable_structured_logs {
        return;
    }
    middleware::register(structured_logging_middleware);
}

/// One JSON line per task execution, carrying run identity and duration.
fn structured_logging_middleware<'a>(
    next: Next<'a>,
    task: &'a Task,
    _args: &'a [Value],
) -> MiddlewareFuture<'a> {
    Box::pin(async move {
        let run = context::current_run();
        let started = Instant::now();
        let mut meta = json!({
            "task": task.name(),
            "run_id": run.as_ref().map(|r| r.run_id.to_string()),
            "flow": run.as_ref().map(|r| r.flow_name.to_string()),
        });
        match next().await {
            Ok(value) => {
                meta["event"] = json!("task_ok");
                meta["duration_ms"] = json!(started.elapsed().as_secs_f64() * 1000.0);
                tracing::info!(target: "weft::tasks", "{}", meta);
                Ok(value)
            }
            Err(err) => {
                meta["event"] = json!("task_err");
                meta["duration_ms"] = json!(started.elapsed().as_secs_f64() * 1000.0);
                meta["error"] = json!(err.to_string());
                tracing::error!(target: "weft::tasks", "{}", meta);
                Err(err)
            }
        }
    })
}
