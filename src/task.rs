//! Task definitions: an immutable description of one kind of work plus its
//! execution policy (retries, timeout, caching, run mode, persistence,
//! priority).
//!
//! A [`Task`] is a cheap clonable handle shared across flow runs. Called
//! inside a build context it registers a deferred invocation; called through
//! [`Task::execute`] it runs immediately, honoring every policy.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use futures::future::BoxFuture;
use rand::Rng;
use serde_json::{json, Value};
use tracing::Instrument;

use crate::arg::ArgNode;
use crate::artifacts;
use crate::build::BuildContext;
use crate::cache;
use crate::error::{TaskError, WeftError};
use crate::events;
use crate::isolated;
use crate::metrics;

// ============================================================================
// RUN MODE
// ============================================================================

/// Where a task body executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// On the scheduler's loop; for naturally non-blocking bodies.
    Inline,
    /// On the shared blocking worker pool; tolerates blocking I/O.
    OffloadBlocking,
    /// In an isolated worker process; the call record is serialized.
    OffloadIsolated,
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunMode::Inline => "inline",
            RunMode::OffloadBlocking => "offload_blocking",
            RunMode::OffloadIsolated => "offload_isolated",
        }
    }
}

// ============================================================================
// BODY & POLICY
// ============================================================================

type AsyncBody =
    Arc<dyn Fn(Vec<Value>) -> BoxFuture<'static, Result<Value, anyhow::Error>> + Send + Sync>;
type BlockingBody = Arc<dyn Fn(Vec<Value>) -> Result<Value, anyhow::Error> + Send + Sync>;

pub(crate) enum TaskBody {
    Async(AsyncBody),
    Blocking(BlockingBody),
    /// Name of a function in the isolated-worker registry.
    Isolated(String),
}

type CacheKeyFn = Arc<dyn Fn(&str, &[Value]) -> String + Send + Sync>;

pub(crate) struct TaskPolicy {
    pub retries: u32,
    pub retry_backoff: Duration,
    pub retry_jitter: Duration,
    pub timeout: Option<Duration>,
    pub cache_ttl: Option<Duration>,
    pub cache_key_fn: Option<CacheKeyFn>,
    pub persist: bool,
    pub priority: i32,
}

impl Default for TaskPolicy {
    fn default() -> Self {
        Self {
            retries: 0,
            retry_backoff: Duration::ZERO,
            retry_jitter: Duration::ZERO,
            timeout: None,
            cache_ttl: None,
            cache_key_fn: None,
            persist: false,
            priority: 0,
        }
    }
}

pub(crate) struct TaskDef {
    name: String,
    body: TaskBody,
    run_mode: RunMode,
    policy: TaskPolicy,
}

// ============================================================================
// TASK HANDLE
// ============================================================================

/// Shareable handle to an immutable task definition.
#[derive(Clone)]
pub struct Task {
    def: Arc<TaskDef>,
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.def.name)
            .field("run_mode", &self.def.run_mode)
            .finish()
    }
}

impl Task {
    pub fn name(&self) -> &str {
        &self.def.name
    }

    pub fn priority(&self) -> i32 {
        self.def.policy.priority
    }

    pub fn retries(&self) -> u32 {
        self.def.policy.retries
    }

    pub fn run_mode(&self) -> RunMode {
        self.def.run_mode
    }

    pub fn persist(&self) -> bool {
        self.def.policy.persist
    }

    pub fn cache_ttl(&self) -> Option<Duration> {
        self.def.policy.cache_ttl
    }

    /// Cache key for one concrete argument vector.
    pub fn cache_key(&self, args: &[Value]) -> String {
        match &self.def.policy.cache_key_fn {
            Some(f) => f(&self.def.name, args),
            None => cache::default_cache_key(&self.def.name, args),
        }
    }

    /// Register a deferred invocation inside an active build context and
    /// return its placeholder.
    pub fn call(&self, cx: &mut BuildContext, args: Vec<ArgNode>) -> ArgNode {
        cx.register(self.clone(), args)
    }

    /// Execute immediately, outside any flow build, honoring every policy.
    /// Returns the concrete value, or the artifact reference when the task
    /// persists its result.
    pub async fn execute(&self, args: Vec<Value>) -> Result<Value, WeftError> {
        let span = tracing::info_span!("task", task = %self.def.name);
        let def = Arc::clone(&self.def);
        async move {
            if let Some(ttl) = def.policy.cache_ttl {
                let key = self.cache_key(&args);
                let store = cache::result_cache();
                if let Some(hit) = store.get(&key, ttl) {
                    metrics::metrics_provider().inc("cache_hits", 1.0);
                    return Ok(hit);
                }
                let value = def.run_attempts(args).await.map_err(WeftError::Task)?;
                let value = def.maybe_persist(value);
                store.set(&key, value.clone());
                metrics::metrics_provider().inc("cache_sets", 1.0);
                Ok(value)
            } else {
                let value = def.run_attempts(args).await.map_err(WeftError::Task)?;
                Ok(def.maybe_persist(value))
            }
        }
        .instrument(span)
        .await
    }

    pub(crate) fn def(&self) -> &Arc<TaskDef> {
        &self.def
    }
}

impl TaskDef {
    /// Full attempt loop: per-attempt timeout, exponential backoff with
    /// jitter between attempts, `task_retry` events.
    pub(crate) async fn run_attempts(&self, args: Vec<Value>) -> Result<Value, TaskError> {
        let mut attempt: u32 = 0;
        loop {
            match self.attempt_once(&args).await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if attempt < self.policy.retries {
                        attempt += 1;
                        events::emit(
                            "task_retry",
                            json!({
                                "task": self.name,
                                "attempt": attempt,
                                "max": self.policy.retries,
                            }),
                        );
                        let delay = self.retry_delay(attempt);
                        if delay > Duration::ZERO {
                            tokio::time::sleep(delay).await;
                        }
                        continue;
                    }
                    // A timeout keeps its own kind; other errors become
                    // RetryExhausted once retries were actually configured.
                    if err.is_timeout() || self.policy.retries == 0 {
                        return Err(err);
                    }
                    return Err(TaskError::retry_exhausted(&self.name, err.cause));
                }
            }
        }
    }

    fn retry_delay(&self, attempt: u32) -> Duration {
        let backoff =
            self.policy.retry_backoff.as_secs_f64() * 2f64.powi(attempt as i32 - 1);
        let jitter = self.policy.retry_jitter.as_secs_f64();
        let jitter = if jitter > 0.0 {
            rand::thread_rng().gen_range(0.0..jitter)
        } else {
            0.0
        };
        Duration::from_secs_f64(backoff + jitter)
    }

    async fn attempt_once(&self, args: &[Value]) -> Result<Value, TaskError> {
        let fut = self.dispatch(args.to_vec());
        let outcome = match self.policy.timeout {
            Some(limit) => match tokio::time::timeout(limit, fut).await {
                Ok(result) => result,
                Err(_) => {
                    return Err(TaskError::timeout(
                        &self.name,
                        format!("timed out after {:.3}s", limit.as_secs_f64()),
                    ))
                }
            },
            None => fut.await,
        };
        outcome.map_err(|e| TaskError::execution(&self.name, e.to_string()))
    }

    async fn dispatch(&self, args: Vec<Value>) -> Result<Value, anyhow::Error> {
        match (&self.body, self.run_mode) {
            (TaskBody::Async(f), _) => f(args).await,
            (TaskBody::Blocking(f), RunMode::Inline) => f(args),
            (TaskBody::Blocking(f), _) => {
                let f = Arc::clone(f);
                tokio::task::spawn_blocking(move || f(args))
                    .await
                    .map_err(|e| anyhow!("blocking task panicked: {}", e))?
            }
            (TaskBody::Isolated(function), _) => isolated::call(function, args)
                .await
                .map_err(|cause| anyhow!(cause)),
        }
    }

    pub(crate) fn maybe_persist(&self, value: Value) -> Value {
        if self.policy.persist {
            artifacts::artifact_store().put(value).to_value()
        } else {
            value
        }
    }
}

// ============================================================================
// BUILDER
// ============================================================================

/// Start declaring a task.
pub fn task(name: &str) -> TaskBuilder {
    TaskBuilder::new(name)
}

pub struct TaskBuilder {
    name: String,
    run_mode: Option<RunMode>,
    policy: TaskPolicy,
    body: Option<TaskBody>,
}

impl TaskBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            run_mode: None,
            policy: TaskPolicy::default(),
            body: None,
        }
    }

    /// Non-blocking body; inferred run mode is `Inline`.
    pub fn body_async<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, anyhow::Error>> + Send + 'static,
    {
        self.body = Some(TaskBody::Async(Arc::new(move |args| Box::pin(f(args)))));
        self
    }

    /// Blocking body; inferred run mode is `OffloadBlocking`.
    pub fn body_blocking<F>(mut self, f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Result<Value, anyhow::Error> + Send + Sync + 'static,
    {
        self.body = Some(TaskBody::Blocking(Arc::new(f)));
        self
    }

    /// Body registered in the isolated-worker registry; run mode is
    /// `OffloadIsolated`. The call record must serialize, so the body is
    /// referenced by name rather than captured.
    pub fn body_isolated(mut self, function: &str) -> Self {
        self.body = Some(TaskBody::Isolated(function.to_string()));
        self
    }

    /// Explicit run-mode override.
    pub fn run_in(mut self, mode: RunMode) -> Self {
        self.run_mode = Some(mode);
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.policy.retries = retries;
        self
    }

    pub fn retry_backoff(mut self, backoff: Duration) -> Self {
        self.policy.retry_backoff = backoff;
        self
    }

    pub fn retry_jitter(mut self, jitter: Duration) -> Self {
        self.policy.retry_jitter = jitter;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.policy.timeout = Some(timeout);
        self
    }

    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.policy.cache_ttl = Some(ttl);
        self
    }

    pub fn cache_key_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(&str, &[Value]) -> String + Send + Sync + 'static,
    {
        self.policy.cache_key_fn = Some(Arc::new(f));
        self
    }

    pub fn persist(mut self, persist: bool) -> Self {
        self.policy.persist = persist;
        self
    }

    /// Higher runs earlier among nodes ready at the same instant.
    pub fn priority(mut self, priority: i32) -> Self {
        self.policy.priority = priority;
        self
    }

    pub fn build(self) -> Result<Task, WeftError> {
        let body = self
            .body
            .ok_or_else(|| WeftError::Build(format!("task '{}' has no body", self.name)))?;
        if let Some(t) = self.policy.timeout {
            if t.is_zero() {
                return Err(WeftError::Build(format!(
                    "task '{}': timeout must be positive",
                    self.name
                )));
            }
        }
        if let Some(t) = self.policy.cache_ttl {
            if t.is_zero() {
                return Err(WeftError::Build(format!(
                    "task '{}': cache_ttl must be positive",
                    self.name
                )));
            }
        }
        let inferred = match &body {
            TaskBody::Async(_) => RunMode::Inline,
            TaskBody::Blocking(_) => RunMode::OffloadBlocking,
            TaskBody::Isolated(_) => RunMode::OffloadIsolated,
        };
        let run_mode = self.run_mode.unwrap_or(inferred);
        match (&body, run_mode) {
            (TaskBody::Isolated(_), mode) if mode != RunMode::OffloadIsolated => {
                return Err(WeftError::Build(format!(
                    "task '{}': an isolated body only runs in offload_isolated mode",
                    self.name
                )));
            }
            (body, RunMode::OffloadIsolated) if !matches!(body, TaskBody::Isolated(_)) => {
                return Err(WeftError::Build(format!(
                    "task '{}': offload_isolated requires a registered isolated body",
                    self.name
                )));
            }
            _ => {}
        }
        Ok(Task {
            def: Arc::new(TaskDef {
                name: self.name,
                body,
                run_mode,
                policy: self.policy,
            }),
        })
    }
}
