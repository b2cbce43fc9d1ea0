//! Middleware chain around task bodies.
//!
//! Middlewares wrap each task body as an onion: the middleware registered
//! first is outermost, the task body (with its retry loop) is the core.
//!
//! Error isolation: a middleware that fails *before* invoking `next` is
//! skipped for that task — the engine emits a `middleware_error` event and
//! continues with the remainder of the chain. A failure *during or after*
//! `next` propagates as a task-body error, so observability plugins cannot
//! mask real failures.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use serde_json::{json, Value};

use crate::events;
use crate::task::Task;

pub type MiddlewareFuture<'a> = BoxFuture<'a, Result<Value, anyhow::Error>>;

/// Continuation handed to a middleware. Calling it runs the rest of the
/// chain, innermost being the task body.
pub type Next<'a> = Box<dyn FnOnce() -> MiddlewareFuture<'a> + Send + 'a>;

/// An async wrapper of shape `(next, task, args) -> value`.
pub type Middleware =
    Arc<dyn for<'a> Fn(Next<'a>, &'a Task, &'a [Value]) -> MiddlewareFuture<'a> + Send + Sync>;

/// Core body callable. Re-invocable so a skipped middleware can be routed
/// around; the scheduler guarantees the body itself runs at most once per
/// chain traversal.
pub(crate) type CoreFn =
    Arc<dyn Fn() -> BoxFuture<'static, Result<Value, anyhow::Error>> + Send + Sync>;

static REGISTRY: Lazy<RwLock<Vec<Middleware>>> = Lazy::new(|| RwLock::new(Vec::new()));

/// Append a middleware to the global chain.
pub fn register<F>(middleware: F)
where
    F: for<'a> Fn(Next<'a>, &'a Task, &'a [Value]) -> MiddlewareFuture<'a>
        + Send
        + Sync
        + 'static,
{
    REGISTRY.write().push(Arc::new(middleware));
}

/// Drop every registered middleware. Test support.
pub fn clear() {
    REGISTRY.write().clear();
}

/// Number of middlewares currently registered.
pub fn registered_count() -> usize {
    REGISTRY.read().len()
}

fn snapshot() -> Vec<Middleware> {
    REGISTRY.read().clone()
}

/// Run the registered chain around `core` for one task execution.
pub(crate) async fn run_chain(
    task: &Task,
    args: &[Value],
    core: CoreFn,
) -> Result<Value, anyhow::Error> {
    let chain = snapshot();
    run_chain_with(&chain, task, args, core).await
}

/// Run an explicit chain; the global registry is not consulted.
pub(crate) async fn run_chain_with(
    chain: &[Middleware],
    task: &Task,
    args: &[Value],
    core: CoreFn,
) -> Result<Value, anyhow::Error> {
    call_at(0, chain, task, args, &core).await
}

fn call_at<'a>(
    index: usize,
    chain: &'a [Middleware],
    task: &'a Task,
    args: &'a [Value],
    core: &'a CoreFn,
) -> MiddlewareFuture<'a> {
    Box::pin(async move {
        if index >= chain.len() {
            return core().await;
        }
        let entered_core = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&entered_core);
        let next: Next<'a> = Box::new(move || {
            flag.store(true, Ordering::SeqCst);
            call_at(index + 1, chain, task, args, core)
        });
        match (chain[index])(next, task, args).await {
            Ok(value) => Ok(value),
            Err(err) if !entered_core.load(Ordering::SeqCst) => {
                events::emit(
                    "middleware_error",
                    json!({
                        "task": task.name(),
                        "middleware_index": index,
                        "error": err.to_string(),
                    }),
                );
                call_at(index + 1, chain, task, args, core).await
            }
            Err(err) => Err(err),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::task;
    use anyhow::anyhow;
    use serial_test::serial;
    use std::sync::atomic::AtomicUsize;

    static ORDER: Lazy<parking_lot::Mutex<Vec<&'static str>>> =
        Lazy::new(|| parking_lot::Mutex::new(Vec::new()));

    fn outer<'a>(next: Next<'a>, _task: &'a Task, _args: &'a [Value]) -> MiddlewareFuture<'a> {
        Box::pin(async move {
            ORDER.lock().push("outer:before");
            let value = next().await?;
            ORDER.lock().push("outer:after");
            Ok(value)
        })
    }

    fn inner<'a>(next: Next<'a>, _task: &'a Task, _args: &'a [Value]) -> MiddlewareFuture<'a> {
        Box::pin(async move {
            ORDER.lock().push("inner:before");
            let value = next().await?;
            ORDER.lock().push("inner:after");
            Ok(value)
        })
    }

    fn broken_before<'a>(
        _next: Next<'a>,
        _task: &'a Task,
        _args: &'a [Value],
    ) -> MiddlewareFuture<'a> {
        Box::pin(async move { Err(anyhow!("exploded before next")) })
    }

    fn broken_after<'a>(
        next: Next<'a>,
        _task: &'a Task,
        _args: &'a [Value],
    ) -> MiddlewareFuture<'a> {
        Box::pin(async move {
            let _ = next().await?;
            Err(anyhow!("exploded after next"))
        })
    }

    fn counting_core(counter: &Arc<AtomicUsize>) -> CoreFn {
        let counter = Arc::clone(counter);
        Arc::new(move || {
            let counter = Arc::clone(&counter);
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(json!("done"))
            })
        })
    }

    fn sample_task() -> Task {
        task("sample")
            .body_async(|_| async { Ok(json!(null)) })
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn chain_wraps_like_an_onion() {
        ORDER.lock().clear();
        let chain: Vec<Middleware> = vec![Arc::new(outer), Arc::new(inner)];
        let runs = Arc::new(AtomicUsize::new(0));

        let t = sample_task();
        let out = run_chain_with(&chain, &t, &[], counting_core(&runs))
            .await
            .unwrap();
        assert_eq!(out, json!("done"));
        assert_eq!(
            *ORDER.lock(),
            vec!["outer:before", "inner:before", "inner:after", "outer:after"]
        );
    }

    #[tokio::test]
    #[serial]
    async fn pre_next_failure_is_skipped_and_reported() {
        events::clear();
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        events::subscribe("middleware_error", move |p| {
            sink.lock().push(p.clone());
        });

        let chain: Vec<Middleware> = vec![Arc::new(broken_before)];
        let runs = Arc::new(AtomicUsize::new(0));
        let t = sample_task();
        let out = run_chain_with(&chain, &t, &[], counting_core(&runs))
            .await
            .unwrap();
        assert_eq!(out, json!("done"));
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        let captured = seen.lock().clone();
        assert_eq!(captured.len(), 1);
        assert_eq!(captured[0]["task"], "sample");
        assert_eq!(captured[0]["middleware_index"], 0);
        events::clear();
    }

    #[tokio::test]
    async fn post_next_failure_propagates() {
        let chain: Vec<Middleware> = vec![Arc::new(broken_after)];
        let runs = Arc::new(AtomicUsize::new(0));
        let t = sample_task();
        let err = run_chain_with(&chain, &t, &[], counting_core(&runs))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("after next"));
        // The body ran exactly once even though the wrapper failed.
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn skipped_middleware_does_not_unwind_the_rest() {
        ORDER.lock().clear();
        let chain: Vec<Middleware> = vec![Arc::new(broken_before), Arc::new(inner)];
        let runs = Arc::new(AtomicUsize::new(0));
        let t = sample_task();
        let out = run_chain_with(&chain, &t, &[], counting_core(&runs))
            .await
            .unwrap();
        assert_eq!(out, json!("done"));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(*ORDER.lock(), vec!["inner:before", "inner:after"]);
    }

    #[tokio::test]
    async fn empty_chain_runs_the_body_directly() {
        let runs = Arc::new(AtomicUsize::new(0));
        let t = sample_task();
        let out = run_chain_with(&[], &t, &[], counting_core(&runs))
            .await
            .unwrap();
        assert_eq!(out, json!("done"));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    #[serial]
    fn registry_register_and_clear() {
        clear();
        assert_eq!(registered_count(), 0);
        register(outer);
        assert_eq!(registered_count(), 1);
        clear();
        assert_eq!(registered_count(), 0);
    }
}
