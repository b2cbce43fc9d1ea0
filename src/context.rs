//! Per-run identity and ambient data.

use std::sync::Arc;
use std::time::Instant;

use serde_json::{Map, Value};
use uuid::Uuid;

/// Caller-supplied run parameters (a JSON object).
pub type Params = Map<String, Value>;

/// Identity and parameters of one flow run.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: Uuid,
    pub flow_name: Arc<str>,
    pub start_time: Instant,
    pub params: Params,
}

impl RunContext {
    pub fn new(flow_name: &str, params: Params) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            flow_name: Arc::from(flow_name),
            start_time: Instant::now(),
            params,
        }
    }
}

tokio::task_local! {
    static CURRENT_RUN: Arc<RunContext>;
}

/// Run context of the task handle currently executing, if any.
///
/// Available inside task bodies and middleware; `None` outside a flow run
/// (immediate task execution has no run identity).
pub fn current_run() -> Option<Arc<RunContext>> {
    CURRENT_RUN.try_with(Arc::clone).ok()
}

/// Scope a future under a run context.
pub(crate) async fn with_run<F: std::future::Future>(ctx: Arc<RunContext>, fut: F) -> F::Output {
    CURRENT_RUN.scope(ctx, fut).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn run_ids_are_unique() {
        let a = RunContext::new("etl", Params::new());
        let b = RunContext::new("etl", Params::new());
        assert_ne!(a.run_id, b.run_id);
        assert_eq!(a.flow_name.as_ref(), "etl");
    }

    #[tokio::test]
    async fn current_run_is_scoped() {
        assert!(current_run().is_none());
        let mut params = Params::new();
        params.insert("region".into(), json!("eu"));
        let ctx = Arc::new(RunContext::new("etl", params));
        let inner = with_run(Arc::clone(&ctx), async {
            let seen = current_run().expect("inside scope");
            seen.params["region"].clone()
        })
        .await;
        assert_eq!(inner, json!("eu"));
        assert!(current_run().is_none());
    }
}
