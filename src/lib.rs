//! # Weft (v0.4)
//!
//! Code-first workflow engine: describe a computation as a graph of tasks
//! composed into a flow, then execute it with controlled concurrency,
//! retries, timeouts, caching, dynamic fan-out, cancellation, and
//! well-defined failure semantics.
//!
//! ## Overview
//!
//! | Piece | Role |
//! |-------|------|
//! | [`task()`](task::task) | declare a unit of work with its execution policy |
//! | [`flow()`](flow::flow) | turn a build callback into a runnable [`Flow`] |
//! | [`fan_out()`](fanout::fan_out) | map a task over a sequence or a runtime-determined source |
//! | [`BuildContext`] | registry the build callback records invocations into |
//! | scheduler | concurrency-bounded loop with failure policies and dedup |
//!
//! Task calls inside a flow's build callback do not execute; they register
//! deferred invocations and return opaque placeholders. The scheduler runs
//! the graph in dependency order, then the returned structure is hydrated:
//! every placeholder replaced by its concrete result.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use serde_json::json;
//! use weft::{flow, task, ArgNode, Params, RunOptions};
//!
//! let add = task("add")
//!     .body_async(|args| async move {
//!         Ok(json!(args[0].as_i64().unwrap() + args[1].as_i64().unwrap()))
//!     })
//!     .build()?;
//!
//! let pipeline = flow("pipeline", move |cx, _params| {
//!     let total = add.call(cx, vec![ArgNode::from(1), ArgNode::from(2)]);
//!     total
//! });
//!
//! let out = pipeline.run(Params::new(), RunOptions::default()).await?;
//! assert_eq!(out, json!(3));
//! # Ok::<(), weft::WeftError>(())
//! ```
//!
//! ## Failure policies
//!
//! `fail_fast` cancels everything pending and propagates the first error;
//! `continue` records the error as the node's result and keeps going
//! (downstream nodes observe the error's rendering); `aggregate` collects
//! every failure and raises them together once scheduling completes.

pub mod arg;
pub mod artifacts;
pub mod build;
pub mod cache;
pub mod cli;
pub mod config;
pub mod context;
pub mod dag;
pub mod error;
pub mod events;
pub mod fanout;
pub mod flow;
pub mod isolated;
pub mod logging;
pub mod metrics;
pub mod middleware;
pub mod registry;
pub mod scheduler;
pub mod task;

pub use arg::{ArgNode, FanOutId, NodeId};
pub use artifacts::{artifact_store, set_artifact_store, ArtifactRef, ArtifactStore};
pub use build::{BuildContext, Invocation};
pub use cache::{
    result_cache, set_result_cache, FilesystemResultCache, MemoryResultCache, ResultCache,
};
pub use context::{current_run, Params, RunContext};
pub use dag::Dag;
pub use error::{AggregateTaskError, TaskError, TaskErrorKind, WeftError};
pub use fanout::{fan_out, FanOut, FanOutSource};
pub use flow::{flow, Flow, RunOptions};
pub use metrics::{metrics_provider, set_metrics_provider, InMemoryMetrics, MetricsProvider};
pub use registry::FlowRegistry;
pub use scheduler::FailurePolicy;
pub use task::{task, RunMode, Task, TaskBuilder};
pub use tokio_util::sync::CancellationToken;
