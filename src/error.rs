//! Error taxonomy for the workflow engine.
//!
//! Two layers:
//!
//! - [`TaskError`] is the per-node failure value. It is `Clone` because the
//!   scheduler stores it as a node result (failure policies `continue` and
//!   `aggregate` keep running after a failure) and because in-flight
//!   deduplication fans a single failure out to every waiter. The original
//!   cause is flattened to a string so it can cross worker-process boundaries.
//! - [`WeftError`] is what a flow run surfaces to the caller.

use std::fmt;

use thiserror::Error;

/// What kind of failure a [`TaskError`] carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskErrorKind {
    /// The task body returned an error (retries, if any, already consumed
    /// on a zero-retry task).
    Execution,
    /// The body did not complete within its per-attempt timeout.
    Timeout,
    /// Retries were configured and all attempts failed.
    RetryExhausted,
    /// An upstream node failed and the active failure policy does not
    /// substitute failures downstream.
    UpstreamFailed,
    /// A dynamic fan-out source did not materialize an array.
    FanOut,
}

/// A failure recorded against a single node.
///
/// The rendering starts with the task name so that a failure substituted into
/// a downstream argument (failure policy `continue`) is attributable at a
/// glance.
#[derive(Debug, Clone, Error)]
#[error("{task}: {cause}")]
pub struct TaskError {
    /// Name of the task definition (not the node id).
    pub task: String,
    pub kind: TaskErrorKind,
    /// Stringified cause. Final cause for `RetryExhausted`.
    pub cause: String,
}

impl TaskError {
    pub fn execution(task: impl Into<String>, cause: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            kind: TaskErrorKind::Execution,
            cause: cause.into(),
        }
    }

    pub fn timeout(task: impl Into<String>, cause: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            kind: TaskErrorKind::Timeout,
            cause: cause.into(),
        }
    }

    pub fn retry_exhausted(task: impl Into<String>, cause: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            kind: TaskErrorKind::RetryExhausted,
            cause: cause.into(),
        }
    }

    pub fn upstream_failed(task: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            kind: TaskErrorKind::UpstreamFailed,
            cause: "upstream failed".to_string(),
        }
    }

    pub fn fan_out(task: impl Into<String>, cause: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            kind: TaskErrorKind::FanOut,
            cause: cause.into(),
        }
    }

    pub fn is_timeout(&self) -> bool {
        self.kind == TaskErrorKind::Timeout
    }
}

/// Raised under the `aggregate` failure policy once scheduling completes.
#[derive(Debug, Clone)]
pub struct AggregateTaskError {
    pub errors: Vec<TaskError>,
}

impl fmt::Display for AggregateTaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let summary: Vec<String> = self.errors.iter().take(5).map(|e| e.to_string()).collect();
        write!(f, "multiple task failures: {}", summary.join("; "))?;
        if self.errors.len() > 5 {
            write!(f, " (+{} more)", self.errors.len() - 5)?;
        }
        Ok(())
    }
}

impl std::error::Error for AggregateTaskError {}

/// Top-level error type for flow runs and the CLI.
#[derive(Debug, Error)]
pub enum WeftError {
    /// The graph has no valid topological order. Carries every node id that
    /// still had incoming edges when the sort stalled.
    #[error("cycle detected in graph: {}", .ids.join(", "))]
    Cycle { ids: Vec<String> },

    /// A node failed and the failure policy propagates it.
    #[error(transparent)]
    Task(#[from] TaskError),

    /// One or more nodes failed under the `aggregate` policy.
    #[error(transparent)]
    Aggregate(#[from] AggregateTaskError),

    /// The run was cancelled via its cancellation token.
    #[error("flow run cancelled")]
    Cancelled,

    /// The flow build callback produced an unusable graph.
    #[error("flow build error: {0}")]
    Build(String),

    /// Invalid caller input (CLI arguments, params).
    #[error("invalid argument: {0}")]
    Validation(String),
}

impl WeftError {
    /// Exit code for the CLI: validation problems are distinguishable from
    /// runtime failures.
    pub fn exit_code(&self) -> i32 {
        match self {
            WeftError::Validation(_) => 2,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_error_display_starts_with_task_name() {
        let err = TaskError::execution("extract", "boom");
        assert!(err.to_string().starts_with("extract"));
    }

    #[test]
    fn aggregate_summarizes_first_five() {
        let errors: Vec<TaskError> = (0..7)
            .map(|i| TaskError::execution(format!("t{}", i), "boom"))
            .collect();
        let agg = AggregateTaskError { errors };
        let text = agg.to_string();
        assert!(text.contains("t0: boom"));
        assert!(text.contains("t4: boom"));
        assert!(!text.contains("t5: boom"));
        assert!(text.ends_with("(+2 more)"));
    }

    #[test]
    fn aggregate_without_overflow_has_no_suffix() {
        let agg = AggregateTaskError {
            errors: vec![TaskError::execution("a", "x")],
        };
        assert!(!agg.to_string().contains("more"));
    }

    #[test]
    fn timeout_kind_is_preserved_through_weft_error() {
        let err = TaskError::timeout("slow", "timed out after 1s");
        assert!(err.is_timeout());
        let top: WeftError = err.into();
        match top {
            WeftError::Task(e) => assert_eq!(e.kind, TaskErrorKind::Timeout),
            other => panic!("unexpected variant: {:?}", other),
        }
    }

    #[test]
    fn validation_exit_code_differs_from_failure() {
        assert_eq!(WeftError::Validation("bad".into()).exit_code(), 2);
        assert_eq!(WeftError::Cancelled.exit_code(), 1);
    }
}
