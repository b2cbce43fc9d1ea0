//! Dynamic fan-out placeholders.
//!
//! [`fan_out`] maps a task over a source. With a concrete sequence the
//! expansion is static: children are registered immediately during build. With
//! an invocation (or another placeholder) as the source, expansion is deferred
//! until the scheduler materializes the source value at runtime, then rewires
//! every consumer onto the children.

use crate::arg::{ArgNode, FanOutId, NodeId};
use crate::build::BuildContext;
use crate::task::Task;

/// Where a placeholder's elements come from.
#[derive(Debug, Clone)]
pub enum FanOutSource {
    /// An invocation whose result must materialize an array.
    Node(NodeId),
    /// Another placeholder; the source value is the ordered list of its
    /// children's results.
    FanOut(FanOutId),
}

/// Sentinel for "N children to be determined at runtime".
///
/// Expanded exactly once; never shrinks. Retained after expansion because
/// other placeholders may still name it as their source.
#[derive(Debug, Clone)]
pub struct FanOut {
    pub id: FanOutId,
    pub task: Task,
    pub source: FanOutSource,
    /// Surfaced in `describe`; the run-level semaphore is the operative
    /// throttle.
    pub max_concurrency: Option<usize>,
    pub expanded: bool,
    pub children: Vec<NodeId>,
}

/// Map `task` over `source` inside a flow build.
///
/// - concrete sequence → static fan-out, children registered now;
/// - invocation placeholder → dynamic fan-out, expanded at runtime;
/// - fan-out placeholder → nested dynamic fan-out.
///
/// Any other source is a build error surfaced when the flow runs.
pub fn fan_out(
    cx: &mut BuildContext,
    task: &Task,
    source: ArgNode,
    max_concurrency: Option<usize>,
) -> ArgNode {
    match source {
        ArgNode::Node(id) => register_placeholder(cx, task, FanOutSource::Node(id), max_concurrency),
        ArgNode::FanOut(parent) => {
            register_placeholder(cx, task, FanOutSource::FanOut(parent), max_concurrency)
        }
        ArgNode::Seq(items) => {
            let children: Vec<ArgNode> = items
                .into_iter()
                .map(|item| task.call(cx, vec![item]))
                .collect();
            ArgNode::Seq(children)
        }
        ArgNode::Value(serde_json::Value::Array(items)) => {
            let children: Vec<ArgNode> = items
                .into_iter()
                .map(|item| task.call(cx, vec![ArgNode::Value(item)]))
                .collect();
            ArgNode::Seq(children)
        }
        other => {
            cx.record_error(format!(
                "fan_out source for task '{}' must be a sequence, an invocation, or another fan_out (got {:?})",
                task.name(),
                kind_of(&other),
            ));
            ArgNode::Seq(Vec::new())
        }
    }
}

fn register_placeholder(
    cx: &mut BuildContext,
    task: &Task,
    source: FanOutSource,
    max_concurrency: Option<usize>,
) -> ArgNode {
    let id = cx.fanouts.len();
    cx.fanouts.push(FanOut {
        id,
        task: task.clone(),
        source,
        max_concurrency,
        expanded: false,
        children: Vec::new(),
    });
    ArgNode::FanOut(id)
}

fn kind_of(node: &ArgNode) -> &'static str {
    match node {
        ArgNode::Value(_) => "value",
        ArgNode::Node(_) => "node",
        ArgNode::FanOut(_) => "fan_out",
        ArgNode::Seq(_) => "sequence",
        ArgNode::Map(_) => "mapping",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::task;
    use serde_json::json;

    fn square() -> Task {
        task("square")
            .body_async(|args| async move {
                let x = args[0].as_i64().unwrap_or(0);
                Ok(json!(x * x))
            })
            .build()
            .unwrap()
    }

    #[test]
    fn static_fan_out_registers_children_immediately() {
        let mut cx = BuildContext::new();
        let sq = square();
        let out = fan_out(&mut cx, &sq, ArgNode::value(json!([1, 2, 3])), None);
        match out {
            ArgNode::Seq(children) => assert_eq!(children.len(), 3),
            other => panic!("expected static children, got {:?}", other),
        }
        assert!(cx.fanouts.is_empty());
    }

    #[test]
    fn dynamic_fan_out_defers_expansion() {
        let mut cx = BuildContext::new();
        let sq = square();
        let nums = task("nums")
            .body_async(|_| async move { Ok(json!([1, 2])) })
            .build()
            .unwrap();
        let source = nums.call(&mut cx, vec![]);
        let out = fan_out(&mut cx, &sq, source, Some(4));
        assert!(matches!(out, ArgNode::FanOut(0)));
        assert_eq!(cx.fanouts.len(), 1);
        assert!(!cx.fanouts[0].expanded);
        assert_eq!(cx.fanouts[0].max_concurrency, Some(4));
    }

    #[test]
    fn nested_fan_out_chains_placeholders() {
        let mut cx = BuildContext::new();
        let sq = square();
        let nums = task("nums")
            .body_async(|_| async move { Ok(json!([1])) })
            .build()
            .unwrap();
        let source = nums.call(&mut cx, vec![]);
        let first = fan_out(&mut cx, &sq, source, None);
        let second = fan_out(&mut cx, &sq, first, None);
        assert!(matches!(second, ArgNode::FanOut(1)));
        assert!(matches!(cx.fanouts[1].source, FanOutSource::FanOut(0)));
    }

    #[test]
    fn scalar_source_is_a_build_error() {
        let mut cx = BuildContext::new();
        let sq = square();
        let out = fan_out(&mut cx, &sq, ArgNode::from(7), None);
        assert!(matches!(out, ArgNode::Seq(ref v) if v.is_empty()));
        assert_eq!(cx.errors.len(), 1);
        assert!(cx.errors[0].contains("square"));
    }
}
