//! Graph construction: [`BuildContext`] and [`Invocation`].
//!
//! A flow's build callback runs against an explicit `BuildContext`. Every task
//! call inside the callback registers an [`Invocation`] — a deferred call
//! record — and hands back an opaque [`ArgNode::Node`] placeholder. Upstream
//! dependencies are discovered once, at registration, by structurally scanning
//! the argument tree.

use std::collections::BTreeSet;

use rustc_hash::FxHashMap;

use crate::arg::{ArgNode, FanOutId, NodeId};
use crate::fanout::{FanOut, FanOutSource};
use crate::task::Task;

/// A deferred call of a task; a node in the DAG.
#[derive(Clone)]
pub struct Invocation {
    pub id: NodeId,
    pub task: Task,
    pub args: Vec<ArgNode>,
    /// Every invocation referenced transitively through the argument tree,
    /// plus the source of any referenced fan-out placeholder. Sorted for
    /// deterministic reporting.
    pub upstream: BTreeSet<NodeId>,
}

impl std::fmt::Debug for Invocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Invocation")
            .field("id", &self.id)
            .field("task", &self.task.name())
            .field("upstream", &self.upstream)
            .finish()
    }
}

/// Per-flow-run registry of invocations and fan-out placeholders.
///
/// Node ids are per-task monotonic counters within one context, which makes
/// them stable across runs with identical build callbacks.
#[derive(Default)]
pub struct BuildContext {
    pub(crate) invocations: FxHashMap<NodeId, Invocation>,
    pub(crate) order: Vec<NodeId>,
    pub(crate) fanouts: Vec<FanOut>,
    counters: FxHashMap<String, u64>,
    pub(crate) errors: Vec<String>,
}

impl BuildContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn next_id(&mut self, task_name: &str) -> NodeId {
        let counter = self.counters.entry(task_name.to_string()).or_insert(0);
        *counter += 1;
        NodeId::from(format!("{}:{}", task_name, counter).as_str())
    }

    /// Register a deferred task call and return its placeholder.
    pub(crate) fn register(&mut self, task: Task, args: Vec<ArgNode>) -> ArgNode {
        let id = self.next_id(task.name());
        let mut upstream = BTreeSet::new();
        for arg in &args {
            self.scan_upstream(arg, &mut upstream);
        }
        let inv = Invocation {
            id: NodeId::clone(&id),
            task,
            args,
            upstream,
        };
        self.invocations.insert(NodeId::clone(&id), inv);
        self.order.push(NodeId::clone(&id));
        ArgNode::Node(id)
    }

    /// Record a build problem; surfaced as `WeftError::Build` when the flow
    /// runs.
    pub(crate) fn record_error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    fn scan_upstream(&self, arg: &ArgNode, out: &mut BTreeSet<NodeId>) {
        match arg {
            ArgNode::Value(_) => {}
            ArgNode::Node(id) => {
                if out.insert(NodeId::clone(id)) {
                    if let Some(inv) = self.invocations.get(id) {
                        for nested in &inv.args {
                            self.scan_upstream(nested, out);
                        }
                    }
                }
            }
            ArgNode::FanOut(fid) => self.scan_fanout(*fid, out),
            ArgNode::Seq(items) => {
                for item in items {
                    self.scan_upstream(item, out);
                }
            }
            ArgNode::Map(entries) => {
                for (_, v) in entries {
                    self.scan_upstream(v, out);
                }
            }
        }
    }

    fn scan_fanout(&self, fid: FanOutId, out: &mut BTreeSet<NodeId>) {
        let Some(fanout) = self.fanouts.get(fid) else {
            return;
        };
        match &fanout.source {
            FanOutSource::Node(id) => {
                let node = ArgNode::Node(NodeId::clone(id));
                self.scan_upstream(&node, out);
            }
            FanOutSource::FanOut(parent) => self.scan_fanout(*parent, out),
        }
        for child in &fanout.children {
            let node = ArgNode::Node(NodeId::clone(child));
            self.scan_upstream(&node, out);
        }
    }

    /// Freeze the context into the scheduler's plan, keeping only invocations
    /// reachable from the structure the build callback returned.
    pub(crate) fn into_plan(self, structure: &ArgNode) -> Plan {
        let mut reachable = BTreeSet::new();
        collect_reachable(structure, &self.invocations, &self.fanouts, &mut reachable);
        // Fan-out sources must run even when only the placeholder is returned.
        for fanout in &self.fanouts {
            if let FanOutSource::Node(id) = &fanout.source {
                let node = ArgNode::Node(NodeId::clone(id));
                collect_reachable(&node, &self.invocations, &self.fanouts, &mut reachable);
            }
        }
        let order: Vec<NodeId> = self
            .order
            .iter()
            .filter(|id| reachable.contains(*id))
            .cloned()
            .collect();
        let invocations = self
            .invocations
            .into_iter()
            .filter(|(id, _)| reachable.contains(id))
            .collect();
        Plan {
            invocations,
            order,
            fanouts: self.fanouts,
            counters: self.counters,
        }
    }
}

/// Frozen build output: everything the scheduler owns during a run.
///
/// The counters travel along so that dynamically expanded children continue
/// each task's id sequence deterministically.
pub(crate) struct Plan {
    pub invocations: FxHashMap<NodeId, Invocation>,
    pub order: Vec<NodeId>,
    pub fanouts: Vec<FanOut>,
    counters: FxHashMap<String, u64>,
}

impl Plan {
    pub fn next_id(&mut self, task_name: &str) -> NodeId {
        let counter = self.counters.entry(task_name.to_string()).or_insert(0);
        *counter += 1;
        NodeId::from(format!("{}:{}", task_name, counter).as_str())
    }

    /// Invocation ids that reference the given fan-out anywhere in their
    /// argument trees.
    pub fn consumers_of(&self, fid: FanOutId) -> Vec<NodeId> {
        let mut out: Vec<NodeId> = Vec::new();
        for id in &self.order {
            if let Some(inv) = self.invocations.get(id) {
                let mut refs = Vec::new();
                for arg in &inv.args {
                    arg.fanout_refs(&mut refs);
                }
                if refs.contains(&fid) {
                    out.push(NodeId::clone(id));
                }
            }
        }
        out
    }
}

fn collect_reachable(
    node: &ArgNode,
    invocations: &FxHashMap<NodeId, Invocation>,
    fanouts: &[FanOut],
    out: &mut BTreeSet<NodeId>,
) {
    match node {
        ArgNode::Value(_) => {}
        ArgNode::Node(id) => {
            if out.insert(NodeId::clone(id)) {
                if let Some(inv) = invocations.get(id) {
                    for arg in &inv.args {
                        collect_reachable(arg, invocations, fanouts, out);
                    }
                }
            }
        }
        ArgNode::FanOut(fid) => {
            if let Some(fanout) = fanouts.get(*fid) {
                match &fanout.source {
                    FanOutSource::Node(id) => {
                        let n = ArgNode::Node(NodeId::clone(id));
                        collect_reachable(&n, invocations, fanouts, out);
                    }
                    FanOutSource::FanOut(parent) => {
                        let n = ArgNode::FanOut(*parent);
                        collect_reachable(&n, invocations, fanouts, out);
                    }
                }
                for child in &fanout.children {
                    let n = ArgNode::Node(NodeId::clone(child));
                    collect_reachable(&n, invocations, fanouts, out);
                }
            }
        }
        ArgNode::Seq(items) => {
            for item in items {
                collect_reachable(item, invocations, fanouts, out);
            }
        }
        ArgNode::Map(entries) => {
            for (_, v) in entries {
                collect_reachable(v, invocations, fanouts, out);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::task;
    use serde_json::json;

    fn noop(name: &str) -> Task {
        task(name)
            .body_async(|_args| async move { Ok(json!(null)) })
            .build()
            .unwrap()
    }

    #[test]
    fn node_ids_are_per_task_monotonic() {
        let mut cx = BuildContext::new();
        let t = noop("extract");
        let u = noop("load");
        let a = t.call(&mut cx, vec![]);
        let b = t.call(&mut cx, vec![]);
        let c = u.call(&mut cx, vec![]);
        match (&a, &b, &c) {
            (ArgNode::Node(a), ArgNode::Node(b), ArgNode::Node(c)) => {
                assert_eq!(a.as_ref(), "extract:1");
                assert_eq!(b.as_ref(), "extract:2");
                assert_eq!(c.as_ref(), "load:1");
            }
            _ => panic!("task calls must return node placeholders"),
        }
    }

    #[test]
    fn upstream_is_transitive_through_nested_args() {
        let mut cx = BuildContext::new();
        let t = noop("t");
        let a = t.call(&mut cx, vec![ArgNode::from(1)]);
        let b = t.call(&mut cx, vec![a]);
        let c = t.call(&mut cx, vec![ArgNode::seq([b])]);
        let ArgNode::Node(c_id) = c else { unreachable!() };
        let upstream = &cx.invocations[&c_id].upstream;
        assert!(upstream.contains("t:1"));
        assert!(upstream.contains("t:2"));
    }

    #[test]
    fn upstream_never_contains_forward_references() {
        let mut cx = BuildContext::new();
        let t = noop("t");
        let a = t.call(&mut cx, vec![]);
        let ArgNode::Node(a_id) = &a else {
            unreachable!()
        };
        let earlier: Vec<NodeId> = cx.order.clone();
        let b = t.call(&mut cx, vec![a.clone()]);
        let ArgNode::Node(b_id) = b else { unreachable!() };
        let upstream = &cx.invocations[&b_id].upstream;
        for up in upstream {
            assert!(earlier.contains(up), "forward reference to {}", up);
        }
        assert!(upstream.contains(a_id.as_ref()));
    }

    #[test]
    fn plan_keeps_only_invocations_reachable_from_output() {
        let mut cx = BuildContext::new();
        let t = noop("t");
        let kept = t.call(&mut cx, vec![]);
        let _dropped = t.call(&mut cx, vec![]);
        let plan = cx.into_plan(&kept);
        assert_eq!(plan.order.len(), 1);
        assert_eq!(plan.order[0].as_ref(), "t:1");
    }

    #[test]
    fn plan_counters_continue_after_build() {
        let mut cx = BuildContext::new();
        let t = noop("sq");
        let out = t.call(&mut cx, vec![]);
        let mut plan = cx.into_plan(&out);
        assert_eq!(plan.next_id("sq").as_ref(), "sq:2");
        assert_eq!(plan.next_id("other").as_ref(), "other:1");
    }
}
