//! Concurrency-bounded DAG execution.
//!
//! The scheduler owns every piece of mutable run state — results, the ready
//! frontier, remaining dependencies, the in-flight dedup map, the graph —
//! on a single cooperative loop. Task handles are spawned tasks that report
//! back over a channel; they never touch scheduler state directly.
//!
//! Start order among simultaneously ready nodes is deterministic: priority
//! descending, then node id ascending. Already-running tasks are never
//! preempted.

use std::collections::BTreeSet;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use rustc_hash::FxHashMap;
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::arg::{ArgNode, NodeId};
use crate::build::{Invocation, Plan};
use crate::cache;
use crate::config;
use crate::context::{self, RunContext};
use crate::dag::Dag;
use crate::error::{AggregateTaskError, TaskError, WeftError};
use crate::events;
use crate::fanout::FanOutSource;
use crate::metrics;
use crate::middleware;
use crate::task::Task;

// ============================================================================
// FAILURE POLICY
// ============================================================================

/// What a task failure does to the rest of the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Cancel everything pending and propagate the first error.
    #[default]
    FailFast,
    /// Record the error as the node's result; downstream nodes still run and
    /// observe the error's rendering as their argument value.
    Continue,
    /// Record every error, keep scheduling, raise them together at the end.
    Aggregate,
}

impl FailurePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailurePolicy::FailFast => "fail_fast",
            FailurePolicy::Continue => "continue",
            FailurePolicy::Aggregate => "aggregate",
        }
    }
}

impl FromStr for FailurePolicy {
    type Err = WeftError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fail_fast" => Ok(FailurePolicy::FailFast),
            "continue" => Ok(FailurePolicy::Continue),
            "aggregate" => Ok(FailurePolicy::Aggregate),
            other => Err(WeftError::Validation(format!(
                "unknown failure policy '{}' (expected fail_fast, continue, or aggregate)",
                other
            ))),
        }
    }
}

// ============================================================================
// RUN STATE
// ============================================================================

pub(crate) type NodeResult = Result<Value, TaskError>;

struct Completion {
    node: NodeId,
    result: NodeResult,
    duration_ms: f64,
}

enum PendingKind {
    /// First execution for a cache key; resolves the in-flight entry.
    Leader { key: String },
    /// Awaits a leader's in-flight entry instead of running the body.
    Follower,
    Plain,
}

struct Pending {
    handle: JoinHandle<()>,
    kind: PendingKind,
}

pub(crate) struct Scheduler {
    plan: Plan,
    dag: Dag,
    policy: FailurePolicy,
    results: FxHashMap<NodeId, NodeResult>,
    remaining: FxHashMap<NodeId, BTreeSet<NodeId>>,
    ready: Vec<NodeId>,
    pending: FxHashMap<NodeId, Pending>,
    inflight: FxHashMap<String, watch::Sender<Option<NodeResult>>>,
    errors: Vec<TaskError>,
    semaphore: Arc<Semaphore>,
    run: Arc<RunContext>,
    cancel: CancellationToken,
    tx: mpsc::UnboundedSender<Completion>,
    rx: mpsc::UnboundedReceiver<Completion>,
}

/// Execute a frozen plan to completion under the given policy. Returns the
/// per-node results and the (possibly expanded) placeholders for hydration.
pub(crate) async fn execute_plan(
    plan: Plan,
    policy: FailurePolicy,
    max_concurrency: Option<usize>,
    cancel: CancellationToken,
    run: Arc<RunContext>,
) -> Result<(FxHashMap<NodeId, NodeResult>, Vec<crate::fanout::FanOut>), WeftError> {
    let mut scheduler = Scheduler::new(plan, policy, max_concurrency, cancel, run)?;
    let outcome = scheduler.drive().await;
    if outcome.is_err() {
        scheduler.abort_all().await;
    }
    outcome?;
    if policy == FailurePolicy::Aggregate && !scheduler.errors.is_empty() {
        return Err(WeftError::Aggregate(AggregateTaskError {
            errors: scheduler.errors,
        }));
    }
    Ok((scheduler.results, scheduler.plan.fanouts))
}

impl Scheduler {
    fn new(
        plan: Plan,
        policy: FailurePolicy,
        max_concurrency: Option<usize>,
        cancel: CancellationToken,
        run: Arc<RunContext>,
    ) -> Result<Self, WeftError> {
        let mut dag = Dag::new();
        for id in &plan.order {
            dag.add_node(id);
            if let Some(inv) = plan.invocations.get(id) {
                for up in &inv.upstream {
                    if plan.invocations.contains_key(up) {
                        dag.add_edge(up, id);
                    }
                }
            }
        }
        dag.topological_sort()?;

        let mut remaining: FxHashMap<NodeId, BTreeSet<NodeId>> = FxHashMap::default();
        let mut ready = Vec::new();
        for id in &plan.order {
            let deps: BTreeSet<NodeId> = dag
                .upstream_of(id)
                .cloned()
                .collect();
            if deps.is_empty() {
                ready.push(NodeId::clone(id));
            }
            remaining.insert(NodeId::clone(id), deps);
        }

        let capacity = max_concurrency
            .or(config::config().max_dynamic_tasks)
            .unwrap_or_else(|| plan.order.len())
            .max(1);

        let (tx, rx) = mpsc::unbounded_channel();
        Ok(Self {
            plan,
            dag,
            policy,
            results: FxHashMap::default(),
            remaining,
            ready,
            pending: FxHashMap::default(),
            inflight: FxHashMap::default(),
            errors: Vec::new(),
            semaphore: Arc::new(Semaphore::new(capacity)),
            run,
            cancel,
            tx,
            rx,
        })
    }

    async fn drive(&mut self) -> Result<(), WeftError> {
        loop {
            if self.cancel.is_cancelled() {
                return Err(WeftError::Cancelled);
            }

            let mut runnable: Vec<NodeId> = self
                .ready
                .iter()
                .filter(|n| self.is_runnable(n))
                .cloned()
                .collect();
            runnable.sort_by(|a, b| {
                let pa = self.priority_of(a);
                let pb = self.priority_of(b);
                pb.cmp(&pa).then_with(|| a.cmp(b))
            });
            let progressed = !runnable.is_empty();
            for node in runnable {
                self.ready.retain(|n| n != &node);
                self.spawn_node(node)?;
            }

            if self.pending.is_empty() {
                if progressed {
                    // Cache hits complete inline and may have refilled the
                    // frontier; take another pass.
                    continue;
                }
                break;
            }

            let cancelled = self.cancel.clone();
            tokio::select! {
                _ = cancelled.cancelled() => return Err(WeftError::Cancelled),
                msg = self.rx.recv() => {
                    let Some(msg) = msg else { break };
                    self.handle_completion(msg)?;
                    while let Ok(more) = self.rx.try_recv() {
                        self.handle_completion(more)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn priority_of(&self, node: &NodeId) -> i32 {
        self.plan
            .invocations
            .get(node)
            .map(|inv| inv.task.priority())
            .unwrap_or(0)
    }

    /// A ready node may still be gated by an unexpanded placeholder in its
    /// input tree, or by expansion-added child dependencies.
    fn is_runnable(&self, node: &NodeId) -> bool {
        if !self
            .remaining
            .get(node)
            .map(|deps| deps.is_empty())
            .unwrap_or(true)
        {
            return false;
        }
        let Some(inv) = self.plan.invocations.get(node) else {
            return false;
        };
        let mut refs = Vec::new();
        for arg in &inv.args {
            arg.fanout_refs(&mut refs);
        }
        refs.iter().all(|fid| {
            let fanout = &self.plan.fanouts[*fid];
            fanout.expanded
                && fanout
                    .children
                    .iter()
                    .all(|child| self.results.contains_key(child))
        })
    }

    // ------------------------------------------------------------------
    // Spawning
    // ------------------------------------------------------------------

    fn spawn_node(&mut self, node: NodeId) -> Result<(), WeftError> {
        let (task, arg_nodes) = {
            let inv = &self.plan.invocations[&node];
            (inv.task.clone(), inv.args.clone())
        };
        let args: Vec<Value> = arg_nodes.iter().map(|a| self.resolve_arg(a)).collect();

        if let Some(ttl) = task.cache_ttl() {
            let key = task.cache_key(&args);
            let store = cache::result_cache();
            if let Some(hit) = store.get(&key, ttl) {
                metrics::metrics_provider().inc("cache_hits", 1.0);
                return self.complete_success(node, hit);
            }
            let in_flight = self.inflight.get(&key).map(|entry| entry.subscribe());
            if let Some(rx) = in_flight {
                metrics::metrics_provider().inc("dedup_joins", 1.0);
                self.spawn_follower(node, task, rx);
                return Ok(());
            }
            let (watch_tx, _) = watch::channel(None);
            self.inflight.insert(key.clone(), watch_tx);
            self.emit_started(&task, &node);
            self.spawn_handle(node, task, args, PendingKind::Leader { key });
            return Ok(());
        }

        self.emit_started(&task, &node);
        self.spawn_handle(node, task, args, PendingKind::Plain);
        Ok(())
    }

    fn emit_started(&self, task: &Task, node: &NodeId) {
        events::emit(
            "task_started",
            json!({ "task": task.name(), "node": node.as_ref() }),
        );
    }

    fn spawn_follower(
        &mut self,
        node: NodeId,
        task: Task,
        mut rx: watch::Receiver<Option<NodeResult>>,
    ) {
        let sender = self.tx.clone();
        let reply = NodeId::clone(&node);
        let task_name = task.name().to_string();
        let handle = tokio::spawn(async move {
            let started = Instant::now();
            let result = match rx.wait_for(|v| v.is_some()).await {
                Ok(settled) => settled
                    .as_ref()
                    .cloned()
                    .unwrap_or_else(|| {
                        Err(TaskError::execution(&task_name, "in-flight entry vanished"))
                    }),
                Err(_) => Err(TaskError::execution(
                    &task_name,
                    "deduplicated execution abandoned",
                )),
            };
            let _ = sender.send(Completion {
                node: reply,
                result,
                duration_ms: started.elapsed().as_secs_f64() * 1000.0,
            });
        });
        self.pending.insert(
            node,
            Pending {
                handle,
                kind: PendingKind::Follower,
            },
        );
    }

    fn spawn_handle(&mut self, node: NodeId, task: Task, args: Vec<Value>, kind: PendingKind) {
        let sender = self.tx.clone();
        let semaphore = Arc::clone(&self.semaphore);
        let run = Arc::clone(&self.run);
        let reply = NodeId::clone(&node);
        let handle = tokio::spawn(context::with_run(Arc::clone(&run), async move {
            let started = Instant::now();
            let result = run_node(&task, &reply, args, semaphore, &run).await;
            let _ = sender.send(Completion {
                node: reply,
                result,
                duration_ms: started.elapsed().as_secs_f64() * 1000.0,
            });
        }));
        self.pending.insert(node, Pending { handle, kind });
    }

    fn resolve_arg(&self, arg: &ArgNode) -> Value {
        match arg {
            ArgNode::Value(v) => v.clone(),
            ArgNode::Node(id) => match self.results.get(id) {
                Some(Ok(v)) => v.clone(),
                Some(Err(e)) => Value::String(e.to_string()),
                None => Value::Null,
            },
            ArgNode::FanOut(fid) => {
                let fanout = &self.plan.fanouts[*fid];
                Value::Array(
                    fanout
                        .children
                        .iter()
                        .map(|child| match self.results.get(child) {
                            Some(Ok(v)) => v.clone(),
                            Some(Err(e)) => Value::String(e.to_string()),
                            None => Value::Null,
                        })
                        .collect(),
                )
            }
            ArgNode::Seq(items) => {
                Value::Array(items.iter().map(|i| self.resolve_arg(i)).collect())
            }
            ArgNode::Map(entries) => Value::Object(
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), self.resolve_arg(v)))
                    .collect(),
            ),
        }
    }

    // ------------------------------------------------------------------
    // Completion
    // ------------------------------------------------------------------

    fn handle_completion(&mut self, msg: Completion) -> Result<(), WeftError> {
        let Some(pending) = self.pending.remove(&msg.node) else {
            return Ok(());
        };
        let task_name = self.plan.invocations[&msg.node].task.name().to_string();

        match msg.result {
            Ok(value) => {
                if let PendingKind::Leader { key } = &pending.kind {
                    cache::result_cache().set(key, value.clone());
                    metrics::metrics_provider().inc("cache_sets", 1.0);
                    if let Some(entry) = self.inflight.remove(key) {
                        let _ = entry.send(Some(Ok(value.clone())));
                    }
                }
                if !matches!(pending.kind, PendingKind::Follower) {
                    events::emit(
                        "task_succeeded",
                        json!({
                            "task": task_name,
                            "node": msg.node.as_ref(),
                            "duration_ms": msg.duration_ms,
                        }),
                    );
                    let provider = metrics::metrics_provider();
                    provider.inc("tasks_succeeded", 1.0);
                    provider.observe("task_duration_ms", msg.duration_ms);
                }
                self.complete_success(msg.node, value)
            }
            Err(err) => {
                if let PendingKind::Leader { key } = &pending.kind {
                    // No negative caching: drop the in-flight entry so a
                    // later identical invocation re-executes.
                    if let Some(entry) = self.inflight.remove(key) {
                        let _ = entry.send(Some(Err(err.clone())));
                    }
                }
                events::emit(
                    "task_failed",
                    json!({
                        "task": task_name,
                        "node": msg.node.as_ref(),
                        "error": err.to_string(),
                    }),
                );
                metrics::metrics_provider().inc("tasks_failed", 1.0);
                self.results
                    .insert(NodeId::clone(&msg.node), Err(err.clone()));
                match self.policy {
                    FailurePolicy::FailFast => return Err(WeftError::Task(err)),
                    FailurePolicy::Continue => {}
                    FailurePolicy::Aggregate => self.errors.push(err),
                }
                self.expand_ready()?;
                self.update_downstream(&msg.node);
                Ok(())
            }
        }
    }

    fn complete_success(&mut self, node: NodeId, value: Value) -> Result<(), WeftError> {
        self.results.insert(NodeId::clone(&node), Ok(value));
        self.expand_ready()?;
        self.update_downstream(&node);
        Ok(())
    }

    fn update_downstream(&mut self, node: &NodeId) {
        let downstream: Vec<NodeId> = self.dag.downstream_of(node).cloned().collect();
        for child in downstream {
            if let Some(deps) = self.remaining.get_mut(&child) {
                deps.remove(node);
            }
            let upstream_failed = self
                .dag
                .upstream_of(&child)
                .any(|up| matches!(self.results.get(up), Some(Err(_))));
            if upstream_failed && self.policy != FailurePolicy::Continue {
                if !self.results.contains_key(&child) {
                    let task_name = self.plan.invocations[&child].task.name();
                    self.results.insert(
                        NodeId::clone(&child),
                        Err(TaskError::upstream_failed(task_name)),
                    );
                }
                continue;
            }
            let deps_clear = self
                .remaining
                .get(&child)
                .map(|deps| deps.is_empty())
                .unwrap_or(true);
            if deps_clear
                && !self.ready.contains(&child)
                && !self.pending.contains_key(&child)
                && !self.results.contains_key(&child)
            {
                self.ready.push(child);
            }
        }
    }

    // ------------------------------------------------------------------
    // Dynamic fan-out expansion
    // ------------------------------------------------------------------

    /// Expand every placeholder whose preconditions hold. Placeholders are
    /// scanned in creation order, so a chain whose links become vacuously
    /// ready (empty sources) collapses in one pass.
    fn expand_ready(&mut self) -> Result<(), WeftError> {
        for fid in 0..self.plan.fanouts.len() {
            if self.plan.fanouts[fid].expanded {
                continue;
            }
            let source_value = match &self.plan.fanouts[fid].source {
                FanOutSource::Node(id) => match self.results.get(id) {
                    Some(Ok(v)) => Some(v.clone()),
                    Some(Err(e)) => {
                        return Err(WeftError::Task(TaskError::fan_out(
                            "dynamic",
                            format!("fan_out source failed: {}", e),
                        )))
                    }
                    None => None,
                },
                FanOutSource::FanOut(parent) => {
                    let parent = &self.plan.fanouts[*parent];
                    if parent.expanded
                        && parent
                            .children
                            .iter()
                            .all(|c| self.results.contains_key(c))
                    {
                        let items = parent
                            .children
                            .iter()
                            .map(|c| match &self.results[c] {
                                Ok(v) => v.clone(),
                                Err(e) => Value::String(e.to_string()),
                            })
                            .collect();
                        Some(Value::Array(items))
                    } else {
                        None
                    }
                }
            };
            let Some(source_value) = source_value else {
                continue;
            };
            let Value::Array(items) = source_value else {
                return Err(WeftError::Task(TaskError::fan_out(
                    "dynamic",
                    "fan_out source must be an array",
                )));
            };
            self.expand_one(fid, items);
        }
        Ok(())
    }

    fn expand_one(&mut self, fid: usize, items: Vec<Value>) {
        let task = self.plan.fanouts[fid].task.clone();
        let source_ids: Vec<NodeId> = match &self.plan.fanouts[fid].source {
            FanOutSource::Node(id) => vec![NodeId::clone(id)],
            FanOutSource::FanOut(parent) => self.plan.fanouts[*parent].children.clone(),
        };

        let mut children: Vec<NodeId> = Vec::with_capacity(items.len());
        for item in items {
            let id = self.plan.next_id(task.name());
            let upstream: BTreeSet<NodeId> = source_ids.iter().cloned().collect();
            let inv = Invocation {
                id: NodeId::clone(&id),
                task: task.clone(),
                args: vec![ArgNode::Value(item)],
                upstream,
            };
            self.plan.invocations.insert(NodeId::clone(&id), inv);
            self.plan.order.push(NodeId::clone(&id));
            self.dag.add_node(&id);
            for source in &source_ids {
                self.dag.add_edge(source, &id);
            }
            // Sources already have results at the moment of expansion.
            self.remaining.insert(NodeId::clone(&id), BTreeSet::new());
            self.ready.push(NodeId::clone(&id));
            children.push(id);
        }

        // Rewire consumers: substitute the placeholder with the ordered
        // children and pick up the new dependencies.
        let replacement = ArgNode::Seq(
            children
                .iter()
                .map(|c| ArgNode::Node(NodeId::clone(c)))
                .collect(),
        );
        let candidates: Vec<NodeId> = self
            .plan
            .order
            .iter()
            .filter(|id| !children.contains(*id))
            .cloned()
            .collect();
        let mut rewired = Vec::new();
        for cid in candidates {
            if let Some(inv) = self.plan.invocations.get_mut(&cid) {
                let mut replaced = false;
                for arg in &mut inv.args {
                    replaced |= arg.replace_fanout(fid, &replacement);
                }
                if replaced {
                    for child in &children {
                        inv.upstream.insert(NodeId::clone(child));
                    }
                    rewired.push(cid);
                }
            }
        }
        for cid in rewired {
            for child in &children {
                self.dag.add_edge(child, &cid);
                if !self.results.contains_key(child) {
                    self.remaining
                        .entry(NodeId::clone(&cid))
                        .or_default()
                        .insert(NodeId::clone(child));
                }
            }
        }

        let fanout = &mut self.plan.fanouts[fid];
        fanout.children = children;
        fanout.expanded = true;
    }

    async fn abort_all(&mut self) {
        let handles: Vec<JoinHandle<()>> = self
            .pending
            .drain()
            .map(|(_, pending)| {
                pending.handle.abort();
                pending.handle
            })
            .collect();
        for handle in handles {
            let _ = handle.await;
        }
        self.inflight.clear();
    }
}

/// Body of one task handle: semaphore, tracing span, middleware chain around
/// the retry loop, artifact persistence.
async fn run_node(
    task: &Task,
    node: &NodeId,
    args: Vec<Value>,
    semaphore: Arc<Semaphore>,
    run: &RunContext,
) -> NodeResult {
    let _permit = match semaphore.acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => return Err(TaskError::execution(task.name(), "scheduler shut down")),
    };
    let span = tracing::info_span!(
        "task",
        task = %task.name(),
        node = %node,
        run_id = %run.run_id,
    );

    let def = Arc::clone(task.def());
    let core_args = args.clone();
    let core: middleware::CoreFn = Arc::new(move || {
        let def = Arc::clone(&def);
        let args = core_args.clone();
        Box::pin(async move { def.run_attempts(args).await.map_err(anyhow::Error::new) })
    });

    let outcome = middleware::run_chain(task, &args, core).instrument(span).await;
    match outcome {
        Ok(value) => Ok(task.def().maybe_persist(value)),
        Err(err) => Err(match err.downcast::<TaskError>() {
            Ok(task_error) => task_error,
            Err(other) => TaskError::execution(task.name(), other.to_string()),
        }),
    }
}
