//! Flows: named recipes for building and executing task graphs.
//!
//! A flow wraps a build callback. Running it builds the invocation graph
//! inside a fresh [`BuildContext`], executes it through the scheduler, and
//! hydrates the returned structure — every invocation placeholder replaced by
//! its concrete result, every expanded fan-out by the ordered list of its
//! children's results, container kinds preserved.

use std::collections::BTreeSet;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::arg::{ArgNode, NodeId};
use crate::build::BuildContext;
use crate::context::{Params, RunContext};
use crate::dag::Dag;
use crate::error::WeftError;
use crate::events;
use crate::fanout::{FanOut, FanOutSource};
use crate::scheduler::{self, FailurePolicy, NodeResult};

/// Per-run knobs.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub failure_policy: FailurePolicy,
    /// Concurrency cap; falls back to `MAX_DYNAMIC_TASKS`, then to the node
    /// count.
    pub max_concurrency: Option<usize>,
}

type BuildFn = dyn Fn(&mut BuildContext, &Params) -> ArgNode + Send + Sync;

/// A named recipe for building a DAG, parameterized by user inputs.
#[derive(Clone)]
pub struct Flow {
    name: Arc<str>,
    build: Arc<BuildFn>,
}

/// Declare a flow from a build callback.
pub fn flow<F>(name: &str, build: F) -> Flow
where
    F: Fn(&mut BuildContext, &Params) -> ArgNode + Send + Sync + 'static,
{
    Flow {
        name: Arc::from(name),
        build: Arc::new(build),
    }
}

impl Flow {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Execute and return the hydrated structure.
    pub async fn run(&self, params: Params, options: RunOptions) -> Result<Value, WeftError> {
        self.run_with_cancel(params, options, CancellationToken::new())
            .await
    }

    /// Execute with an externally provided cancellation signal. Cancelling
    /// aborts scheduling, cancels running handles, and returns
    /// [`WeftError::Cancelled`].
    pub async fn run_with_cancel(
        &self,
        params: Params,
        options: RunOptions,
        cancel: CancellationToken,
    ) -> Result<Value, WeftError> {
        let run = Arc::new(RunContext::new(&self.name, params));
        let span = tracing::info_span!("flow", flow = %self.name, run_id = %run.run_id);
        events::emit(
            "flow_started",
            json!({ "flow": self.name.as_ref(), "run_id": run.run_id.to_string() }),
        );

        async {
            let mut cx = BuildContext::new();
            let structure = (self.build)(&mut cx, &run.params);
            if !cx.errors.is_empty() {
                return Err(WeftError::Build(cx.errors.join("; ")));
            }
            let plan = cx.into_plan(&structure);
            let task_count = plan.order.len();

            if task_count == 0 && plan.fanouts.is_empty() {
                events::emit(
                    "flow_completed",
                    json!({
                        "flow": self.name.as_ref(),
                        "run_id": run.run_id.to_string(),
                        "tasks": 0,
                    }),
                );
                return hydrate(&structure, &FxHashMap::default(), &[]);
            }

            let (results, fanouts) = scheduler::execute_plan(
                plan,
                options.failure_policy,
                options.max_concurrency,
                cancel,
                Arc::clone(&run),
            )
            .await?;

            events::emit(
                "flow_completed",
                json!({
                    "flow": self.name.as_ref(),
                    "run_id": run.run_id.to_string(),
                    "tasks": task_count,
                }),
            );
            hydrate(&structure, &results, &fanouts)
        }
        .instrument(span)
        .await
    }

    /// JSON description of the DAG the build callback would produce: nodes
    /// with upstream/policy fields, plus every dynamic placeholder as an
    /// explicit `fanout:<k>` barrier. Pure — nothing executes.
    pub fn describe(&self, params: &Params) -> Result<Value, WeftError> {
        let (plan, _) = self.build_plan(params)?;

        let mut nodes = Vec::with_capacity(plan.order.len());
        for id in &plan.order {
            let inv = &plan.invocations[id];
            let mut upstream: BTreeSet<String> =
                inv.upstream.iter().map(|u| u.to_string()).collect();
            let mut refs = Vec::new();
            for arg in &inv.args {
                arg.fanout_refs(&mut refs);
            }
            for fid in refs {
                upstream.insert(format!("fanout:{}", fid));
            }
            nodes.push(json!({
                "id": id.as_ref(),
                "task": inv.task.name(),
                "upstream": upstream.into_iter().collect::<Vec<_>>(),
                "persist": inv.task.persist(),
                "run_in": inv.task.run_mode().as_str(),
                "retries": inv.task.retries(),
            }));
        }

        let mut dynamic = Vec::with_capacity(plan.fanouts.len());
        for fanout in &plan.fanouts {
            let source = match &fanout.source {
                FanOutSource::Node(id) => id.to_string(),
                FanOutSource::FanOut(parent) => format!("fanout:{}", parent),
            };
            let consumers: Vec<String> = plan
                .consumers_of(fanout.id)
                .iter()
                .map(|c| c.to_string())
                .collect();
            dynamic.push(json!({
                "id": format!("fanout:{}", fanout.id),
                "type": "dynamic_fanout",
                "task": fanout.task.name(),
                "source": source,
                "max_concurrency": fanout.max_concurrency,
                "consumers": consumers,
            }));
        }

        Ok(json!({
            "flow": self.name.as_ref(),
            "nodes": nodes,
            "dynamic_fanouts": dynamic,
            "count": nodes.len(),
            "dynamic_count": dynamic.len(),
        }))
    }

    /// Graphviz DOT export; placeholders render as dashed boxes with edges
    /// from their source and to their consumers.
    pub fn export_dot(&self, params: &Params) -> Result<String, WeftError> {
        let (plan, dag) = self.build_plan(params)?;
        let base = dag.to_dot();
        let mut lines: Vec<String> = base.lines().map(String::from).collect();
        let closing = lines.pop().unwrap_or_else(|| "}".to_string());
        for fanout in &plan.fanouts {
            lines.push(format!(
                "  \"fanout:{}\" [shape=box, style=dashed];",
                fanout.id
            ));
            let source = match &fanout.source {
                FanOutSource::Node(id) => id.to_string(),
                FanOutSource::FanOut(parent) => format!("fanout:{}", parent),
            };
            lines.push(format!("  \"{}\" -> \"fanout:{}\";", source, fanout.id));
            for consumer in plan.consumers_of(fanout.id) {
                lines.push(format!("  \"fanout:{}\" -> \"{}\";", fanout.id, consumer));
            }
        }
        lines.push(closing);
        Ok(lines.join("\n"))
    }

    /// `{id: {upstream, downstream}}` export of the static graph.
    pub fn export_graph(&self, params: &Params) -> Result<Value, WeftError> {
        let (_, dag) = self.build_plan(params)?;
        Ok(dag.to_dict())
    }

    fn build_plan(
        &self,
        params: &Params,
    ) -> Result<(crate::build::Plan, Dag), WeftError> {
        let mut cx = BuildContext::new();
        let structure = (self.build)(&mut cx, params);
        if !cx.errors.is_empty() {
            return Err(WeftError::Build(cx.errors.join("; ")));
        }
        let plan = cx.into_plan(&structure);
        let mut dag = Dag::new();
        for id in &plan.order {
            dag.add_node(id);
            for up in &plan.invocations[id].upstream {
                if plan.invocations.contains_key(up) {
                    dag.add_edge(up, id);
                }
            }
        }
        Ok((plan, dag))
    }
}

/// Substitute invocation placeholders in the user's returned structure with
/// concrete results.
fn hydrate(
    node: &ArgNode,
    results: &FxHashMap<NodeId, NodeResult>,
    fanouts: &[FanOut],
) -> Result<Value, WeftError> {
    match node {
        ArgNode::Value(v) => Ok(v.clone()),
        ArgNode::Node(id) => match results.get(id) {
            Some(Ok(v)) => Ok(v.clone()),
            Some(Err(e)) => Ok(Value::String(e.to_string())),
            None => Err(WeftError::Build(format!("no result for node '{}'", id))),
        },
        ArgNode::FanOut(fid) => {
            let Some(fanout) = fanouts.get(*fid) else {
                return Err(WeftError::Build(format!("unknown fan_out {}", fid)));
            };
            if !fanout.expanded {
                return Err(WeftError::Build(format!(
                    "fan_out {} was never expanded",
                    fid
                )));
            }
            let mut items = Vec::with_capacity(fanout.children.len());
            for child in &fanout.children {
                items.push(hydrate(
                    &ArgNode::Node(NodeId::clone(child)),
                    results,
                    fanouts,
                )?);
            }
            Ok(Value::Array(items))
        }
        ArgNode::Seq(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(hydrate(item, results, fanouts)?);
            }
            Ok(Value::Array(out))
        }
        ArgNode::Map(entries) => {
            let mut out = serde_json::Map::new();
            for (key, value) in entries {
                out.insert(key.clone(), hydrate(value, results, fanouts)?);
            }
            Ok(Value::Object(out))
        }
    }
}
