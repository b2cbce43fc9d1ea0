//! Internal DAG representation: deterministic topological sort and cycle
//! detection.
//!
//! Nodes and edges live in ordered maps so every traversal — the sort, the
//! exports, the error paths — is reproducible regardless of insertion order.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::{json, Value};

use crate::arg::NodeId;
use crate::error::WeftError;

#[derive(Debug, Default, Clone)]
pub struct DagNode {
    pub upstream: BTreeSet<NodeId>,
    pub downstream: BTreeSet<NodeId>,
}

/// Dependency graph over node ids.
#[derive(Debug, Default, Clone)]
pub struct Dag {
    nodes: BTreeMap<NodeId, DagNode>,
}

impl Dag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent.
    pub fn add_node(&mut self, id: &NodeId) {
        self.nodes.entry(NodeId::clone(id)).or_default();
    }

    /// Idempotent; creates both endpoints if missing.
    pub fn add_edge(&mut self, upstream: &NodeId, downstream: &NodeId) {
        self.add_node(upstream);
        self.add_node(downstream);
        self.nodes
            .get_mut(upstream)
            .expect("node just inserted")
            .downstream
            .insert(NodeId::clone(downstream));
        self.nodes
            .get_mut(downstream)
            .expect("node just inserted")
            .upstream
            .insert(NodeId::clone(upstream));
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: &str) -> Option<&DagNode> {
        self.nodes.get(id)
    }

    pub fn downstream_of<'a>(&'a self, id: &str) -> impl Iterator<Item = &'a NodeId> + 'a {
        self.nodes
            .get(id)
            .into_iter()
            .flat_map(|n| n.downstream.iter())
    }

    pub fn upstream_of<'a>(&'a self, id: &str) -> impl Iterator<Item = &'a NodeId> + 'a {
        self.nodes
            .get(id)
            .into_iter()
            .flat_map(|n| n.upstream.iter())
    }

    /// Kahn's algorithm with a sorted ready frontier: ties break by
    /// lexicographic node id, so the order is a total function of the graph.
    pub fn topological_sort(&self) -> Result<Vec<NodeId>, WeftError> {
        let mut in_degree: BTreeMap<&NodeId, usize> = self
            .nodes
            .iter()
            .map(|(id, node)| (id, node.upstream.len()))
            .collect();

        let mut frontier: BTreeSet<&NodeId> = in_degree
            .iter()
            .filter(|(_, &deg)| deg == 0)
            .map(|(&id, _)| id)
            .collect();

        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(&current) = frontier.iter().next() {
            frontier.remove(current);
            order.push(NodeId::clone(current));
            for child in &self.nodes[current].downstream {
                let deg = in_degree.get_mut(child).expect("edge endpoint registered");
                *deg -= 1;
                if *deg == 0 {
                    frontier.insert(child);
                }
            }
        }

        if order.len() != self.nodes.len() {
            let remaining: Vec<String> = in_degree
                .iter()
                .filter(|(_, &deg)| deg > 0)
                .map(|(id, _)| id.to_string())
                .collect();
            return Err(WeftError::Cycle { ids: remaining });
        }
        Ok(order)
    }

    /// Restriction of the graph to `names` (edges with both endpoints kept).
    pub fn subgraph<'a>(&self, names: impl IntoIterator<Item = &'a str>) -> Dag {
        let keep: BTreeSet<&str> = names.into_iter().collect();
        let mut sub = Dag::new();
        for (id, node) in &self.nodes {
            if !keep.contains(id.as_ref()) {
                continue;
            }
            sub.add_node(id);
            for down in &node.downstream {
                if keep.contains(down.as_ref()) {
                    sub.add_edge(id, down);
                }
            }
        }
        sub
    }

    /// Graphviz export. Sink nodes are emitted standalone so they stay
    /// visible.
    pub fn to_dot(&self) -> String {
        let mut lines = vec!["digraph G {".to_string()];
        for (id, node) in &self.nodes {
            if node.downstream.is_empty() {
                lines.push(format!("  \"{}\";", id));
            }
            for down in &node.downstream {
                lines.push(format!("  \"{}\" -> \"{}\";", id, down));
            }
        }
        lines.push("}".to_string());
        lines.join("\n")
    }

    /// JSON export: `{id: {upstream: [...], downstream: [...]}}`.
    pub fn to_dict(&self) -> Value {
        let mut out = serde_json::Map::new();
        for (id, node) in &self.nodes {
            let ups: Vec<&str> = node.upstream.iter().map(|s| s.as_ref()).collect();
            let downs: Vec<&str> = node.downstream.iter().map(|s| s.as_ref()).collect();
            out.insert(
                id.to_string(),
                json!({ "upstream": ups, "downstream": downs }),
            );
        }
        Value::Object(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> NodeId {
        NodeId::from(s)
    }

    #[test]
    fn sort_is_deterministic_across_insertion_orders() {
        let mut a = Dag::new();
        a.add_edge(&id("a:1"), &id("c:1"));
        a.add_edge(&id("b:1"), &id("c:1"));

        let mut b = Dag::new();
        b.add_edge(&id("b:1"), &id("c:1"));
        b.add_edge(&id("a:1"), &id("c:1"));

        assert_eq!(a.topological_sort().unwrap(), b.topological_sort().unwrap());
    }

    #[test]
    fn ready_ties_break_lexicographically() {
        let mut dag = Dag::new();
        dag.add_node(&id("zeta:1"));
        dag.add_node(&id("alpha:1"));
        dag.add_node(&id("mid:1"));
        let order = dag.topological_sort().unwrap();
        let names: Vec<&str> = order.iter().map(|s| s.as_ref()).collect();
        assert_eq!(names, vec!["alpha:1", "mid:1", "zeta:1"]);
    }

    #[test]
    fn cycle_reports_remaining_ids() {
        let mut dag = Dag::new();
        dag.add_edge(&id("a:1"), &id("b:1"));
        dag.add_edge(&id("b:1"), &id("a:1"));
        dag.add_node(&id("free:1"));
        match dag.topological_sort() {
            Err(WeftError::Cycle { ids }) => {
                assert_eq!(ids, vec!["a:1".to_string(), "b:1".to_string()]);
            }
            other => panic!("expected cycle, got {:?}", other.map(|v| v.len())),
        }
    }

    #[test]
    fn add_edge_is_idempotent() {
        let mut dag = Dag::new();
        dag.add_edge(&id("a:1"), &id("b:1"));
        dag.add_edge(&id("a:1"), &id("b:1"));
        assert_eq!(dag.node("b:1").unwrap().upstream.len(), 1);
        assert_eq!(dag.len(), 2);
    }

    #[test]
    fn dot_lists_edges_and_sinks() {
        let mut dag = Dag::new();
        dag.add_edge(&id("a:1"), &id("b:1"));
        let dot = dag.to_dot();
        assert!(dot.starts_with("digraph G {"));
        assert!(dot.contains("\"a:1\" -> \"b:1\";"));
        assert!(dot.contains("  \"b:1\";"));
    }

    #[test]
    fn dict_export_is_sorted() {
        let mut dag = Dag::new();
        dag.add_edge(&id("x:1"), &id("y:1"));
        let dict = dag.to_dict();
        assert_eq!(dict["x:1"]["downstream"][0], "y:1");
        assert_eq!(dict["y:1"]["upstream"][0], "x:1");
    }

    #[test]
    fn subgraph_keeps_internal_edges_only() {
        let mut dag = Dag::new();
        dag.add_edge(&id("a:1"), &id("b:1"));
        dag.add_edge(&id("b:1"), &id("c:1"));
        let sub = dag.subgraph(["a:1", "b:1"]);
        assert_eq!(sub.len(), 2);
        assert!(sub.node("b:1").unwrap().downstream.is_empty());
    }
}
