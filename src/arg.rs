//! Argument trees passed to task invocations.
//!
//! During flow build, task arguments are not plain values: they can embed
//! references to other invocations and to dynamic fan-out placeholders, nested
//! arbitrarily inside sequences and mappings. [`ArgNode`] is the tagged union
//! the scheduler walks without any runtime reflection.

use std::sync::Arc;

use serde_json::Value;

/// Deterministic node identifier, `"<task>:<seq>"`.
///
/// `Arc<str>` for zero-cost cloning across the graph, results map, and events.
pub type NodeId = Arc<str>;

/// Index of a fan-out placeholder within its build context.
pub type FanOutId = usize;

/// One node of an argument tree.
#[derive(Debug, Clone)]
pub enum ArgNode {
    /// Plain JSON leaf.
    Value(Value),
    /// Reference to another invocation's result.
    Node(NodeId),
    /// Reference to a dynamic fan-out placeholder (resolves to an array of
    /// child results once expanded).
    FanOut(FanOutId),
    /// Ordered sequence, hydrated to a JSON array.
    Seq(Vec<ArgNode>),
    /// Key/value mapping, hydrated to a JSON object. Keeps insertion order.
    Map(Vec<(String, ArgNode)>),
}

impl ArgNode {
    pub fn value(v: impl Into<Value>) -> Self {
        ArgNode::Value(v.into())
    }

    pub fn seq(items: impl IntoIterator<Item = ArgNode>) -> Self {
        ArgNode::Seq(items.into_iter().collect())
    }

    pub fn map(entries: impl IntoIterator<Item = (String, ArgNode)>) -> Self {
        ArgNode::Map(entries.into_iter().collect())
    }

    /// Pre-order walk over the tree.
    pub fn visit(&self, f: &mut impl FnMut(&ArgNode)) {
        f(self);
        match self {
            ArgNode::Seq(items) => {
                for item in items {
                    item.visit(f);
                }
            }
            ArgNode::Map(entries) => {
                for (_, v) in entries {
                    v.visit(f);
                }
            }
            ArgNode::Value(_) | ArgNode::Node(_) | ArgNode::FanOut(_) => {}
        }
    }

    /// Replace every reference to fan-out `id` with `replacement`, in place.
    /// Returns true if at least one occurrence was rewritten.
    pub(crate) fn replace_fanout(&mut self, id: FanOutId, replacement: &ArgNode) -> bool {
        match self {
            ArgNode::FanOut(fid) if *fid == id => {
                *self = replacement.clone();
                true
            }
            ArgNode::Seq(items) => {
                let mut hit = false;
                for item in items {
                    hit |= item.replace_fanout(id, replacement);
                }
                hit
            }
            ArgNode::Map(entries) => {
                let mut hit = false;
                for (_, v) in entries {
                    hit |= v.replace_fanout(id, replacement);
                }
                hit
            }
            _ => false,
        }
    }

    /// Collect every fan-out id referenced anywhere in the tree.
    pub(crate) fn fanout_refs(&self, out: &mut Vec<FanOutId>) {
        self.visit(&mut |node| {
            if let ArgNode::FanOut(id) = node {
                if !out.contains(id) {
                    out.push(*id);
                }
            }
        });
    }
}

impl From<Value> for ArgNode {
    fn from(v: Value) -> Self {
        ArgNode::Value(v)
    }
}

impl From<i64> for ArgNode {
    fn from(v: i64) -> Self {
        ArgNode::Value(Value::from(v))
    }
}

impl From<f64> for ArgNode {
    fn from(v: f64) -> Self {
        ArgNode::Value(Value::from(v))
    }
}

impl From<bool> for ArgNode {
    fn from(v: bool) -> Self {
        ArgNode::Value(Value::from(v))
    }
}

impl From<&str> for ArgNode {
    fn from(v: &str) -> Self {
        ArgNode::Value(Value::from(v))
    }
}
