//! Flow registry: the CLI's lookup table.
//!
//! A compiled binary cannot load flows by module path the way a dynamic
//! runtime would, so hosts register their flows under `module:name` keys and
//! hand the registry to [`crate::cli::run`].

use std::collections::BTreeMap;

use crate::flow::Flow;

#[derive(Default)]
pub struct FlowRegistry {
    flows: BTreeMap<String, Flow>,
}

impl FlowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `flow` under `module`, keyed as `module:<flow name>`.
    pub fn register(&mut self, module: &str, flow: Flow) {
        let key = format!("{}:{}", module, flow.name());
        self.flows.insert(key, flow);
    }

    /// Look up by full `module:flow` path.
    pub fn get(&self, path: &str) -> Option<&Flow> {
        self.flows.get(path)
    }

    /// Flows registered under `module`, sorted by name.
    pub fn module_flows(&self, module: &str) -> Vec<&Flow> {
        let prefix = format!("{}:", module);
        self.flows
            .iter()
            .filter(|(key, _)| key.starts_with(&prefix))
            .map(|(_, flow)| flow)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arg::ArgNode;
    use crate::flow::flow;

    fn sample(name: &str) -> Flow {
        flow(name, |_cx, _params| ArgNode::from(0))
    }

    #[test]
    fn lookup_uses_module_and_flow_name() {
        let mut registry = FlowRegistry::new();
        registry.register("pipelines", sample("daily"));
        registry.register("pipelines", sample("hourly"));
        registry.register("reports", sample("daily"));

        assert!(registry.get("pipelines:daily").is_some());
        assert!(registry.get("reports:daily").is_some());
        assert!(registry.get("pipelines:weekly").is_none());
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn module_listing_is_sorted_and_scoped() {
        let mut registry = FlowRegistry::new();
        registry.register("pipelines", sample("b"));
        registry.register("pipelines", sample("a"));
        registry.register("other", sample("c"));

        let names: Vec<&str> = registry
            .module_flows("pipelines")
            .iter()
            .map(|f| f.name())
            .collect();
        assert_eq!(names, vec!["a", "b"]);
    }
}
