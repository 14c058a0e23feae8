use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use waypoint_core::error::{Result, StepError, WaypointError};
use waypoint_core::traits::{CleanupHook, EdgeSelector, FnStep, StepFunction};
use waypoint_core::types::State;

/// Immutable description of a graph: nodes, edges, selectors, and how to
/// turn the final state into a result.
///
/// Built with consuming `with_*` methods. Nothing is validated here; edge
/// problems surface when a walk reaches the offending node.
#[derive(Clone)]
pub struct AgentDefinition {
    name: String,
    entry_point: Option<String>,
    initial_state: State,
    nodes: HashMap<String, Arc<dyn StepFunction>>,
    edges: HashMap<String, Vec<String>>,
    selectors: HashMap<String, Arc<dyn EdgeSelector>>,
    output_key: Option<String>,
    cleanup: Option<CleanupHook>,
}

impl AgentDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entry_point: None,
            initial_state: State::new(),
            nodes: HashMap::new(),
            edges: HashMap::new(),
            selectors: HashMap::new(),
            output_key: None,
            cleanup: None,
        }
    }

    /// Register a node. Re-registering an id replaces its step function.
    pub fn with_node(mut self, id: impl Into<String>, step: impl StepFunction) -> Self {
        self.nodes.insert(id.into(), Arc::new(step));
        self
    }

    /// Register a node backed by a synchronous closure.
    pub fn with_node_fn<F>(self, id: impl Into<String>, f: F) -> Self
    where
        F: Fn(State) -> std::result::Result<State, StepError> + Send + Sync + 'static,
    {
        self.with_node(id, FnStep(f))
    }

    /// Register an unconditional edge. Duplicate edges are ignored.
    pub fn with_edge(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        let to = to.into();
        let neighbors = self.edges.entry(from.into()).or_default();
        if !neighbors.contains(&to) {
            neighbors.push(to);
        }
        self
    }

    /// Register a fan-out from `from` to each of `targets`, routed by `selector`.
    pub fn with_conditional_edges<I, S>(
        mut self,
        from: impl Into<String>,
        targets: I,
        selector: impl EdgeSelector,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let from = from.into();
        for target in targets {
            self = self.with_edge(from.clone(), target);
        }
        self.selectors.insert(from, Arc::new(selector));
        self
    }

    pub fn with_entry_point(mut self, node: impl Into<String>) -> Self {
        self.entry_point = Some(node.into());
        self
    }

    pub fn with_initial_state(mut self, state: State) -> Self {
        self.initial_state = state;
        self
    }

    /// Set a single key of the initial state.
    pub fn with_state_value(mut self, key: impl Into<String>, value: Value) -> Self {
        self.initial_state.insert(key.into(), value);
        self
    }

    pub fn with_output_key(mut self, key: impl Into<String>) -> Self {
        self.output_key = Some(key.into());
        self
    }

    pub fn with_cleanup(mut self, hook: CleanupHook) -> Self {
        self.cleanup = Some(hook);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn entry_point(&self) -> Option<&str> {
        self.entry_point.as_deref()
    }

    pub fn initial_state(&self) -> &State {
        &self.initial_state
    }

    pub fn output_key(&self) -> Option<&str> {
        self.output_key.as_deref()
    }

    pub fn node(&self, id: &str) -> Option<Arc<dyn StepFunction>> {
        self.nodes.get(id).cloned()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Outgoing neighbors of a node, in registration order.
    pub fn neighbors(&self, id: &str) -> &[String] {
        self.edges.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub(crate) fn selector(&self, id: &str) -> Option<&Arc<dyn EdgeSelector>> {
        self.selectors.get(id)
    }

    /// Turn the final state into the run's result.
    ///
    /// With an output key the value under that key is returned; a missing key
    /// is a lookup error. Without one the whole state is the result.
    pub fn project_output(&self, state: &State) -> Result<Value> {
        match &self.output_key {
            Some(key) => state
                .get(key)
                .cloned()
                .ok_or_else(|| WaypointError::OutputKeyMissing(key.clone())),
            None => Ok(Value::Object(state.clone())),
        }
    }

    /// Invoke the cleanup hook, if any.
    pub fn run_cleanup(&self, state: &State) {
        if let Some(ref hook) = self.cleanup {
            hook(state);
        }
    }
}

impl std::fmt::Debug for AgentDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut nodes: Vec<&String> = self.nodes.keys().collect();
        nodes.sort();
        f.debug_struct("AgentDefinition")
            .field("name", &self.name)
            .field("entry_point", &self.entry_point)
            .field("nodes", &nodes)
            .field("edges", &self.edges)
            .field("output_key", &self.output_key)
            .field("has_cleanup", &self.cleanup.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn identity(s: State) -> std::result::Result<State, StepError> {
        Ok(s)
    }

    #[test]
    fn test_builder_accumulates() {
        let def = AgentDefinition::new("pipeline")
            .with_node_fn("a", identity)
            .with_node_fn("b", identity)
            .with_edge("a", "b")
            .with_entry_point("a")
            .with_state_value("n", json!(0))
            .with_output_key("n");

        assert_eq!(def.name(), "pipeline");
        assert_eq!(def.entry_point(), Some("a"));
        assert_eq!(def.node_count(), 2);
        assert_eq!(def.neighbors("a"), ["b".to_string()]);
        assert!(def.neighbors("b").is_empty());
        assert_eq!(def.initial_state().get("n"), Some(&json!(0)));
        assert_eq!(def.output_key(), Some("n"));
        assert!(def.node("a").is_some());
        assert!(def.node("zzz").is_none());
    }

    #[test]
    fn test_duplicate_edges_ignored() {
        let def = AgentDefinition::new("d")
            .with_edge("a", "b")
            .with_edge("a", "b");
        assert_eq!(def.neighbors("a").len(), 1);
    }

    #[test]
    fn test_conditional_edges_register_selector() {
        let def = AgentDefinition::new("d").with_conditional_edges(
            "route",
            ["left", "right"],
            |_s: &State| "left".to_string(),
        );
        assert_eq!(def.neighbors("route"), ["left".to_string(), "right".to_string()]);
        assert!(def.selector("route").is_some());
        assert!(def.selector("left").is_none());
    }

    #[test]
    fn test_project_output_with_key() {
        let def = AgentDefinition::new("d").with_output_key("result");
        let mut state = State::new();
        state.insert("result".into(), json!(42));
        state.insert("scratch".into(), json!("x"));

        assert_eq!(def.project_output(&state).unwrap(), json!(42));
    }

    #[test]
    fn test_project_output_whole_state() {
        let def = AgentDefinition::new("d");
        let mut state = State::new();
        state.insert("result".into(), json!(42));
        state.insert("scratch".into(), json!("x"));

        assert_eq!(
            def.project_output(&state).unwrap(),
            json!({"result": 42, "scratch": "x"})
        );
    }

    #[test]
    fn test_project_output_missing_key() {
        let def = AgentDefinition::new("d").with_output_key("answer");
        let err = def.project_output(&State::new()).unwrap_err();
        assert!(matches!(err, WaypointError::OutputKeyMissing(k) if k == "answer"));
    }

    #[test]
    fn test_cleanup_invoked() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let def = AgentDefinition::new("d").with_cleanup(Arc::new(move |_s: &State| {
            c.fetch_add(1, Ordering::SeqCst);
        }));

        def.run_cleanup(&State::new());
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // No hook: nothing to do
        AgentDefinition::new("bare").run_cleanup(&State::new());
    }

    #[test]
    fn test_clone_shares_step_functions() {
        let def = AgentDefinition::new("d").with_node_fn("a", identity);
        let copy = def.clone().with_node_fn("b", identity);
        assert_eq!(def.node_count(), 1);
        assert_eq!(copy.node_count(), 2);
    }
}
