use serde_json::Value;
use tracing::debug;

use waypoint_core::error::{Result, WaypointError};
use waypoint_core::traits::StepContext;
use waypoint_core::types::{State, END};

use super::definition::AgentDefinition;

/// Result of a synchronous walk.
#[derive(Debug, Clone)]
pub struct WalkTrace {
    /// Nodes in the order they ran.
    pub path: Vec<String>,
    pub final_state: State,
    pub output: Value,
}

/// Walks a definition in the caller's own thread.
///
/// Same edge selection as the engine, but step futures are driven in place:
/// no spawned tasks, no retries, no publishing, and the first step error is
/// returned as-is. The cleanup hook is not run. Step functions that need
/// tokio timers or I/O must run on the engine instead.
#[derive(Debug, Clone, Default)]
pub struct Walker {
    max_steps: Option<usize>,
}

impl Walker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail with `StepBudgetExceeded` after `max` steps.
    pub fn with_max_steps(mut self, max: usize) -> Self {
        self.max_steps = Some(max);
        self
    }

    /// Run to the terminal marker and return the projected output.
    pub fn run(&self, definition: &AgentDefinition) -> Result<Value> {
        self.trace(definition).map(|t| t.output)
    }

    /// Run to the terminal marker, keeping the visited path and final state.
    pub fn trace(&self, definition: &AgentDefinition) -> Result<WalkTrace> {
        futures::executor::block_on(self.walk(definition))
    }

    async fn walk(&self, definition: &AgentDefinition) -> Result<WalkTrace> {
        let mut current = definition
            .entry_point()
            .ok_or(WaypointError::MissingField("entry_point"))?
            .to_string();
        let mut state = definition.initial_state().clone();
        let mut path = Vec::new();

        while current != END {
            if let Some(max) = self.max_steps {
                if path.len() >= max {
                    return Err(WaypointError::StepBudgetExceeded(max));
                }
            }

            let step = definition
                .node(&current)
                .ok_or_else(|| WaypointError::NodeNotFound(current.clone()))?;

            debug!(node = %current, "Walking node");
            state = step
                .call(state, StepContext::detached(current.as_str()))
                .await
                .map_err(|source| WaypointError::Step {
                    node: current.clone(),
                    attempts: 1,
                    source,
                })?;

            let next = definition.next_node(&current, &state)?;
            path.push(std::mem::replace(&mut current, next));
        }

        let output = definition.project_output(&state)?;
        Ok(WalkTrace {
            path,
            final_state: state,
            output,
        })
    }
}
