use std::panic::AssertUnwindSafe;

use waypoint_core::error::{Result, WaypointError};
use waypoint_core::types::{State, END};

use super::definition::AgentDefinition;
use crate::panic_message;

impl AgentDefinition {
    /// Choose the node that follows `node`, given the state it just produced.
    ///
    /// - no outgoing edges: the walk ends ([`END`])
    /// - one edge: follow it
    /// - several edges: ask the registered selector; its answer must be one
    ///   of the registered neighbors, and a panicking selector is a
    ///   definition error
    pub fn next_node(&self, node: &str, state: &State) -> Result<String> {
        let neighbors = self.neighbors(node);
        match neighbors {
            [] => Ok(END.to_string()),
            [only] => Ok(only.clone()),
            _ => {
                let selector = self.selector(node).ok_or_else(|| {
                    WaypointError::GraphDefinition(format!(
                        "node '{}' has {} outgoing edges but no conditional selector",
                        node,
                        neighbors.len()
                    ))
                })?;
                let chosen = std::panic::catch_unwind(AssertUnwindSafe(|| selector.select(state)))
                    .map_err(|payload| {
                        WaypointError::GraphDefinition(format!(
                            "selector for node '{}' panicked: {}",
                            node,
                            panic_message(payload)
                        ))
                    })?;
                if neighbors.iter().any(|n| *n == chosen) {
                    Ok(chosen)
                } else {
                    Err(WaypointError::GraphDefinition(format!(
                        "selector for node '{}' chose '{}', expected one of [{}]",
                        node,
                        chosen,
                        neighbors.join(", ")
                    )))
                }
            }
        }
    }
}
