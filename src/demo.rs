//! Built-in agent definitions for the `run` and `walk` commands.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::ValueEnum;
use futures::future::BoxFuture;
use serde_json::{json, Value};
use tracing::info;

use waypoint_agent::AgentDefinition;
use waypoint_core::traits::{StepContext, StepFunction};
use waypoint_core::types::{State, END};
use waypoint_core::StepError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Demo {
    /// Three nodes in a row, each bumping a counter
    Counter,
    /// Route to `even` or `odd` based on the input value
    Branch,
    /// A node that returns malformed output twice before succeeding
    Flaky,
}

impl Demo {
    pub fn definition(self, input: Option<i64>) -> AgentDefinition {
        match self {
            Demo::Counter => counter(input.unwrap_or(0)),
            Demo::Branch => branch(input.unwrap_or(7)),
            Demo::Flaky => flaky(),
        }
    }
}

fn bump(mut state: State) -> Result<State, StepError> {
    let n = state.get("n").and_then(Value::as_i64).unwrap_or(0);
    state.insert("n".into(), json!(n + 1));
    Ok(state)
}

fn counter(start: i64) -> AgentDefinition {
    AgentDefinition::new("counter")
        .with_node_fn("first", bump)
        .with_node_fn("second", bump)
        .with_node_fn("third", bump)
        .with_edge("first", "second")
        .with_edge("second", "third")
        .with_edge("third", END)
        .with_entry_point("first")
        .with_state_value("n", json!(start))
        .with_output_key("n")
}

fn branch(value: i64) -> AgentDefinition {
    AgentDefinition::new("branch")
        .with_node_fn("classify", |mut s: State| {
            let value = s
                .get("value")
                .and_then(Value::as_i64)
                .ok_or_else(|| StepError::shape_mismatch("'value' must be an integer"))?;
            s.insert("parity".into(), json!(if value % 2 == 0 { "even" } else { "odd" }));
            Ok(s)
        })
        .with_node_fn("even", |mut s: State| {
            s.insert("verdict".into(), json!("an even number"));
            Ok(s)
        })
        .with_node_fn("odd", |mut s: State| {
            s.insert("verdict".into(), json!("an odd number"));
            Ok(s)
        })
        .with_conditional_edges("classify", ["even", "odd"], |s: &State| {
            s.get("parity")
                .and_then(Value::as_str)
                .unwrap_or("odd")
                .to_string()
        })
        .with_entry_point("classify")
        .with_state_value("value", json!(value))
        .with_output_key("verdict")
}

/// Streams a summary word by word, but produces a malformed result on its
/// first `bad_attempts` calls.
struct Summarize {
    bad_attempts: u32,
    calls: AtomicU32,
}

impl StepFunction for Summarize {
    fn call(&self, mut state: State, ctx: StepContext) -> BoxFuture<'_, Result<State, StepError>> {
        Box::pin(async move {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            let words = ["graph", "walked", "to", "the", "end"];
            for word in words {
                ctx.emit(format!("{} ", word));
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            ctx.emit("\n");
            if call <= self.bad_attempts {
                return Err(StepError::shape_mismatch(format!(
                    "summary on call {} was not valid JSON",
                    call
                )));
            }
            state.insert("summary".into(), json!(words.join(" ")));
            Ok(state)
        })
    }
}

fn flaky() -> AgentDefinition {
    AgentDefinition::new("flaky")
        .with_node_fn("prepare", |mut s: State| {
            s.insert("topic".into(), json!("retries"));
            Ok(s)
        })
        .with_node(
            "summarize",
            Summarize {
                bad_attempts: 2,
                calls: AtomicU32::new(0),
            },
        )
        .with_edge("prepare", "summarize")
        .with_edge("summarize", END)
        .with_entry_point("prepare")
        .with_cleanup(Arc::new(|state: &State| {
            info!(keys = state.len(), "Cleanup ran");
        }))
}
