use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The state threaded through a walk: an insertion-ordered JSON object.
pub type State = serde_json::Map<String, serde_json::Value>;

/// Terminal marker. An edge pointing here ends the walk.
pub const END: &str = "__end__";

/// Caller-supplied unique execution identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct ExecutionId(pub String);

impl ExecutionId {
    /// Generate a random id for callers that do not bring their own.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ExecutionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ExecutionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle status shared by executions and their steps.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    NotStarted,
    Running,
    Done,
    Failed,
}

impl RunStatus {
    /// `Done` and `Failed` have no outgoing transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::NotStarted => "not_started",
            Self::Running => "running",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Record of one node visit. Retries of the same node share a single step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub node: String,
    pub status: RunStatus,
    pub input_state: State,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_state: Option<State>,
    /// Number of times the step function was invoked for this step.
    pub attempts: u32,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Step {
    pub fn running(node: impl Into<String>, input_state: State) -> Self {
        Self {
            node: node.into(),
            status: RunStatus::Running,
            input_state,
            output_state: None,
            attempts: 0,
            started_at: Utc::now(),
            finished_at: None,
        }
    }
}

/// One run of an agent definition.
///
/// The engine's coordinator owns the authoritative copy; everything handed
/// out to callers and subscribers is a clone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: ExecutionId,
    pub agent: String,
    pub status: RunStatus,
    pub current_node: Option<String>,
    pub current_state: State,
    pub steps: Vec<Step>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Projected result, set once the execution is `Done`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Execution {
    pub fn new(
        id: ExecutionId,
        agent: impl Into<String>,
        entry_point: impl Into<String>,
        initial_state: State,
    ) -> Self {
        Self {
            id,
            agent: agent.into(),
            status: RunStatus::NotStarted,
            current_node: Some(entry_point.into()),
            current_state: initial_state,
            steps: Vec::new(),
            error_message: None,
            output: None,
            started_at: None,
            finished_at: None,
        }
    }

    /// The step currently being executed, or the last one recorded.
    pub fn last_step(&self) -> Option<&Step> {
        self.steps.last()
    }

    pub fn last_step_mut(&mut self) -> Option<&mut Step> {
        self.steps.last_mut()
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Kind of line published on an execution's log topic.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogKind {
    /// Incremental text emitted by a running step function.
    Output,
    /// A step attempt failed recoverably and will be retried.
    Retry,
    StepCompleted,
    Completed,
    Failed,
}

/// A single item on an execution's log topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogFragment {
    pub execution_id: ExecutionId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
    pub kind: LogKind,
    pub text: String,
}

impl LogFragment {
    pub fn new(
        execution_id: ExecutionId,
        node: Option<String>,
        kind: LogKind,
        text: impl Into<String>,
    ) -> Self {
        Self {
            execution_id,
            node,
            kind,
            text: text.into(),
        }
    }
}

/// Published on the global feed whenever an execution starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionStarted {
    pub execution_id: ExecutionId,
    pub agent: String,
    pub started_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_terminal() {
        assert!(!RunStatus::NotStarted.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::Done.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
    }

    #[test]
    fn test_status_serializes_snake_case() {
        assert_eq!(
            serde_json::to_value(RunStatus::NotStarted).unwrap(),
            json!("not_started")
        );
        assert_eq!(RunStatus::Failed.to_string(), "failed");
    }

    #[test]
    fn test_new_execution_points_at_entry() {
        let mut state = State::new();
        state.insert("n".into(), json!(0));
        let exec = Execution::new("run-1".into(), "counter", "a", state);

        assert_eq!(exec.status, RunStatus::NotStarted);
        assert_eq!(exec.current_node.as_deref(), Some("a"));
        assert_eq!(exec.current_state.get("n"), Some(&json!(0)));
        assert!(exec.steps.is_empty());
        assert!(exec.last_step().is_none());
    }

    #[test]
    fn test_last_step_mut_updates_in_place() {
        let mut exec = Execution::new("run-2".into(), "x", "a", State::new());
        exec.steps.push(Step::running("a", State::new()));
        exec.steps.push(Step::running("b", State::new()));

        exec.last_step_mut().unwrap().status = RunStatus::Done;

        assert_eq!(exec.steps[0].status, RunStatus::Running);
        assert_eq!(exec.steps[1].status, RunStatus::Done);
    }

    #[test]
    fn test_state_preserves_insertion_order() {
        let mut state = State::new();
        state.insert("zeta".into(), json!(1));
        state.insert("alpha".into(), json!(2));
        let keys: Vec<&String> = state.keys().collect();
        assert_eq!(keys, vec!["zeta", "alpha"]);
    }
}
