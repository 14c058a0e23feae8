use thiserror::Error;

/// Failure reported by a step function.
///
/// The engine only sees this classification: `ShapeMismatch` is eligible for
/// retry with backoff, everything else ends the execution.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StepError {
    /// The step produced a value of the wrong shape (e.g. malformed model output).
    #[error("output did not match the expected shape: {0}")]
    ShapeMismatch(String),

    #[error("{0}")]
    Failed(String),
}

impl StepError {
    pub fn shape_mismatch(msg: impl Into<String>) -> Self {
        Self::ShapeMismatch(msg.into())
    }

    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }

    /// Whether the engine may retry this failure.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::ShapeMismatch(_))
    }
}

#[derive(Debug, Error)]
pub enum WaypointError {
    // Step errors
    #[error("Step '{node}' failed after {attempts} attempt(s): {source}")]
    Step {
        node: String,
        attempts: u32,
        #[source]
        source: StepError,
    },

    // Graph errors
    #[error("Graph definition error: {0}")]
    GraphDefinition(String),

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Output key not found in final state: {0}")]
    OutputKeyMissing(String),

    // Execution errors
    #[error("Agent definition is missing required field: {0}")]
    MissingField(&'static str),

    #[error("Invalid execution id: {0:?}")]
    InvalidId(String),

    #[error("Execution already exists: {0}")]
    DuplicateExecution(String),

    #[error("Execution not found: {0}")]
    ExecutionNotFound(String),

    #[error("Execution already started: {0}")]
    AlreadyStarted(String),

    #[error("Execution still running: {0}")]
    ExecutionRunning(String),

    #[error("Execution exceeded step budget ({0})")]
    StepBudgetExceeded(usize),

    #[error("Execution cancelled")]
    Cancelled,

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl WaypointError {
    /// Errors caused by a malformed agent definition rather than a runtime condition.
    pub fn is_definition_error(&self) -> bool {
        matches!(self, Self::GraphDefinition(_) | Self::NodeNotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, WaypointError>;
