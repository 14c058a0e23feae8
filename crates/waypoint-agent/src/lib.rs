pub mod engine;
pub mod graph;
pub mod retry;
pub mod run_log;

pub use engine::{Engine, FragmentSink};
pub use graph::{AgentDefinition, WalkTrace, Walker};
pub use retry::RetryPolicy;
pub use run_log::RunLogger;

/// Best-effort text of a caught panic payload.
pub(crate) fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
