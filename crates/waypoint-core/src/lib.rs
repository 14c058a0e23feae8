pub mod config;
pub mod error;
pub mod event;
pub mod hooks;
pub mod traits;
pub mod types;

pub use config::AppConfig;
pub use error::{Result, StepError, WaypointError};
pub use event::EventBus;
pub use traits::{CleanupHook, EdgeSelector, FnStep, StepContext, StepFunction};
pub use types::*;
