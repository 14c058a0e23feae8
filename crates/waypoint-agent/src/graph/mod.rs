//! Agent definitions and how they are walked.
//!
//! An [`AgentDefinition`] is a directed graph of named step functions. After
//! each step the edge table (and, for fan-out, a conditional selector) picks
//! the next node until the walk reaches [`END`](waypoint_core::types::END).
//!
//! The [`Walker`] drives a definition in the caller's thread. The async
//! [`Engine`](crate::engine::Engine) uses the same edge rules, adding retries,
//! step history and pub/sub.

pub mod definition;
pub mod edge;
pub mod walker;

pub use definition::AgentDefinition;
pub use walker::{WalkTrace, Walker};
