use std::sync::Arc;

use futures::future::BoxFuture;

use crate::error::StepError;
use crate::types::State;

/// Callback receiving incremental text emitted by a step.
pub type Emit = Arc<dyn Fn(&str) + Send + Sync>;

/// Hook run once with the final state when a walk ends.
pub type CleanupHook = Arc<dyn Fn(&State) + Send + Sync>;

/// Per-invocation context handed to a step function.
#[derive(Clone)]
pub struct StepContext {
    node: String,
    attempt: u32,
    emit: Option<Emit>,
}

impl StepContext {
    pub fn new(node: impl Into<String>, attempt: u32, emit: Option<Emit>) -> Self {
        Self {
            node: node.into(),
            attempt,
            emit,
        }
    }

    /// Context with no fragment sink, used outside the engine.
    pub fn detached(node: impl Into<String>) -> Self {
        Self::new(node, 1, None)
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    /// 1-based attempt number.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Publish a text fragment before the step completes.
    pub fn emit(&self, text: impl AsRef<str>) {
        if let Some(ref emit) = self.emit {
            emit(text.as_ref());
        }
    }
}

impl std::fmt::Debug for StepContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepContext")
            .field("node", &self.node)
            .field("attempt", &self.attempt)
            .field("has_emit", &self.emit.is_some())
            .finish()
    }
}

/// The work a node performs on the state.
pub trait StepFunction: Send + Sync + 'static {
    /// Transform the state, or fail.
    fn call(&self, state: State, ctx: StepContext) -> BoxFuture<'_, Result<State, StepError>>;
}

/// Adapter turning a synchronous closure into a [`StepFunction`].
pub struct FnStep<F>(pub F);

impl<F> StepFunction for FnStep<F>
where
    F: Fn(State) -> Result<State, StepError> + Send + Sync + 'static,
{
    fn call(&self, state: State, _ctx: StepContext) -> BoxFuture<'_, Result<State, StepError>> {
        let result = (self.0)(state);
        Box::pin(async move { result })
    }
}

/// Conditional selector choosing the next node from the freshly produced state.
pub trait EdgeSelector: Send + Sync + 'static {
    fn select(&self, state: &State) -> String;
}

impl<F> EdgeSelector for F
where
    F: Fn(&State) -> String + Send + Sync + 'static,
{
    fn select(&self, state: &State) -> String {
        self(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    #[test]
    fn test_fn_step_transforms_state() {
        let step = FnStep(|mut s: State| {
            s.insert("seen".into(), json!(true));
            Ok(s)
        });
        let out = futures::executor::block_on(step.call(State::new(), StepContext::detached("a")))
            .unwrap();
        assert_eq!(out.get("seen"), Some(&json!(true)));
    }

    #[test]
    fn test_fn_step_propagates_error() {
        let step = FnStep(|_s: State| Err(StepError::failed("nope")));
        let err = futures::executor::block_on(step.call(State::new(), StepContext::detached("a")))
            .unwrap_err();
        assert_eq!(err, StepError::failed("nope"));
    }

    #[test]
    fn test_emit_forwards_to_sink() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let ctx = StepContext::new(
            "writer",
            2,
            Some(Arc::new(move |t: &str| sink.lock().unwrap().push(t.to_string()))),
        );
        ctx.emit("hel");
        ctx.emit("lo");

        assert_eq!(ctx.node(), "writer");
        assert_eq!(ctx.attempt(), 2);
        assert_eq!(*seen.lock().unwrap(), vec!["hel", "lo"]);
    }

    #[test]
    fn test_detached_emit_is_noop() {
        StepContext::detached("a").emit("dropped");
    }

    #[test]
    fn test_closure_selector() {
        let selector = |s: &State| {
            if s.get("ok") == Some(&json!(true)) {
                "yes".to_string()
            } else {
                "no".to_string()
            }
        };
        let mut state = State::new();
        assert_eq!(selector.select(&state), "no");
        state.insert("ok".into(), json!(true));
        assert_eq!(selector.select(&state), "yes");
    }
}
