//! Shared mocks and fixtures for Waypoint tests.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::Value;

use waypoint_core::config::{AppConfig, RetryConfig};
use waypoint_core::traits::{CleanupHook, FnStep, StepContext, StepFunction};
use waypoint_core::{State, StepError};

/// Build a [`State`] from a JSON object literal. Non-objects yield an empty state.
pub fn state(value: Value) -> State {
    match value {
        Value::Object(map) => map,
        _ => State::new(),
    }
}

/// Config with instant retries, for tests that exercise the retry path.
pub fn fast_config() -> AppConfig {
    AppConfig {
        retry: RetryConfig {
            max_attempts: 3,
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
            jitter: false,
        },
        ..AppConfig::default()
    }
}

/// Step that adds one to the integer at `key` (missing counts as 0).
pub fn increment(key: &'static str) -> FnStep<impl Fn(State) -> Result<State, StepError> + Send + Sync> {
    FnStep(move |mut s: State| {
        let n = s.get(key).and_then(Value::as_i64).unwrap_or(0);
        s.insert(key.to_string(), Value::from(n + 1));
        Ok(s)
    })
}

/// Step that sets `key` to `value`.
pub fn set(
    key: &'static str,
    value: Value,
) -> FnStep<impl Fn(State) -> Result<State, StepError> + Send + Sync> {
    FnStep(move |mut s: State| {
        s.insert(key.to_string(), value.clone());
        Ok(s)
    })
}

/// Step that fails with `error` for the first `failures` calls, then passes state through.
pub struct FlakyStep {
    failures: u32,
    error: StepError,
    calls: Arc<AtomicU32>,
}

impl FlakyStep {
    pub fn new(failures: u32, error: StepError) -> Self {
        Self {
            failures,
            error,
            calls: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Fails on every call.
    pub fn always(error: StepError) -> Self {
        Self::new(u32::MAX, error)
    }

    /// Shared call counter, readable after the step has been moved into a definition.
    pub fn calls(&self) -> Arc<AtomicU32> {
        self.calls.clone()
    }
}

impl StepFunction for FlakyStep {
    fn call(&self, state: State, _ctx: StepContext) -> BoxFuture<'_, Result<State, StepError>> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        let result = if n < self.failures {
            Err(self.error.clone())
        } else {
            Ok(state)
        };
        Box::pin(async move { result })
    }
}

/// Step that emits each fragment, then stores their concatenation under `key`.
pub struct StreamingStep {
    key: &'static str,
    fragments: Vec<String>,
    pause: Duration,
}

impl StreamingStep {
    pub fn new(key: &'static str, fragments: &[&str]) -> Self {
        Self {
            key,
            fragments: fragments.iter().map(|f| f.to_string()).collect(),
            pause: Duration::from_millis(1),
        }
    }
}

impl StepFunction for StreamingStep {
    fn call(&self, mut state: State, ctx: StepContext) -> BoxFuture<'_, Result<State, StepError>> {
        Box::pin(async move {
            let mut text = String::new();
            for fragment in &self.fragments {
                ctx.emit(fragment);
                text.push_str(fragment);
                tokio::time::sleep(self.pause).await;
            }
            state.insert(self.key.to_string(), Value::String(text));
            Ok(state)
        })
    }
}

/// Step that sleeps before passing state through.
pub struct SlowStep(pub Duration);

impl StepFunction for SlowStep {
    fn call(&self, state: State, _ctx: StepContext) -> BoxFuture<'_, Result<State, StepError>> {
        let delay = self.0;
        Box::pin(async move {
            tokio::time::sleep(delay).await;
            Ok(state)
        })
    }
}

/// Step that panics when polled.
pub struct PanickingStep;

impl StepFunction for PanickingStep {
    fn call(&self, _state: State, _ctx: StepContext) -> BoxFuture<'_, Result<State, StepError>> {
        Box::pin(futures::future::lazy(|_| -> Result<State, StepError> {
            panic!("step blew up")
        }))
    }
}

/// Records every cleanup invocation.
#[derive(Clone, Default)]
pub struct CleanupProbe {
    calls: Arc<AtomicUsize>,
    last_state: Arc<Mutex<Option<State>>>,
}

impl CleanupProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hook(&self) -> CleanupHook {
        let calls = self.calls.clone();
        let last_state = self.last_state.clone();
        Arc::new(move |s: &State| {
            calls.fetch_add(1, Ordering::SeqCst);
            *last_state.lock().unwrap() = Some(s.clone());
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_state(&self) -> Option<State> {
        self.last_state.lock().unwrap().clone()
    }
}
