use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde_json::Value;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use waypoint_core::config::{AppConfig, HooksConfig};
use waypoint_core::error::{Result, StepError, WaypointError};
use waypoint_core::event::EventBus;
use waypoint_core::hooks::{hook_env, run_hooks, HookEvent};
use waypoint_core::traits::{Emit, StepContext, StepFunction};
use waypoint_core::types::*;

use crate::graph::AgentDefinition;
use crate::panic_message;
use crate::retry::RetryPolicy;

/// Caller-supplied callback receiving every log fragment of one execution.
pub type FragmentSink = Arc<dyn Fn(&LogFragment) + Send + Sync>;

/// Bookkeeping for one registered execution.
struct Slot {
    definition: Arc<AgentDefinition>,
    snapshot: watch::Receiver<Execution>,
    /// Taken by `start`; `None` once the coordinator owns it.
    sender: Option<watch::Sender<Execution>>,
}

/// The execution engine.
///
/// Each started execution gets its own coordinator task that owns the
/// authoritative `Execution` record and serializes every transition. Each
/// attempt of a step runs on a separate spawned task, so a failing or
/// panicking step function cannot take the coordinator down. Snapshots are
/// exposed through a watch channel (for [`Engine::snapshot`] and
/// [`Engine::wait`]) and broadcast on the shared [`EventBus`].
pub struct Engine {
    config: AppConfig,
    retry: RetryPolicy,
    bus: Arc<EventBus>,
    executions: Mutex<HashMap<ExecutionId, Slot>>,
    cancel: CancellationToken,
}

impl Engine {
    pub fn new(config: AppConfig, bus: Arc<EventBus>) -> Self {
        let retry = RetryPolicy::from(&config.retry);
        Self {
            config,
            retry,
            bus,
            executions: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
        }
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Register a new execution of `definition` under `id`.
    pub fn create(
        &self,
        id: impl Into<ExecutionId>,
        definition: impl Into<Arc<AgentDefinition>>,
    ) -> Result<Execution> {
        let id = id.into();
        let definition = definition.into();

        if id.as_str().trim().is_empty() {
            return Err(WaypointError::InvalidId(id.0));
        }
        let entry_point = definition
            .entry_point()
            .ok_or(WaypointError::MissingField("entry_point"))?;

        let mut executions = self.lock_executions();
        if executions.contains_key(&id) {
            return Err(WaypointError::DuplicateExecution(id.0));
        }

        let execution = Execution::new(
            id.clone(),
            definition.name(),
            entry_point,
            definition.initial_state().clone(),
        );
        debug!(
            execution_id = %id,
            agent = %execution.agent,
            nodes = definition.node_count(),
            "Execution created"
        );
                let (tx, rx) = watch::channel(execution.clone());
        executions.insert(
            id,
            Slot {
                definition,
                snapshot: rx,
                sender: Some(tx),
            },
        );
        Ok(execution)
    }

    /// Point-in-time copy of an execution.
    pub fn snapshot(&self, id: &ExecutionId) -> Result<Execution> {
        let executions = self.lock_executions();
        let slot = executions
            .get(id)
            .ok_or_else(|| WaypointError::ExecutionNotFound(id.0.clone()))?;
        let snapshot = slot.snapshot.borrow().clone();
        Ok(snapshot)
    }

    /// Forget a finished (or never started) execution and drop its bus topics.
    pub fn remove(&self, id: &ExecutionId) -> Result<Execution> {
        let mut executions = self.lock_executions();
        let slot = executions
            .get(id)
            .ok_or_else(|| WaypointError::ExecutionNotFound(id.0.clone()))?;
        let snapshot = slot.snapshot.borrow().clone();
        if slot.sender.is_none() && !snapshot.is_finished() {
            return Err(WaypointError::ExecutionRunning(id.0.clone()));
        }
        executions.remove(id);
        drop(executions);

        self.bus.remove(id);
        debug!(execution_id = %id, open_topics = self.bus.topic_count(), "Execution removed");
        Ok(snapshot)
    }

    /// Ids of every registered execution.
    pub fn executions(&self) -> Vec<ExecutionId> {
        self.lock_executions().keys().cloned().collect()
    }

    /// Start the walk in the background and return immediately.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self, id: &ExecutionId) -> Result<()> {
        self.spawn_coordinator(id, None)
    }

    /// Like [`Engine::start`], also forwarding every log fragment to `sink`.
    pub fn start_with_sink(&self, id: &ExecutionId, sink: FragmentSink) -> Result<()> {
        self.spawn_coordinator(id, Some(sink))
    }

    /// Wait until the execution reaches `done` or `failed`.
    pub async fn wait(&self, id: &ExecutionId) -> Result<Execution> {
        let mut rx = {
            let executions = self.lock_executions();
            executions
                .get(id)
                .ok_or_else(|| WaypointError::ExecutionNotFound(id.0.clone()))?
                .snapshot
                .clone()
        };
        let finished = rx
            .wait_for(|e| e.is_finished())
            .await
            .map(|e| e.clone());
        Ok(match finished {
            Ok(execution) => execution,
            // Coordinator gone without a terminal snapshot: report what we have.
            Err(_) => rx.borrow().clone(),
        })
    }

    /// Create, start, and wait for an execution.
    pub async fn run(
        &self,
        id: impl Into<ExecutionId>,
        definition: impl Into<Arc<AgentDefinition>>,
    ) -> Result<Execution> {
        let execution = self.create(id, definition)?;
        self.start(&execution.id)?;
        self.wait(&execution.id).await
    }

    /// Subscribe before `start` to see every snapshot. The execution's topics
    /// are dropped after its terminal snapshot, which closes the receiver.
    pub fn subscribe_state(&self, id: &ExecutionId) -> broadcast::Receiver<Execution> {
        self.bus.subscribe_state(id)
    }

    pub fn subscribe_logs(&self, id: &ExecutionId) -> broadcast::Receiver<LogFragment> {
        self.bus.subscribe_logs(id)
    }

    pub fn subscribe_started(&self) -> broadcast::Receiver<ExecutionStarted> {
        self.bus.subscribe_started()
    }

    /// Cancel every running execution. Cancelled executions end `failed`.
    pub fn shutdown(&self) {
        info!(open_topics = self.bus.topic_count(), "Engine shutting down");
        self.cancel.cancel();
    }

    fn spawn_coordinator(&self, id: &ExecutionId, sink: Option<FragmentSink>) -> Result<()> {
        let (definition, tx) = {
            let mut executions = self.lock_executions();
            let slot = executions
                .get_mut(id)
                .ok_or_else(|| WaypointError::ExecutionNotFound(id.0.clone()))?;
            let tx = slot
                .sender
                .take()
                .ok_or_else(|| WaypointError::AlreadyStarted(id.0.clone()))?;
            (slot.definition.clone(), tx)
        };

        let execution = tx.borrow().clone();
        let coordinator = Coordinator {
            definition,
            execution,
            tx,
            bus: self.bus.clone(),
            retry: self.retry.clone(),
            max_steps: self.config.engine.step_budget(),
            hooks: self.config.hooks.clone().filter(|h| !h.is_empty()),
            cancel: self.cancel.child_token(),
            sink,
        };
        tokio::spawn(coordinator.run());
        Ok(())
    }

    fn lock_executions(&self) -> std::sync::MutexGuard<'_, HashMap<ExecutionId, Slot>> {
        self.executions.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Drives one execution from `running` to a terminal status.
struct Coordinator {
    definition: Arc<AgentDefinition>,
    execution: Execution,
    tx: watch::Sender<Execution>,
    bus: Arc<EventBus>,
    retry: RetryPolicy,
    max_steps: Option<usize>,
    hooks: Option<HooksConfig>,
    cancel: CancellationToken,
    sink: Option<FragmentSink>,
}

impl Coordinator {
    async fn run(mut self) {
        let started_at = Utc::now();
        self.execution.status = RunStatus::Running;
        self.execution.started_at = Some(started_at);

        info!(
            execution_id = %self.execution.id,
            agent = %self.execution.agent,
            "Execution started"
        );
        self.bus.publish_started(ExecutionStarted {
            execution_id: self.execution.id.clone(),
            agent: self.execution.agent.clone(),
            started_at,
        });
        self.publish();
        self.fire_hooks(HookEvent::Start);

        match self.walk().await {
            Ok(output) => self.finish(output),
            Err(e) => self.fail(e),
        }
    }

    /// Step loop. Returns the projected output once the terminal marker is reached.
    async fn walk(&mut self) -> Result<Value> {
        loop {
            let node = match self.execution.current_node.clone() {
                Some(node) if node != END => node,
                _ => return self.definition.project_output(&self.execution.current_state),
            };

            if let Some(max) = self.max_steps {
                if self.execution.steps.len() >= max {
                    return Err(WaypointError::StepBudgetExceeded(max));
                }
            }

            let step_fn = self
                .definition
                .node(&node)
                .ok_or_else(|| WaypointError::NodeNotFound(node.clone()))?;

            self.execution
                .steps
                .push(Step::running(node.as_str(), self.execution.current_state.clone()));
            self.publish();

            let new_state = self.run_step(&node, step_fn).await?;

            if let Some(step) = self.execution.last_step_mut() {
                step.status = RunStatus::Done;
                step.output_state = Some(new_state.clone());
                step.finished_at = Some(Utc::now());
            }
            self.execution.current_state = new_state;
            self.publish();
            self.log(Some(&node), LogKind::StepCompleted, format!("step '{}' completed", node));

            let next = self
                .definition
                .next_node(&node, &self.execution.current_state)?;
            debug!(execution_id = %self.execution.id, from = %node, to = %next, "Advancing");
            self.execution.current_node = Some(next);
        }
    }

    /// Run one step, retrying recoverable failures with backoff.
    async fn run_step(&mut self, node: &str, step_fn: Arc<dyn StepFunction>) -> Result<State> {
        let cancel = self.cancel.clone();
        let mut attempt = 0;

        loop {
            attempt += 1;
            if let Some(step) = self.execution.last_step_mut() {
                step.attempts = attempt;
            }
            debug!(execution_id = %self.execution.id, node, attempt, "Running step");

            let f = step_fn.clone();
            let input = self.execution.current_state.clone();
            let ctx = StepContext::new(node, attempt, Some(self.emitter(node)));
            let handle = tokio::spawn(async move { f.call(input, ctx).await });
            let abort = handle.abort_handle();

            let joined = tokio::select! {
                _ = cancel.cancelled() => {
                    abort.abort();
                    return Err(WaypointError::Cancelled);
                }
                joined = handle => joined,
            };

            let result = match joined {
                Ok(result) => result,
                Err(e) if e.is_panic() => Err(StepError::failed(format!(
                    "step panicked: {}",
                    panic_message(e.into_panic())
                ))),
                Err(e) => Err(StepError::failed(format!("step task aborted: {}", e))),
            };

            match result {
                Ok(state) => return Ok(state),
                Err(err) if self.retry.should_retry(&err, attempt) => {
                    let backoff = self.retry.backoff(attempt - 1);
                    warn!(
                        execution_id = %self.execution.id,
                        node,
                        attempt,
                        max_attempts = self.retry.max_attempts(),
                        backoff_ms = backoff.as_millis() as u64,
                        error = %err,
                        "Retrying step"
                    );
                    self.log(
                        Some(node),
                        LogKind::Retry,
                        format!(
                            "attempt {} of step '{}' failed: {}; retrying in {}ms",
                            attempt,
                            node,
                            err,
                            backoff.as_millis()
                        ),
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(WaypointError::Cancelled),
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
                Err(err) => {
                    return Err(WaypointError::Step {
                        node: node.to_string(),
                        attempts: attempt,
                        source: err,
                    })
                }
            }
        }
    }

    fn finish(mut self, output: Value) {
        self.cleanup();
        self.execution.status = RunStatus::Done;
        self.execution.current_node = None;
        self.execution.output = Some(output);
        self.execution.finished_at = Some(Utc::now());

        info!(
            execution_id = %self.execution.id,
            steps = self.execution.steps.len(),
            "Execution done"
        );
        self.publish();
        self.log(None, LogKind::Completed, "execution completed");
        self.fire_hooks(HookEvent::Done);
        self.bus.remove(&self.execution.id);
    }

    fn fail(mut self, err: WaypointError) {
        let now = Utc::now();
        if let Some(step) = self.execution.last_step_mut() {
            if step.status == RunStatus::Running {
                step.status = RunStatus::Failed;
                step.finished_at = Some(now);
            }
        }
        let message = err.to_string();
        self.cleanup();
        self.execution.status = RunStatus::Failed;
        self.execution.error_message = Some(message.clone());
        self.execution.finished_at = Some(now);

        error!(
            execution_id = %self.execution.id,
            node = ?self.execution.current_node,
            error = %message,
            "Execution failed"
        );
        self.publish();
        let node = self.execution.current_node.clone();
        self.log(node.as_deref(), LogKind::Failed, message);
        self.fire_hooks(HookEvent::Failed);
        self.bus.remove(&self.execution.id);
    }

    /// Run the cleanup hook. A panicking hook is logged, never retried.
    fn cleanup(&self) {
        let definition = &self.definition;
        let state = &self.execution.current_state;
        if std::panic::catch_unwind(AssertUnwindSafe(|| definition.run_cleanup(state))).is_err() {
            error!(execution_id = %self.execution.id, "Cleanup hook panicked");
        }
    }

    fn publish(&self) {
        self.tx.send_replace(self.execution.clone());
        self.bus.publish_state(self.execution.clone());
    }

    fn log(&self, node: Option<&str>, kind: LogKind, text: impl Into<String>) {
        let fragment = LogFragment::new(
            self.execution.id.clone(),
            node.map(str::to_string),
            kind,
            text,
        );
        if let Some(ref sink) = self.sink {
            deliver(sink, &fragment);
        }
        self.bus.publish_log(fragment);
    }

    /// Fragment callback handed to step functions through their context.
    fn emitter(&self, node: &str) -> Emit {
        let bus = self.bus.clone();
        let sink = self.sink.clone();
        let id = self.execution.id.clone();
        let node = node.to_string();
        Arc::new(move |text: &str| {
            let fragment = LogFragment::new(id.clone(), Some(node.clone()), LogKind::Output, text);
            if let Some(ref sink) = sink {
                deliver(sink, &fragment);
            }
            bus.publish_log(fragment);
        })
    }

    fn fire_hooks(&self, event: HookEvent) {
        let Some(hooks) = self.hooks.as_ref() else {
            return;
        };
        let commands = event.commands(hooks).to_vec();
        if commands.is_empty() {
            return;
        }
        let env = hook_env(&self.execution);
        let timeout = hooks.timeout();
        debug!(execution_id = %self.execution.id, ?event, count = commands.len(), "Firing hooks");
        tokio::spawn(async move {
            run_hooks(&commands, &env, timeout).await;
        });
    }
}

/// Hand a fragment to the caller's sink. A panicking sink is logged and skipped.
fn deliver(sink: &FragmentSink, fragment: &LogFragment) {
    if let Err(payload) = std::panic::catch_unwind(AssertUnwindSafe(|| sink(fragment))) {
        error!(
            execution_id = %fragment.execution_id,
            kind = ?fragment.kind,
            panic = %panic_message(payload),
            "Fragment sink panicked"
        );
    }
}
