use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::broadcast;

use crate::types::{Execution, ExecutionId, ExecutionStarted, LogFragment};

/// Per-execution pair of channels.
struct Topic {
    state: broadcast::Sender<Execution>,
    logs: broadcast::Sender<LogFragment>,
}

impl Topic {
    fn new(capacity: usize) -> Self {
        let (state, _) = broadcast::channel(capacity);
        let (logs, _) = broadcast::channel(capacity);
        Self { state, logs }
    }
}

/// Topic-addressed event bus using tokio broadcast channels.
///
/// Three topic families: a global "execution started" feed, and per
/// execution id a snapshot feed and a log feed. Delivery is best-effort to
/// whoever is subscribed at publish time; there is no replay and a lagging
/// receiver loses the oldest messages.
pub struct EventBus {
    capacity: usize,
    started: broadcast::Sender<ExecutionStarted>,
    topics: Mutex<HashMap<ExecutionId, Topic>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (started, _) = broadcast::channel(capacity);
        Self {
            capacity,
            started,
            topics: Mutex::new(HashMap::new()),
        }
    }

    pub fn publish_started(&self, event: ExecutionStarted) {
        // Ignore error if no receivers
        let _ = self.started.send(event);
    }

    pub fn subscribe_started(&self) -> broadcast::Receiver<ExecutionStarted> {
        self.started.subscribe()
    }

    pub fn publish_state(&self, snapshot: Execution) {
        let topics = self.lock_topics();
        if let Some(topic) = topics.get(&snapshot.id) {
            let _ = topic.state.send(snapshot);
        }
    }

    pub fn publish_log(&self, fragment: LogFragment) {
        let topics = self.lock_topics();
        if let Some(topic) = topics.get(&fragment.execution_id) {
            let _ = topic.logs.send(fragment);
        }
    }

    pub fn subscribe_state(&self, id: &ExecutionId) -> broadcast::Receiver<Execution> {
        let mut topics = self.lock_topics();
        topics
            .entry(id.clone())
            .or_insert_with(|| Topic::new(self.capacity))
            .state
            .subscribe()
    }

    pub fn subscribe_logs(&self, id: &ExecutionId) -> broadcast::Receiver<LogFragment> {
        let mut topics = self.lock_topics();
        topics
            .entry(id.clone())
            .or_insert_with(|| Topic::new(self.capacity))
            .logs
            .subscribe()
    }

    /// Drop an execution's topics. Open receivers see the channel close.
    pub fn remove(&self, id: &ExecutionId) {
        self.lock_topics().remove(id);
    }

    pub fn topic_count(&self) -> usize {
        self.lock_topics().len()
    }

    fn lock_topics(&self) -> std::sync::MutexGuard<'_, HashMap<ExecutionId, Topic>> {
        // A panic while holding the lock cannot leave the map half-updated.
        self.topics.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
