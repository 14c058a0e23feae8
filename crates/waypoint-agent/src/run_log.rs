use std::path::PathBuf;

use chrono::Utc;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use waypoint_core::event::EventBus;
use waypoint_core::types::{Execution, ExecutionId, LogFragment, LogKind, RunStatus};

/// JSONL run logger.
///
/// Follows one execution's state and log topics and writes structured
/// entries as JSONL (one JSON object per line). Lines are flushed as they
/// are written, so a crash loses at most the entry in flight.
pub struct RunLogger {
    log_dir: PathBuf,
    level: u8,
}

/// A single log entry written to the JSONL file.
#[derive(Debug, Serialize)]
struct LogEntry {
    timestamp: String,
    execution_id: String,
    event_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    node: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    step: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<serde_json::Value>,
}

impl LogEntry {
    fn new(execution_id: &ExecutionId, event_type: &str) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339(),
            execution_id: execution_id.0.clone(),
            event_type: event_type.to_string(),
            node: None,
            step: None,
            detail: None,
        }
    }
}

/// What the logger has already seen of the execution.
#[derive(Debug, Default)]
struct Seen {
    status: RunStatus,
    steps: usize,
    last_step_status: Option<RunStatus>,
}

impl RunLogger {
    /// Create a new RunLogger.
    ///
    /// Logs are written to `{log_dir}/{execution_id}/{timestamp}.jsonl`.
    /// `level` controls verbosity: 1=status changes, 2=+steps, 3=+output fragments.
    pub fn new(log_dir: PathBuf, level: u8) -> Self {
        Self { log_dir, level }
    }

    /// Subscribe to the execution's topics now and write entries on a background task.
    ///
    /// Call before starting the execution so no transition is missed. The task
    /// ends after the terminal snapshot, on cancellation, or when the topics
    /// close, and yields the path of the log file.
    pub fn spawn(
        self,
        bus: &EventBus,
        execution_id: ExecutionId,
        cancel: CancellationToken,
    ) -> JoinHandle<Option<PathBuf>> {
        let state_rx = bus.subscribe_state(&execution_id);
        let log_rx = bus.subscribe_logs(&execution_id);
        tokio::spawn(self.run(state_rx, log_rx, execution_id, cancel))
    }

    async fn run(
        self,
        mut state_rx: broadcast::Receiver<Execution>,
        mut log_rx: broadcast::Receiver<LogFragment>,
        execution_id: ExecutionId,
        cancel: CancellationToken,
    ) -> Option<PathBuf> {
        let execution_dir = self.log_dir.join(&execution_id.0);
        if let Err(e) = tokio::fs::create_dir_all(&execution_dir).await {
            error!(error = %e, "Failed to create log directory");
            return None;
        }

        let timestamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
        let log_path = execution_dir.join(format!("{}.jsonl", timestamp));

        let file = match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await
        {
            Ok(f) => f,
            Err(e) => {
                error!(error = %e, path = %log_path.display(), "Failed to open log file");
                return None;
            }
        };

        info!(path = %log_path.display(), "RunLogger started");

        let mut writer = tokio::io::BufWriter::new(file);
        let mut seen = Seen::default();
        let mut logs_open = true;

        loop {
            let (entries, finished) = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("RunLogger cancelled");
                    break;
                }
                result = state_rx.recv() => match result {
                    Ok(snapshot) => {
                        let finished = snapshot.is_finished();
                        (self.snapshot_entries(&mut seen, &snapshot), finished)
                    }
                    Err(RecvError::Lagged(n)) => {
                        debug!(skipped = n, "RunLogger lagged, skipped snapshots");
                        continue;
                    }
                    Err(RecvError::Closed) => {
                        debug!("State topic closed, RunLogger stopping");
                        break;
                    }
                },
                result = log_rx.recv(), if logs_open => match result {
                    Ok(fragment) => (self.fragment_entry(&fragment).into_iter().collect(), false),
                    Err(RecvError::Lagged(n)) => {
                        debug!(skipped = n, "RunLogger lagged, skipped log fragments");
                        continue;
                    }
                    Err(RecvError::Closed) => {
                        logs_open = false;
                        continue;
                    }
                },
            };

            for entry in entries {
                if let Ok(json) = serde_json::to_string(&entry) {
                    let line = format!("{}\n", json);
                    if let Err(e) = writer.write_all(line.as_bytes()).await {
                        error!(error = %e, "Failed to write log entry");
                        return Some(log_path);
                    }
                    // Flush after each entry for crash resilience
                    if let Err(e) = writer.flush().await {
                        error!(error = %e, "Failed to flush log");
                    }
                }
            }

            // Stop logging after the execution reaches a terminal status
            if finished {
                break;
            }
        }

        // Final flush
        writer.flush().await.ok();
        debug!(path = %log_path.display(), "RunLogger finished");
        Some(log_path)
    }

    /// Diff a snapshot against what was already logged.
    fn snapshot_entries(&self, seen: &mut Seen, snapshot: &Execution) -> Vec<LogEntry> {
        let id = &snapshot.id;
        let mut entries = Vec::new();

        // L2: step started / finished
        if self.level >= 2 {
            if snapshot.steps.len() > seen.steps {
                for (i, step) in snapshot.steps.iter().enumerate().skip(seen.steps) {
                    let mut entry = LogEntry::new(id, "step_started");
                    entry.node = Some(step.node.clone());
                    entry.step = Some(i);
                    entries.push(entry);
                }
                seen.last_step_status = None;
            }
            if let Some(step) = snapshot.steps.last() {
                let changed = seen.last_step_status != Some(step.status);
                if changed && matches!(step.status, RunStatus::Done | RunStatus::Failed) {
                    let mut entry = LogEntry::new(
                        id,
                        if step.status == RunStatus::Done {
                            "step_completed"
                        } else {
                            "step_failed"
                        },
                    );
                    entry.node = Some(step.node.clone());
                    entry.step = Some(snapshot.steps.len() - 1);
                    entry.detail = Some(serde_json::json!({ "attempts": step.attempts }));
                    entries.push(entry);
                }
                seen.last_step_status = Some(step.status);
            }
        }
        seen.steps = snapshot.steps.len();

        // L1: Always logged (status changes)
        if snapshot.status != seen.status {
            seen.status = snapshot.status;
            let entry = match snapshot.status {
                RunStatus::Running => Some(LogEntry::new(id, "execution_started")),
                RunStatus::Done => {
                    let mut entry = LogEntry::new(id, "execution_done");
                    entry.detail = Some(serde_json::json!({
                        "steps": snapshot.steps.len(),
                        "output": snapshot.output,
                    }));
                    Some(entry)
                }
                RunStatus::Failed => {
                    let mut entry = LogEntry::new(id, "execution_failed");
                    entry.node = snapshot.current_node.clone();
                    entry.detail = Some(serde_json::json!({
                        "steps": snapshot.steps.len(),
                        "error": snapshot.error_message,
                    }));
                    Some(entry)
                }
                RunStatus::NotStarted => None,
            };
            entries.extend(entry);
        }

        entries
    }

    /// Convert a log fragment to an entry (returns None if filtered by level).
    fn fragment_entry(&self, fragment: &LogFragment) -> Option<LogEntry> {
        let event_type = match fragment.kind {
            LogKind::Retry if self.level >= 2 => "step_retry",
            LogKind::Output if self.level >= 3 => "output",
            // Everything else is derived from snapshots
            _ => return None,
        };
        let mut entry = LogEntry::new(&fragment.execution_id, event_type);
        entry.node = fragment.node.clone();
        entry.detail = Some(serde_json::json!({ "text": truncate_str(&fragment.text, 500) }));
        Some(entry)
    }
}

/// Truncate a string for logging, respecting char boundaries.
fn truncate_str(s: &str, max_len: usize) -> &str {
    if s.len() <= max_len {
        return s;
    }
    let mut end = max_len;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use waypoint_core::types::{State, Step};

    fn execution(status: RunStatus, steps: Vec<Step>) -> Execution {
        let mut exec = Execution::new("run-1".into(), "test", "a", State::new());
        exec.status = status;
        exec.steps = steps;
        exec
    }

    fn step(node: &str, status: RunStatus) -> Step {
        let mut s = Step::running(node, State::new());
        s.status = status;
        s.attempts = 1;
        s
    }

    fn types(entries: &[LogEntry]) -> Vec<&str> {
        entries.iter().map(|e| e.event_type.as_str()).collect()
    }

    #[test]
    fn test_jsonl_entry_format() {
        let entry = LogEntry::new(&"exec-1".into(), "execution_started");
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("execution_started"));
        assert!(json.contains("exec-1"));
        // None fields are skipped
        assert!(!json.contains("node"));
        assert!(!json.contains("detail"));
    }

    #[test]
    fn test_snapshot_diffing() {
        let logger = RunLogger::new(PathBuf::from("/tmp"), 2);
        let mut seen = Seen::default();

        let e = logger.snapshot_entries(&mut seen, &execution(RunStatus::Running, vec![]));
        assert_eq!(types(&e), vec!["execution_started"]);

        let e = logger.snapshot_entries(
            &mut seen,
            &execution(RunStatus::Running, vec![step("a", RunStatus::Running)]),
        );
        assert_eq!(types(&e), vec!["step_started"]);

        let e = logger.snapshot_entries(
            &mut seen,
            &execution(RunStatus::Running, vec![step("a", RunStatus::Done)]),
        );
        assert_eq!(types(&e), vec!["step_completed"]);

        // Same snapshot again: nothing new
        let e = logger.snapshot_entries(
            &mut seen,
            &execution(RunStatus::Running, vec![step("a", RunStatus::Done)]),
        );
        assert!(e.is_empty());

        let e = logger.snapshot_entries(
            &mut seen,
            &execution(RunStatus::Done, vec![step("a", RunStatus::Done)]),
        );
        assert_eq!(types(&e), vec!["execution_done"]);
    }

    #[test]
    fn test_level_one_only_status() {
        let logger = RunLogger::new(PathBuf::from("/tmp"), 1);
        let mut seen = Seen::default();
        let e = logger.snapshot_entries(
            &mut seen,
            &execution(RunStatus::Failed, vec![step("a", RunStatus::Failed)]),
        );
        assert_eq!(types(&e), vec!["execution_failed"]);

        let retry = LogFragment::new("run-1".into(), Some("a".into()), LogKind::Retry, "again");
        assert!(logger.fragment_entry(&retry).is_none());
    }

    #[test]
    fn test_fragment_level_filtering() {
        let output = LogFragment::new("run-1".into(), Some("a".into()), LogKind::Output, "tok");
        let done = LogFragment::new("run-1".into(), None, LogKind::Completed, "done");

        assert!(RunLogger::new(PathBuf::from("/tmp"), 2)
            .fragment_entry(&output)
            .is_none());
        let entry = RunLogger::new(PathBuf::from("/tmp"), 3)
            .fragment_entry(&output)
            .unwrap();
        assert_eq!(entry.event_type, "output");
        assert!(RunLogger::new(PathBuf::from("/tmp"), 3)
            .fragment_entry(&done)
            .is_none());
    }

    #[test]
    fn test_truncate_str_char_boundary() {
        assert_eq!(truncate_str("short", 10), "short");
        assert_eq!(truncate_str("héllo", 2), "h");
    }

    #[tokio::test]
    async fn test_writes_until_terminal_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let bus = Arc::new(EventBus::default());
        let id: ExecutionId = "run-1".into();
        let handle = RunLogger::new(dir.path().to_path_buf(), 2).spawn(
            &bus,
            id.clone(),
            CancellationToken::new(),
        );

        bus.publish_state(execution(RunStatus::Running, vec![]));
        bus.publish_state(execution(RunStatus::Running, vec![step("a", RunStatus::Running)]));
        bus.publish_state(execution(RunStatus::Done, vec![step("a", RunStatus::Done)]));

        let path = handle.await.unwrap().expect("log path");
        let content = std::fs::read_to_string(path).unwrap();
        let lines: Vec<serde_json::Value> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        let kinds: Vec<&str> = lines
            .iter()
            .map(|l| l["event_type"].as_str().unwrap())
            .collect();
        assert_eq!(
            kinds,
            vec!["execution_started", "step_started", "step_completed", "execution_done"]
        );
    }
}
