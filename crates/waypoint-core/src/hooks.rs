use std::time::Duration;

use tracing::{debug, warn};

use crate::config::HooksConfig;
use crate::types::Execution;

/// Execution lifecycle points that can trigger shell hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookEvent {
    Start,
    Done,
    Failed,
}

impl HookEvent {
    pub fn commands(self, hooks: &HooksConfig) -> &[String] {
        match self {
            Self::Start => &hooks.on_start,
            Self::Done => &hooks.on_done,
            Self::Failed => &hooks.on_failed,
        }
    }
}

/// Environment handed to every hook command for `execution`.
pub fn hook_env(execution: &Execution) -> Vec<(String, String)> {
    let mut env = vec![
        ("WAYPOINT_EXECUTION_ID".to_string(), execution.id.0.clone()),
        ("WAYPOINT_AGENT".to_string(), execution.agent.clone()),
        ("WAYPOINT_STATUS".to_string(), execution.status.to_string()),
        ("WAYPOINT_STEPS".to_string(), execution.steps.len().to_string()),
    ];
    if let Some(ref err) = execution.error_message {
        env.push(("WAYPOINT_ERROR".to_string(), err.clone()));
    }
    env
}

/// Run hook commands one after another through `sh -c`.
///
/// Errors are logged, not propagated. A command still running after
/// `timeout` is killed. Returns how many commands did not succeed.
pub async fn run_hooks(commands: &[String], env: &[(String, String)], timeout: Duration) -> usize {
    let mut failures = 0;
    for cmd in commands {
        let mut command = tokio::process::Command::new("sh");
        command
            .args(["-c", cmd])
            .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true);

        match tokio::time::timeout(timeout, command.status()).await {
            Ok(Ok(s)) if s.success() => debug!(hook = %cmd, "Hook finished"),
            Ok(Ok(s)) => {
                warn!(hook = %cmd, code = s.code(), "Hook exited non-zero");
                failures += 1;
            }
            Ok(Err(e)) => {
                warn!(hook = %cmd, error = %e, "Hook failed to execute");
                failures += 1;
            }
            Err(_) => {
                warn!(hook = %cmd, timeout_secs = timeout.as_secs(), "Hook timed out");
                failures += 1;
            }
        }
    }
    failures
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{RunStatus, State};

    const SECOND: Duration = Duration::from_secs(1);

    #[tokio::test]
    async fn test_hook_receives_env() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("hook.txt");
        let cmd = format!(
            "printf '%s:%s' \"$WAYPOINT_EXECUTION_ID\" \"$WAYPOINT_STATUS\" > {}",
            out.display()
        );

        let mut exec = Execution::new("run-7".into(), "agent", "a", State::new());
        exec.status = RunStatus::Done;
        let failures = run_hooks(&[cmd], &hook_env(&exec), SECOND).await;

        assert_eq!(failures, 0);
        assert_eq!(std::fs::read_to_string(&out).unwrap(), "run-7:done");
    }

    #[tokio::test]
    async fn test_failures_are_counted_not_propagated() {
        let commands = vec!["exit 3".to_string(), "true".to_string()];
        assert_eq!(run_hooks(&commands, &[], SECOND).await, 1);
    }

    #[tokio::test]
    async fn test_slow_hook_times_out() {
        let commands = vec!["sleep 5".to_string()];
        assert_eq!(
            run_hooks(&commands, &[], Duration::from_millis(50)).await,
            1
        );
    }

    #[test]
    fn test_event_selects_commands() {
        let hooks = HooksConfig {
            on_start: vec!["a".into()],
            on_done: vec![],
            on_failed: vec!["b".into(), "c".into()],
            ..HooksConfig::default()
        };
        assert_eq!(HookEvent::Start.commands(&hooks), ["a".to_string()]);
        assert!(HookEvent::Done.commands(&hooks).is_empty());
        assert_eq!(HookEvent::Failed.commands(&hooks).len(), 2);
    }

    #[test]
    fn test_env_includes_error() {
        let mut exec = Execution::new("x".into(), "agent", "a", State::new());
        exec.status = RunStatus::Failed;
        exec.error_message = Some("boom".into());
        let env = hook_env(&exec);
        assert!(env.contains(&("WAYPOINT_ERROR".to_string(), "boom".to_string())));
        assert!(env.contains(&("WAYPOINT_STATUS".to_string(), "failed".to_string())));
    }
}
