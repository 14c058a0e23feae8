use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, WaypointError};

/// Top-level Waypoint configuration. Every section is optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub log: Option<LogConfig>,
    #[serde(default)]
    pub hooks: Option<HooksConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum steps per execution (0 = unlimited).
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
    /// Buffer size of every broadcast channel on the event bus.
    #[serde(default = "default_bus_capacity")]
    pub bus_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            bus_capacity: default_bus_capacity(),
        }
    }
}

fn default_max_steps() -> usize { 1000 }
fn default_bus_capacity() -> usize { 256 }

impl EngineConfig {
    /// Step budget, or `None` when unlimited.
    pub fn step_budget(&self) -> Option<usize> {
        (self.max_steps > 0).then_some(self.max_steps)
    }
}

/// Retry policy for recoverable step failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts, including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
            jitter: default_jitter(),
        }
    }
}

fn default_max_attempts() -> u32 { 3 }
fn default_initial_backoff() -> u64 { 100 }
fn default_max_backoff() -> u64 { 2000 }
fn default_jitter() -> bool { true }

/// JSONL run logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Enable run logging (default: true when section is present).
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// Directory for log files. Default: ./logs
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    /// Verbosity: 1=status changes, 2=+steps and retries, 3=+output fragments.
    #[serde(default = "default_log_level")]
    pub level: u8,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            level: default_log_level(),
        }
    }
}

fn default_log_enabled() -> bool { true }
fn default_log_dir() -> String { "logs".to_string() }
fn default_log_level() -> u8 { 2 }

impl LogConfig {
    /// Resolve the log directory (expand ~).
    pub fn dir(&self) -> PathBuf {
        if let Some(rest) = self.log_dir.strip_prefix("~/") {
            if let Some(home) = dirs_home() {
                return home.join(rest);
            }
        }
        PathBuf::from(&self.log_dir)
    }
}

/// Shell commands run on execution lifecycle events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HooksConfig {
    #[serde(default)]
    pub on_start: Vec<String>,
    #[serde(default)]
    pub on_done: Vec<String>,
    #[serde(default)]
    pub on_failed: Vec<String>,
    /// Per-command timeout.
    #[serde(default = "default_hook_timeout")]
    pub timeout_secs: u64,
}

impl Default for HooksConfig {
    fn default() -> Self {
        Self {
            on_start: Vec::new(),
            on_done: Vec::new(),
            on_failed: Vec::new(),
            timeout_secs: default_hook_timeout(),
        }
    }
}

fn default_hook_timeout() -> u64 { 30 }

impl HooksConfig {
    pub fn is_empty(&self) -> bool {
        self.on_start.is_empty() && self.on_done.is_empty() && self.on_failed.is_empty()
    }

    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.timeout_secs)
    }
}

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(WaypointError::ConfigNotFound(path.display().to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        Self::from_toml(&content)
    }

    /// Parse config from TOML text, with env var expansion.
    pub fn from_toml(content: &str) -> Result<Self> {
        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(content);

        let config: Self =
            toml::from_str(&expanded).map_err(|e| WaypointError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.retry.max_attempts == 0 {
            return Err(WaypointError::Config(
                "retry.max_attempts must be at least 1".into(),
            ));
        }
        if self.retry.initial_backoff_ms > self.retry.max_backoff_ms {
            return Err(WaypointError::Config(
                "retry.initial_backoff_ms must not exceed retry.max_backoff_ms".into(),
            ));
        }
        if self.engine.bus_capacity == 0 {
            return Err(WaypointError::Config(
                "engine.bus_capacity must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Expand `${VAR}` and `${VAR:-fallback}` references.
///
/// Unset variables without a fallback are left as written, so the TOML
/// error (if any) points at the reference.
fn expand_env_vars(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(open) = rest.find("${") {
        out.push_str(&rest[..open]);
        let after = &rest[open + 2..];
        let Some(close) = after.find('}') else {
            // Unterminated reference: copy the remainder verbatim
            out.push_str(&rest[open..]);
            return out;
        };
        let reference = &after[..close];
        let (name, fallback) = match reference.split_once(":-") {
            Some((name, fallback)) => (name, Some(fallback)),
            None => (reference, None),
        };
        match std::env::var(name) {
            Ok(val) if !val.is_empty() || fallback.is_none() => out.push_str(&val),
            _ => match fallback {
                Some(fallback) => out.push_str(fallback),
                None => out.push_str(&rest[open..open + 3 + close]),
            },
        }
        rest = &after[close + 1..];
    }
    out.push_str(rest);
    out
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
