use std::io::Write;

use waypoint_core::config::AppConfig;
use waypoint_core::WaypointError;

#[test]
fn test_load_full_config_from_file() {
    let toml_content = r#"
[engine]
max_steps = 50
bus_capacity = 64

[retry]
max_attempts = 5
initial_backoff_ms = 10
max_backoff_ms = 1000
jitter = false

[log]
enabled = true
log_dir = "/tmp/waypoint-logs"
level = 3

[hooks]
on_start = ["echo starting"]
on_done = []
on_failed = ["echo failed"]
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.engine.max_steps, 50);
    assert_eq!(config.engine.step_budget(), Some(50));
    assert_eq!(config.engine.bus_capacity, 64);
    assert_eq!(config.retry.max_attempts, 5);
    assert_eq!(config.retry.initial_backoff_ms, 10);
    assert!(!config.retry.jitter);

    let log = config.log.expect("log section");
    assert_eq!(log.level, 3);
    assert_eq!(log.dir(), std::path::PathBuf::from("/tmp/waypoint-logs"));

    let hooks = config.hooks.expect("hooks section");
    assert_eq!(hooks.on_start, vec!["echo starting"]);
    assert!(hooks.on_done.is_empty());
    assert_eq!(hooks.on_failed.len(), 1);
}

#[test]
fn test_empty_file_uses_defaults() {
    let tmp = tempfile::NamedTempFile::new().expect("create temp file");
    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.engine.max_steps, 1000);
    assert_eq!(config.retry.max_attempts, 3);
    assert!(config.log.is_none());
    assert!(config.hooks.is_none());
}

#[test]
fn test_unlimited_steps() {
    let config = AppConfig::from_toml("[engine]\nmax_steps = 0\n").unwrap();
    assert_eq!(config.engine.step_budget(), None);
}

#[test]
fn test_env_var_expansion_in_file() {
    std::env::set_var("WAYPOINT_TEST_LOG_DIR", "/var/tmp/wp");
    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(b"[log]\nlog_dir = \"${WAYPOINT_TEST_LOG_DIR}\"\n")
        .expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");
    assert_eq!(config.log.unwrap().log_dir, "/var/tmp/wp");
}

#[test]
fn test_missing_file_is_config_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let err = AppConfig::load(&dir.path().join("absent.toml")).unwrap_err();
    assert!(matches!(err, WaypointError::ConfigNotFound(_)));
}

#[test]
fn test_unreadable_path_is_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = AppConfig::load(dir.path()).unwrap_err();
    assert!(matches!(err, WaypointError::Io(_)));
}

#[test]
fn test_invalid_retry_rejected() {
    let err = AppConfig::from_toml("[retry]\nmax_attempts = 0\n").unwrap_err();
    assert!(matches!(err, WaypointError::Config(_)));

    let err = AppConfig::from_toml("[retry]\ninitial_backoff_ms = 500\nmax_backoff_ms = 100\n")
        .unwrap_err();
    assert!(err.to_string().contains("initial_backoff_ms"));
}

#[test]
fn test_round_trips_through_toml() {
    let config = AppConfig::default();
    let text = toml::to_string_pretty(&config).unwrap();
    let back = AppConfig::from_toml(&text).unwrap();
    assert_eq!(back.engine.max_steps, config.engine.max_steps);
    assert_eq!(back.retry.max_backoff_ms, config.retry.max_backoff_ms);
}
