//! Tests for `src/logging.rs`.

use aegnix::config::LoggingConfig;

#[test]
fn unusable_log_dir_is_reported() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let blocker = tmp.path().join("not-a-dir");
    std::fs::write(&blocker, b"file").expect("write");

    let err = aegnix::logging::init_with_file(&blocker.join("logs"), "info")
        .err()
        .expect("directory under a file cannot be created");
    assert!(err.to_string().contains("failed to create log directory"));
}

#[test]
fn stderr_only_config_returns_no_guard() {
    let config = LoggingConfig {
        level: "warn".to_owned(),
        dir: None,
    };
    let guard = aegnix::logging::init(&config).expect("stderr init never fails");
    assert!(guard.is_none());

    // A second install keeps the first subscriber.
    aegnix::logging::init_stderr("debug");
}
