//! Integration tests for spacebox-config
//!
//! These tests verify config loading with real file system operations.

use std::path::PathBuf;
use tempfile::tempdir;

/// Test config loading from a real config file
#[test]
fn test_load_config_from_file() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("config.toml");

    let config_content = r#"
[storage]
data_root = "/mnt/box"
bucket = "photos"
reserved_space = 1073741824

[multipart]
idle_timeout_secs = 60

[notify]
queue_capacity = 16
"#;
    std::fs::write(&path, config_content).unwrap();

    let config = spacebox_config::Config::from_file(&path).unwrap();

    assert_eq!(config.storage.data_root, PathBuf::from("/mnt/box"));
    assert_eq!(config.storage.bucket, "photos");
    assert_eq!(config.storage.reserved_space, 1 << 30);
    assert_eq!(config.multipart.idle_timeout_secs, 60);
    // Unset keys keep their defaults
    assert_eq!(config.multipart.sweep_interval_secs, 300);
    assert_eq!(config.notify.queue_capacity, 16);
    assert_eq!(config.notify.max_attempts, 60);
    assert_eq!(config.tasks.max_concurrent, 4);
}

/// Test that a partial config only overrides what it names
#[test]
fn test_partial_config_keeps_defaults() {
    let config: spacebox_config::Config = toml::from_str(
        r#"
[tasks]
async_threshold = 10
"#,
    )
    .unwrap();

    assert_eq!(config.tasks.async_threshold, 10);
    assert_eq!(config.storage.bucket, "eulixspace-files");
    assert_eq!(config.multipart.lifecycle_secs, 30 * 24 * 3600);
}

/// Test that malformed TOML surfaces as an error
#[test]
fn test_malformed_config_rejected() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("config.toml");
    std::fs::write(&path, "[storage\nbucket = ").unwrap();

    let err = spacebox_config::Config::from_file(&path).unwrap_err();
    assert!(matches!(err, spacebox_config::ConfigError::Toml(_)));
}

/// Test that the rendered default config parses back
#[test]
fn test_default_toml_parses() {
    let rendered = spacebox_config::Config::default_toml();
    let parsed: spacebox_config::Config = toml::from_str(&rendered).unwrap();
    assert_eq!(parsed.storage.data_root, PathBuf::from("/data"));
    assert_eq!(parsed.notify.retry_backoff_ms, 1000);
}

/// Test that the generated test topology carries the volume prefix
#[test]
fn test_environment_disk_roots() {
    let env = spacebox_config::testing::TestEnvironment::with_disks(2).unwrap();
    assert_eq!(
        env.disk_root(2),
        env.data_root.join("bp_part_disk2")
    );
    let file = env.create_file("nested/a.bin", b"abc").unwrap();
    assert_eq!(std::fs::read(file).unwrap(), b"abc");
}
