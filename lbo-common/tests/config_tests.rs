//! Integration tests for configuration resolution and loading
//!
//! Note: Uses serial_test crate to prevent ENV variable race conditions.
//! Tests that manipulate LBO_CONFIG are marked with #[serial].

use lbo_common::config::{load_toml_config, resolve_config_path, TomlConfig, CONFIG_ENV_VAR};
use lbo_common::Error;
use serial_test::serial;
use std::env;
use tempfile::TempDir;

#[test]
#[serial]
fn test_env_var_used_when_no_cli_argument() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("from-env.toml");
    env::set_var(CONFIG_ENV_VAR, &path);

    let resolved = resolve_config_path(None);
    env::remove_var(CONFIG_ENV_VAR);

    assert_eq!(resolved, Some(path));
}

#[test]
#[serial]
fn test_cli_argument_beats_env_var() {
    env::set_var(CONFIG_ENV_VAR, "/tmp/ignored.toml");
    let cli = std::path::Path::new("/tmp/cli.toml");

    let resolved = resolve_config_path(Some(cli));
    env::remove_var(CONFIG_ENV_VAR);

    assert_eq!(resolved, Some(cli.to_path_buf()));
}

#[test]
#[serial]
fn test_load_full_file() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("lbo-server.toml");
    std::fs::write(
        &path,
        r#"
[server]
bind = "0.0.0.0:9100"
database_path = "/var/lib/lbo/batches.db"

[dispatch]
chunk_size = 20
max_concurrency = 2
item_max_attempts = 4
item_backoff_ms = [100, 250]

[pacing]
base_secs = 1.0
major_weight = 0.3
minor_weight = 0.1

[connections]
ping_interval_secs = 15
max_reconnect_attempts = 3

[classifier]
base_url = "http://classifier:8001"
"#,
    )
    .unwrap();

    let config = TomlConfig::load(Some(&path)).unwrap();

    assert_eq!(config.server.bind, "0.0.0.0:9100");
    assert_eq!(config.dispatch.chunk_size, 20);
    assert_eq!(config.dispatch.max_concurrency, Some(2));
    assert_eq!(config.dispatch.item_backoff_ms, vec![100, 250]);
    assert_eq!(config.pacing.major_weight, 0.3);
    assert_eq!(config.connections.ping_interval_secs, 15);
    // Unspecified fields keep defaults
    assert_eq!(config.connections.idle_ceiling_secs, 300);
    assert_eq!(config.classifier.base_url, "http://classifier:8001");
}

#[test]
fn test_missing_explicit_file_is_an_error() {
    let temp_dir = TempDir::new().unwrap();
    let missing = temp_dir.path().join("nope.toml");

    let result = load_toml_config(&missing);
    assert!(matches!(result, Err(Error::Config(_))));
}

#[test]
fn test_invalid_values_rejected_on_load() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("bad.toml");
    std::fs::write(&path, "[dispatch]\nitem_max_attempts = 0\n").unwrap();

    assert!(matches!(load_toml_config(&path), Err(Error::Config(_))));
}

#[test]
fn test_malformed_toml_rejected() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("broken.toml");
    std::fs::write(&path, "[dispatch\nchunk_size = ").unwrap();

    assert!(matches!(load_toml_config(&path), Err(Error::Config(_))));
}

#[test]
#[serial]
fn test_from_source_reads_only_the_given_location() {
    let temp_dir = TempDir::new().unwrap();
    let env_path = temp_dir.path().join("from-env.toml");
    std::fs::write(&env_path, "[server]\nbind = \"127.0.0.1:7000\"\n").unwrap();
    env::set_var(CONFIG_ENV_VAR, &env_path);

    // No location: defaults, even with LBO_CONFIG set
    let defaults = TomlConfig::from_source(None);
    let loaded = TomlConfig::from_source(Some(&env_path));
    env::remove_var(CONFIG_ENV_VAR);

    assert_eq!(defaults.unwrap().server.bind, TomlConfig::default().server.bind);
    assert_eq!(loaded.unwrap().server.bind, "127.0.0.1:7000");
}
