//! Coverage for config parsing, overrides, validation, and path resolution.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use sealpost::codec::DEFAULT_HEADER;
use sealpost::config::{
    load_config, load_config_or_default, runtime_paths_with, Config, RuntimePaths, HOME_ENV,
};

fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let map: HashMap<String, String> = pairs
        .iter()
        .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
        .collect();
    move |key| map.get(key).cloned()
}

fn parse(toml_str: &str) -> Config {
    match Config::from_toml(toml_str) {
        Ok(config) => config,
        Err(err) => panic!("config should parse: {err}"),
    }
}

#[test]
fn parse_minimal_config() {
    let config = parse(
        r#"
[target]
raw = "1234567890"
"#,
    );
    assert_eq!(config.target.raw, "1234567890");
    assert_eq!(config.schedule.interval_secs, 120);
    assert_eq!(config.schedule.backoff_secs, 60);
    assert_eq!(config.resolver.thread_id_min_digits, 16);
    assert_eq!(config.resolver.user_id_min_digits, 10);
    assert_eq!(config.graph.api_version, "v18.0");
    assert_eq!(config.graph.messaging_type, "MESSAGE_TAG");
    assert_eq!(config.graph.tag, "CONFIRMED_EVENT_UPDATE");
    assert_eq!(config.vault.label, "default");
    assert_eq!(config.framing.header, DEFAULT_HEADER);
    assert!(config.validate().is_ok());
}

#[test]
fn parse_full_config() {
    let config = parse(
        r#"
[target]
raw = "https://facebook.com/jane.doe"

[messages]
items = ["one", "two"]

[schedule]
interval_secs = 300
backoff_secs = 90
tick_millis = 250
transport_timeout_secs = 20
lookup_timeout_secs = 5
status_interval_secs = 30

[resolver]
thread_id_min_digits = 15
user_id_min_digits = 9

[graph]
api_base = "https://graph.example.com"
api_version = "v19.0"

[vault]
label = "alice"

[framing]
header = "SECURE"
"#,
    );

    let settings = config.dispatch_settings();
    assert_eq!(settings.interval, Duration::from_secs(300));
    assert_eq!(settings.backoff, Duration::from_secs(90));
    assert_eq!(settings.tick, Duration::from_millis(250));
    assert_eq!(settings.transport_timeout, Duration::from_secs(20));
    assert_eq!(settings.header, "SECURE");
    assert_eq!(config.lookup_timeout(), Duration::from_secs(5));
    assert_eq!(config.status_interval(), Duration::from_secs(30));
    assert_eq!(config.thresholds().thread_id_min_digits, 15);
    assert_eq!(config.thresholds().user_id_min_digits, 9);
    assert!(config.validate().is_ok());
}

#[test]
fn malformed_toml_is_rejected() {
    assert!(Config::from_toml("[target\nraw = 1").is_err());
}

#[test]
fn env_overrides_replace_file_values() {
    let mut config = parse("[target]\nraw = \"1234567890\"\n");
    config.apply_overrides(env_from(&[
        ("SEALPOST_TARGET", "1234567890123456"),
        ("SEALPOST_INTERVAL_SECS", "45"),
        ("SEALPOST_BACKOFF_SECS", "not a number"),
    ]));

    assert_eq!(config.target.raw, "1234567890123456");
    assert_eq!(config.schedule.interval_secs, 45);
    assert_eq!(config.schedule.backoff_secs, 60);
}

#[test]
fn blank_target_override_is_ignored() {
    let mut config = parse("[target]\nraw = \"1234567890\"\n");
    config.apply_overrides(env_from(&[("SEALPOST_TARGET", "  ")]));
    assert_eq!(config.target.raw, "1234567890");
}

#[test]
fn validate_rejects_empty_target() {
    let config = Config::default();
    assert!(config.validate().is_err());
}

#[test]
fn validate_rejects_zero_timings() {
    let mut config = parse("[target]\nraw = \"1234567890\"\n");
    config.schedule.interval_secs = 0;
    assert!(config.validate().is_err());

    let mut config = parse("[target]\nraw = \"1234567890\"\n");
    config.schedule.tick_millis = 0;
    assert!(config.validate().is_err());
}

#[test]
fn validate_rejects_inverted_thresholds() {
    let config = parse(
        r#"
[target]
raw = "1234567890"

[resolver]
thread_id_min_digits = 10
user_id_min_digits = 12
"#,
    );
    let err = config.validate().expect_err("thresholds are inverted");
    assert!(err.to_string().contains("user_id_min_digits"));
}

#[test]
fn inline_messages_take_precedence_over_file() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    std::fs::write(tmp.path().join("messages.txt"), "from file\n").expect("should write");

    let config = parse("[messages]\nitems = [\"  inline  \", \"\"]\n");
    let items = config.message_items(tmp.path()).expect("should load");
    assert_eq!(items, vec!["inline"]);
}

#[test]
fn message_file_is_read_relative_to_root() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    std::fs::write(tmp.path().join("rotation.txt"), "first\n\nsecond\n").expect("should write");

    let config = parse("[messages]\nfile = \"rotation.txt\"\n");
    assert_eq!(
        config.messages_path(tmp.path()),
        tmp.path().join("rotation.txt")
    );
    let items = config.message_items(tmp.path()).expect("should load");
    assert_eq!(items, vec!["first", "second"]);
}

#[test]
fn missing_message_file_is_an_error() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let config = Config::default();
    assert!(config.message_items(tmp.path()).is_err());
}

#[test]
fn load_config_or_default_handles_missing_file() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let config = load_config_or_default(&tmp.path().join("config.toml")).expect("defaults");
    assert!(config.target.raw.is_empty());

    assert!(load_config(&tmp.path().join("config.toml")).is_err());
}

#[test]
fn load_config_reads_file() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let path = tmp.path().join("config.toml");
    std::fs::write(&path, "[target]\nraw = \"1234567890\"\n").expect("should write");

    let config = load_config(&path).expect("should load");
    assert_eq!(config.target.raw, "1234567890");
}

#[test]
fn runtime_paths_layout() {
    let paths = RuntimePaths::from_root("/srv/sealpost");
    assert_eq!(paths.config_toml, PathBuf::from("/srv/sealpost/config.toml"));
    assert_eq!(paths.env_file, PathBuf::from("/srv/sealpost/.env"));
    assert_eq!(paths.keys_dir, PathBuf::from("/srv/sealpost/keys"));
    assert_eq!(paths.logs_dir, PathBuf::from("/srv/sealpost/logs"));
    assert_eq!(paths.audit_log, PathBuf::from("/srv/sealpost/audit.log"));
    assert_eq!(paths.audit_jsonl, PathBuf::from("/srv/sealpost/audit.jsonl"));
    assert_eq!(paths.status_json, PathBuf::from("/srv/sealpost/status.json"));
}

#[test]
fn runtime_paths_precedence() {
    let env = env_from(&[(HOME_ENV, "/from/env")]);

    let explicit = runtime_paths_with(Some(Path::new("/explicit")), &env).expect("paths");
    assert_eq!(explicit.root, PathBuf::from("/explicit"));

    let from_env = runtime_paths_with(None, &env).expect("paths");
    assert_eq!(from_env.root, PathBuf::from("/from/env"));

    let default = runtime_paths_with(None, env_from(&[])).expect("paths");
    assert!(default.root.ends_with(".sealpost"));
}
