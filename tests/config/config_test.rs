//! Tests for `src/config.rs`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use aegnix::audit::transport::ChannelTransport;
use aegnix::audit::{verify_record, AuditEventType};
use aegnix::config::{config_path_with, AbiConfig, AuditConfig};
use aegnix::crypto::{AuditSigner, Ed25519Verifier};

fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let map: HashMap<String, String> = pairs
        .iter()
        .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
        .collect();
    move |key| map.get(key).cloned()
}

#[test]
fn full_config_parses() {
    let toml_str = r#"
[storage]
db_path = "/var/lib/abi/state.db"

[admission]
challenge_ttl_secs = 60
consume_on_failure = true

[audit]
log_path = "/var/log/abi/audit.log"
producer = "abi-east"
key_id = "abi-ed25519-2"
signing_key_env = "ABI_AUDIT_SEED"
topic = "mesh.audit"

[policy]
path = "/etc/abi/policy.toml"

[logging]
level = "debug"
dir = "/var/log/abi"
"#;
    let config = AbiConfig::from_toml(toml_str).expect("parse");
    assert_eq!(config.storage.db_path, PathBuf::from("/var/lib/abi/state.db"));
    assert_eq!(config.admission.challenge_ttl_secs, 60);
    assert!(config.admission.consume_on_failure);
    assert_eq!(config.audit.producer, "abi-east");
    assert_eq!(config.audit.key_id, "abi-ed25519-2");
    assert_eq!(config.audit.signing_key_env.as_deref(), Some("ABI_AUDIT_SEED"));
    assert_eq!(config.audit.topic, "mesh.audit");
    assert_eq!(config.policy.path, PathBuf::from("/etc/abi/policy.toml"));
    assert_eq!(config.logging.level, "debug");
    assert_eq!(config.logging.dir, Some(PathBuf::from("/var/log/abi")));

    let policy = config.admission.to_policy();
    assert_eq!(policy.challenge_ttl, Some(chrono::Duration::seconds(60)));
    assert!(policy.consume_on_failure);
}

#[test]
fn partial_config_keeps_defaults() {
    let config = AbiConfig::from_toml("[admission]\nconsume_on_failure = true\n").expect("parse");
    assert!(config.admission.consume_on_failure);
    assert_eq!(config.admission.challenge_ttl_secs, 300);
    assert_eq!(config.storage.db_path, PathBuf::from("abi_state.db"));
    assert_eq!(config.audit.log_path, PathBuf::from("abi_audit.log"));
}

#[test]
fn malformed_config_is_an_error() {
    assert!(AbiConfig::from_toml("[admission]\nchallenge_ttl_secs = \"soon\"\n").is_err());
}

#[test]
fn env_overrides_take_precedence() {
    let mut config = AbiConfig::from_toml("[storage]\ndb_path = \"file.db\"\n").expect("parse");
    config.apply_overrides(env_from(&[
        ("AEGNIX_DB_PATH", "/tmp/env.db"),
        ("AEGNIX_CHALLENGE_TTL_SECS", "30"),
        ("AEGNIX_AUDIT_LOG", "/tmp/audit.log"),
        ("AEGNIX_POLICY_PATH", "/tmp/policy.toml"),
        ("AEGNIX_LOG_DIR", "/tmp/logs"),
    ]));
    assert_eq!(config.storage.db_path, PathBuf::from("/tmp/env.db"));
    assert_eq!(config.admission.challenge_ttl_secs, 30);
    assert_eq!(config.audit.log_path, PathBuf::from("/tmp/audit.log"));
    assert_eq!(config.policy.path, PathBuf::from("/tmp/policy.toml"));
    assert_eq!(config.logging.dir, Some(PathBuf::from("/tmp/logs")));
}

#[test]
fn invalid_ttl_override_is_ignored() {
    let mut config = AbiConfig::default();
    config.apply_overrides(env_from(&[("AEGNIX_CHALLENGE_TTL_SECS", "forever")]));
    assert_eq!(config.admission.challenge_ttl_secs, 300);
}

#[test]
fn missing_file_yields_defaults() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let config = AbiConfig::load_from(&tmp.path().join("absent.toml")).expect("defaults");
    assert_eq!(config.storage.db_path, PathBuf::from("abi_state.db"));
}

#[test]
fn file_on_disk_is_loaded() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let path = tmp.path().join("config.toml");
    std::fs::write(&path, "[policy]\npath = \"custom.toml\"\n").expect("write");
    let config = AbiConfig::load_from(&path).expect("load");
    assert_eq!(config.policy.path, PathBuf::from("custom.toml"));
}

#[test]
fn config_path_honours_env_override() {
    let path = config_path_with(env_from(&[("AEGNIX_CONFIG_PATH", "/etc/abi/config.toml")]))
        .expect("path");
    assert_eq!(path, PathBuf::from("/etc/abi/config.toml"));

    let default = config_path_with(env_from(&[])).expect("path");
    assert!(default.ends_with(".aegnix/config.toml"));
}

fn audit_config(dir: &std::path::Path) -> AuditConfig {
    AuditConfig {
        log_path: dir.join("abi_audit.log"),
        topic: "mesh.audit".to_owned(),
        ..AuditConfig::default()
    }
}

#[tokio::test]
async fn audit_logger_publishes_to_configured_topic() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let (transport, mut rx) = ChannelTransport::new();
    let logger = audit_config(tmp.path())
        .open_logger(env_from(&[]), Some(Arc::new(transport)))
        .expect("open");

    logger
        .log_event(AuditEventType::KeyAdded, serde_json::json!({"ae_id": "ae-1"}))
        .expect("log");
    let msg = rx.recv().await.expect("published");
    assert_eq!(msg.topic, "mesh.audit");
}

#[test]
fn audit_logger_signs_with_seed_from_env() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let seed = "2222222222222222222222222222222222222222222222222222222222222222";
    let mut config = audit_config(tmp.path());
    config.signing_key_env = Some("ABI_AUDIT_SEED".to_owned());

    let missing = config.open_logger(env_from(&[]), None);
    assert!(missing.is_err());

    let logger = config
        .open_logger(env_from(&[("ABI_AUDIT_SEED", seed)]), None)
        .expect("open");
    let record = logger
        .log_event(AuditEventType::KeyRevoked, serde_json::json!({"ae_id": "ae-1"}))
        .expect("log");
    let signer = AuditSigner::from_hex("abi-ed25519-1", seed).expect("seed");
    let line = record.to_canonical().expect("canonical");
    assert!(verify_record(&line, &signer.public_key(), &Ed25519Verifier).expect("verify"));
}
