//! Tests for `PolicyEngine` ceiling semantics and policy file loading.

use std::collections::BTreeSet;

use aegnix::policy::{
    Action, CapabilityRoster, DeclaredCapabilities, PolicyEngine, PolicyError, PolicyFile,
    RejectionReason, StaticPolicy, SubjectRule,
};

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| (*s).to_owned()).collect()
}

fn static_policy() -> StaticPolicy {
    let mut policy = StaticPolicy::new();
    policy.insert(
        "telemetry.raw",
        SubjectRule {
            publishers: strings(&["ae-1"]),
            subscribers: strings(&["ae-3", "ae-4"]),
            labels: strings(&["raw", "sensor"]),
        },
    );
    policy.insert(
        "commands.plan",
        SubjectRule {
            publishers: strings(&["ae-3"]),
            subscribers: strings(&["ae-1"]),
            labels: Vec::new(),
        },
    );
    policy
}

fn publishes(subjects: &[&str]) -> DeclaredCapabilities {
    DeclaredCapabilities {
        publishes: strings(subjects),
        subscribes: Vec::new(),
    }
}

#[test]
fn declaration_cannot_exceed_static_ceiling() {
    let mut roster = CapabilityRoster::new();
    roster.declare("ae-2", publishes(&["telemetry.raw"]));
    let engine = PolicyEngine::build(static_policy(), &roster);

    assert!(!engine.can_publish("ae-2", "telemetry.raw"));
    assert!(engine.can_publish("ae-1", "telemetry.raw"));

    let rejected = engine.rejected_declarations();
    assert_eq!(rejected.len(), 1);
    assert_eq!(rejected[0].ae_id, "ae-2");
    assert_eq!(rejected[0].action, Action::Publish);
    assert_eq!(rejected[0].reason, RejectionReason::OutsideCeiling);
}

#[test]
fn unknown_subject_has_no_labels_and_denies_everything() {
    let engine = PolicyEngine::build(static_policy(), &CapabilityRoster::new());
    assert!(engine.subject_labels("unknown.subject").is_empty());
    assert!(!engine.can_publish("ae-1", "unknown.subject"));
    assert!(!engine.can_subscribe("ae-1", "unknown.subject"));
}

#[test]
fn declarations_for_unknown_subjects_are_rejected() {
    let mut roster = CapabilityRoster::new();
    roster.declare(
        "ae-1",
        DeclaredCapabilities {
            publishes: strings(&["nowhere"]),
            subscribes: strings(&["commands.plan"]),
        },
    );
    let engine = PolicyEngine::build(static_policy(), &roster);

    assert!(!engine.can_publish("ae-1", "nowhere"));
    assert!(engine.can_subscribe("ae-1", "commands.plan"));
    assert_eq!(engine.subjects(), ["commands.plan", "telemetry.raw"]);

    let rejected = engine.rejected_declarations();
    assert_eq!(rejected.len(), 1);
    assert_eq!(rejected[0].subject, "nowhere");
    assert_eq!(rejected[0].reason, RejectionReason::UnknownSubject);
}

#[test]
fn effective_sets_never_exceed_static_lists() {
    let mut roster = CapabilityRoster::new();
    for id in ["ae-1", "ae-2", "ae-3", "ae-4", "ae-5"] {
        roster.declare(
            id,
            DeclaredCapabilities {
                publishes: strings(&["telemetry.raw", "commands.plan"]),
                subscribes: strings(&["telemetry.raw", "commands.plan"]),
            },
        );
    }
    let policy = static_policy();
    let engine = PolicyEngine::build(policy.clone(), &roster);

    for (subject, rule) in &policy.0 {
        for id in ["ae-1", "ae-2", "ae-3", "ae-4", "ae-5"] {
            assert_eq!(
                engine.can_publish(id, subject),
                rule.publishers.iter().any(|p| p == id),
                "publish {id} on {subject}"
            );
            assert_eq!(
                engine.can_subscribe(id, subject),
                rule.subscribers.iter().any(|s| s == id),
                "subscribe {id} on {subject}"
            );
        }
    }
}

#[test]
fn labels_come_from_static_policy_only() {
    let mut roster = CapabilityRoster::new();
    roster.declare("ae-1", publishes(&["telemetry.raw"]));
    let engine = PolicyEngine::build(static_policy(), &roster);

    let expected: BTreeSet<String> = ["raw", "sensor"].iter().map(|s| (*s).to_owned()).collect();
    assert_eq!(engine.subject_labels("telemetry.raw"), expected);
    assert!(engine.subject_labels("commands.plan").is_empty());
}

#[test]
fn rebuild_produces_new_engine_and_leaves_old_untouched() {
    let mut roster = CapabilityRoster::new();
    roster.declare("ae-2", publishes(&["telemetry.raw"]));
    let first = PolicyEngine::build(static_policy(), &roster);

    let mut next = CapabilityRoster::new();
    next.declare("ae-1", publishes(&["telemetry.raw"]));
    let second = first.rebuild(&next);

    assert_eq!(first.rejected_declarations().len(), 1);
    assert!(second.rejected_declarations().is_empty());
    assert!(second.can_publish("ae-1", "telemetry.raw"));
    assert!(!second.can_publish("ae-2", "telemetry.raw"));
    assert_eq!(first.subjects(), second.subjects());
}

#[test]
fn authorize_returns_denial_value() {
    let engine = PolicyEngine::build(static_policy(), &CapabilityRoster::new());
    assert!(engine.authorize("ae-3", "telemetry.raw", Action::Subscribe).is_ok());

    let denied = engine
        .authorize("ae-2", "telemetry.raw", Action::Publish)
        .expect_err("ae-2 is not a publisher");
    assert_eq!(denied.ae_id, "ae-2");
    assert_eq!(
        denied.to_string(),
        "publish on 'telemetry.raw' denied for 'ae-2'"
    );
}

const POLICY_TOML: &str = r#"
[subjects."telemetry.raw"]
publishers = ["ae-1"]
subscribers = ["ae-3"]
labels = ["raw"]

[subjects."alerts"]
subscribers = ["ae-1", "ae-3"]

[capabilities."ae-2"]
publishes = ["telemetry.raw"]

[capabilities."ae-3"]
subscribes = ["alerts", "telemetry.raw"]
"#;

#[test]
fn policy_file_parses_and_builds() {
    let file = PolicyFile::from_toml(POLICY_TOML).expect("parse");
    assert_eq!(file.subjects.0.len(), 2);
    assert_eq!(file.capabilities.0.len(), 2);

    let engine = file.into_engine();
    assert!(engine.can_publish("ae-1", "telemetry.raw"));
    assert!(!engine.can_publish("ae-2", "telemetry.raw"));
    assert!(engine.can_subscribe("ae-3", "alerts"));
    assert!(!engine.can_publish("ae-1", "alerts"));
    assert_eq!(engine.rejected_declarations().len(), 1);
}

#[test]
fn policy_file_loads_from_disk() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let path = tmp.path().join("policy.toml");
    std::fs::write(&path, POLICY_TOML).expect("write");

    let engine = PolicyFile::load(&path).expect("load").into_engine();
    assert!(engine.can_subscribe("ae-3", "telemetry.raw"));

    let missing = PolicyFile::load(&tmp.path().join("absent.toml"));
    assert!(matches!(missing, Err(PolicyError::Io { .. })));
}

#[test]
fn malformed_policy_is_a_parse_error() {
    let result = PolicyFile::from_toml("[subjects.\"x\"]\npublishers = 3\n");
    assert!(matches!(result, Err(PolicyError::Parse(_))));
}
