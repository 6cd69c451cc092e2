//! Tests for `KeyRegistry` over the in-memory store.

use std::sync::Arc;

use chrono::{TimeZone, Utc};
use ed25519_dalek::SigningKey;
use sha2::{Digest, Sha256};

use aegnix::audit::{AuditEventType, MemoryAuditSink};
use aegnix::crypto;
use aegnix::registry::memory::InMemoryKeyStore;
use aegnix::registry::{Enrollment, KeyRegistry, RegistryError, Roles, TrustStatus};

fn registry() -> (KeyRegistry, Arc<MemoryAuditSink>) {
    let audit = Arc::new(MemoryAuditSink::new());
    let registry = KeyRegistry::new(Arc::new(InMemoryKeyStore::new()), audit.clone());
    (registry, audit)
}

fn public_key(seed: u8) -> [u8; 32] {
    SigningKey::from_bytes(&[seed; 32]).verifying_key().to_bytes()
}

#[tokio::test]
async fn enroll_stores_record_with_sha256_fingerprint() {
    let (registry, audit) = registry();
    let pk = public_key(1);

    let record = registry
        .enroll(
            Enrollment::new("ae-1", crypto::encode_b64(&pk))
                .roles(Roles::parse("sensor,planner")),
        )
        .await
        .expect("enroll");

    assert_eq!(record.fingerprint, hex::encode(Sha256::digest(pk)));
    assert_eq!(record.status, TrustStatus::Untrusted);
    assert_eq!(record.roles.as_slice(), ["sensor", "planner"]);
    assert_eq!(
        registry.lookup("ae-1").await.expect("lookup"),
        Some(record)
    );
    assert_eq!(audit.count(AuditEventType::KeyAdded), 1);
}

#[tokio::test]
async fn reenroll_overwrites_key_and_fingerprint() {
    let (registry, audit) = registry();
    let first = registry
        .enroll(Enrollment::new("ae-1", crypto::encode_b64(&public_key(1))))
        .await
        .expect("enroll");
    let second = registry
        .enroll(
            Enrollment::new("ae-1", crypto::encode_b64(&public_key(2)))
                .status(TrustStatus::Pending),
        )
        .await
        .expect("re-enroll");

    assert_ne!(first.fingerprint, second.fingerprint);
    assert_eq!(second.status, TrustStatus::Pending);
    assert_eq!(registry.list().await.expect("list").len(), 1);
    assert_eq!(audit.count(AuditEventType::KeyAdded), 2);
}

#[tokio::test]
async fn unpadded_key_is_stored_canonically() {
    let (registry, _) = registry();
    let padded = crypto::encode_b64(&public_key(1));
    let unpadded = padded.trim_end_matches('=').to_owned();
    assert_ne!(padded, unpadded);

    let record = registry
        .enroll(Enrollment::new("ae-1", unpadded.clone()))
        .await
        .expect("enroll");
    assert_eq!(record.public_key_b64, padded);

    let found = registry
        .lookup_by_public_key(&unpadded)
        .await
        .expect("lookup")
        .expect("present");
    assert_eq!(found.id, "ae-1");
}

#[tokio::test]
async fn enroll_rejects_bad_input() {
    let (registry, audit) = registry();
    let err = registry
        .enroll(Enrollment::new("  ", crypto::encode_b64(&public_key(1))))
        .await
        .expect_err("empty id");
    assert!(matches!(err, RegistryError::InvalidId));

    let err = registry
        .enroll(Enrollment::new("ae-1", "not base64 at all!"))
        .await
        .expect_err("bad key");
    assert!(matches!(err, RegistryError::InvalidPublicKey(_)));

    assert!(registry.list().await.expect("list").is_empty());
    assert!(audit.events().is_empty());
}

#[tokio::test]
async fn revoke_is_idempotent_and_silent_for_unknown() {
    let (registry, audit) = registry();
    registry.revoke("ghost").await.expect("revoke unknown");
    assert!(registry.lookup("ghost").await.expect("lookup").is_none());
    assert_eq!(audit.count(AuditEventType::KeyRevoked), 0);

    registry
        .enroll(Enrollment::new("ae-1", crypto::encode_b64(&public_key(1))))
        .await
        .expect("enroll");
    registry.revoke("ae-1").await.expect("revoke");
    registry.revoke("ae-1").await.expect("revoke again");
    let record = registry.lookup("ae-1").await.expect("lookup").expect("present");
    assert_eq!(record.status, TrustStatus::Revoked);
}

#[tokio::test]
async fn revoked_is_terminal() {
    let (registry, audit) = registry();
    registry
        .enroll(Enrollment::new("ae-1", crypto::encode_b64(&public_key(1))))
        .await
        .expect("enroll");
    registry.revoke("ae-1").await.expect("revoke");

    assert!(!registry.elevate("ae-1").await.expect("elevate"));
    let record = registry
        .enroll(
            Enrollment::new("ae-1", crypto::encode_b64(&public_key(2)))
                .status(TrustStatus::Trusted),
        )
        .await
        .expect("re-enroll");
    assert_eq!(record.status, TrustStatus::Revoked);
    assert_eq!(record.public_key_b64, crypto::encode_b64(&public_key(2)));
    assert_eq!(audit.count(AuditEventType::KeyTrusted), 0);
}

#[tokio::test]
async fn elevate_transitions_once() {
    let (registry, audit) = registry();
    assert!(!registry.elevate("ghost").await.expect("elevate unknown"));

    registry
        .enroll(Enrollment::new("ae-1", crypto::encode_b64(&public_key(1))))
        .await
        .expect("enroll");
    assert!(registry.elevate("ae-1").await.expect("elevate"));
    assert!(registry.elevate("ae-1").await.expect("elevate again"));
    assert_eq!(audit.count(AuditEventType::KeyTrusted), 1);

    let record = registry.lookup("ae-1").await.expect("lookup").expect("present");
    assert_eq!(record.status, TrustStatus::Trusted);
}

#[tokio::test]
async fn set_roles_replaces_role_set() {
    let (registry, audit) = registry();
    let err = registry
        .set_roles("ghost", Roles::parse("a"))
        .await
        .expect_err("unknown id");
    assert!(matches!(err, RegistryError::NotFound(id) if id == "ghost"));

    registry
        .enroll(
            Enrollment::new("ae-1", crypto::encode_b64(&public_key(1)))
                .roles(Roles::parse("sensor")),
        )
        .await
        .expect("enroll");
    let record = registry
        .set_roles("ae-1", Roles::parse("planner, actuator"))
        .await
        .expect("set roles");
    assert_eq!(record.roles.to_wire(), "planner,actuator");
    assert_eq!(audit.count(AuditEventType::KeyRolesUpdated), 1);
}

#[tokio::test]
async fn lookups_by_fingerprint_and_list_order() {
    let (registry, _) = registry();
    for (id, seed) in [("ae-b", 2), ("ae-a", 1), ("ae-c", 3)] {
        registry
            .enroll(Enrollment::new(id, crypto::encode_b64(&public_key(seed))))
            .await
            .expect("enroll");
    }

    let ids: Vec<String> = registry
        .list()
        .await
        .expect("list")
        .into_iter()
        .map(|r| r.id)
        .collect();
    assert_eq!(ids, ["ae-a", "ae-b", "ae-c"]);

    let fp = registry.fingerprint(&public_key(3));
    let found = registry
        .lookup_by_fingerprint(&fp)
        .await
        .expect("lookup")
        .expect("present");
    assert_eq!(found.id, "ae-c");
    assert!(registry
        .lookup_by_fingerprint("0000")
        .await
        .expect("lookup")
        .is_none());
}

#[tokio::test]
async fn expiry_is_carried_on_the_record() {
    let (registry, _) = registry();
    let at = Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).single().expect("valid date");
    let record = registry
        .enroll(
            Enrollment::new("ae-1", crypto::encode_b64(&public_key(1))).expires_at(Some(at)),
        )
        .await
        .expect("enroll");
    assert_eq!(record.expires_at, Some(at));
    let before = Utc
        .with_ymd_and_hms(2029, 1, 1, 0, 0, 0)
        .single()
        .expect("valid date");
    assert!(!record.is_expired_at(before));
    assert!(record.is_expired_at(at));
}
