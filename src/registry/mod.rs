//! Identity registry: enrollment, trust status transitions and key lookup.
//!
//! [`KeyRegistry`] wraps a [`KeyStore`] capability. Every mutation is a
//! read-modify-write performed under a per-identity lock owned by the
//! registry, so a revoke racing a verification can never leave a record
//! trusted. The admission path borrows the same lock through
//! [`IdentityGuard`].
//!
//! Persistence always commits before the corresponding audit event is
//! emitted, and audit emission never fails the mutation.

pub mod memory;
pub mod sqlite;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::audit::{AuditEventType, AuditSink};
use crate::crypto::{self, Fingerprinter, Sha256Fingerprinter};

// ---------------------------------------------------------------------------
// Domain types
// ---------------------------------------------------------------------------

/// Admission status of an identity. `Revoked` is terminal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrustStatus {
    /// Known but not yet reviewed.
    Pending,
    /// Enrolled, has not proven key possession.
    #[default]
    Untrusted,
    /// Proved key possession through the challenge handshake.
    Trusted,
    /// Permanently barred.
    Revoked,
}

impl TrustStatus {
    /// Returns the string representation stored in the keyring.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Untrusted => "untrusted",
            Self::Trusted => "trusted",
            Self::Revoked => "revoked",
        }
    }

    /// Parse from the stored text value.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is not one of the four statuses.
    pub fn parse(s: &str) -> Result<Self, RegistryError> {
        match s {
            "pending" => Ok(Self::Pending),
            "untrusted" => Ok(Self::Untrusted),
            "trusted" => Ok(Self::Trusted),
            "revoked" => Ok(Self::Revoked),
            other => Err(RegistryError::InvalidStatus(other.to_owned())),
        }
    }
}

impl std::fmt::Display for TrustStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered, deduplicated set of role names. Carried, not enforced.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Roles(Vec<String>);

impl Roles {
    /// Parse the comma-separated wire form.
    ///
    /// Tokens are trimmed, empty tokens dropped, duplicates removed keeping
    /// the first occurrence.
    pub fn parse(wire: &str) -> Self {
        Self::from_names(wire.split(','))
    }

    /// Build from individual names with the same normalization as [`Roles::parse`].
    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut out: Vec<String> = Vec::new();
        for name in names {
            let name = name.as_ref().trim();
            if name.is_empty() || out.iter().any(|r| r == name) {
                continue;
            }
            out.push(name.to_owned());
        }
        Self(out)
    }

    /// Comma-separated wire form.
    pub fn to_wire(&self) -> String {
        self.0.join(",")
    }

    /// Role names in order.
    pub fn as_slice(&self) -> &[String] {
        &self.0
    }

    /// True when there are no roles.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// One enrolled identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityRecord {
    /// Unique, immutable identity key.
    pub id: String,
    /// Public key, canonical padded base64.
    pub public_key_b64: String,
    /// Digest of the decoded public key; recomputed on every write.
    pub fingerprint: String,
    /// Declared roles.
    pub roles: Roles,
    /// Current admission status.
    pub status: TrustStatus,
    /// Optional expiry instant, epoch seconds on the wire.
    #[serde(with = "chrono::serde::ts_seconds_option", default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl IdentityRecord {
    /// Decode the stored public key.
    ///
    /// # Errors
    ///
    /// Returns the decode error if the stored value is not base64.
    pub fn public_key_bytes(&self) -> Result<Vec<u8>, base64::DecodeError> {
        crypto::decode_b64_lenient(&self.public_key_b64)
    }

    /// True when `expires_at` is set and not after `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Parameters for [`KeyRegistry::enroll`].
#[derive(Debug, Clone)]
pub struct Enrollment {
    /// Identity key.
    pub id: String,
    /// Base64 public key; missing padding is tolerated.
    pub public_key_b64: String,
    /// Roles to assign.
    pub roles: Roles,
    /// Initial status.
    pub status: TrustStatus,
    /// Optional expiry.
    pub expires_at: Option<DateTime<Utc>>,
}

impl Enrollment {
    /// Enrollment with no roles, status `untrusted` and no expiry.
    pub fn new(id: impl Into<String>, public_key_b64: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            public_key_b64: public_key_b64.into(),
            roles: Roles::default(),
            status: TrustStatus::default(),
            expires_at: None,
        }
    }

    /// Set roles.
    pub fn roles(mut self, roles: Roles) -> Self {
        self.roles = roles;
        self
    }

    /// Set the initial status.
    pub fn status(mut self, status: TrustStatus) -> Self {
        self.status = status;
        self
    }

    /// Set the expiry instant.
    pub fn expires_at(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.expires_at = at;
        self
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Storage backend failure.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backend rejected or failed the operation.
    #[error("storage backend error: {0}")]
    Backend(String),
    /// A stored row could not be interpreted.
    #[error("corrupt stored record: {0}")]
    Corrupt(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        Self::Backend(e.to_string())
    }
}

/// Registry operation failure.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Identity key is empty.
    #[error("identity id must not be empty")]
    InvalidId,
    /// Public key is not valid base64.
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),
    /// Status string is not recognised.
    #[error("invalid trust status: {0}")]
    InvalidStatus(String),
    /// No record exists for the identity.
    #[error("unknown identity: {0}")]
    NotFound(String),
    /// Storage fault, surfaced unretried.
    #[error(transparent)]
    Store(#[from] StoreError),
}

// ---------------------------------------------------------------------------
// Storage capability
// ---------------------------------------------------------------------------

/// Durable storage for identity records.
#[async_trait]
pub trait KeyStore: Send + Sync {
    /// Fetch a record by id.
    async fn get(&self, id: &str) -> Result<Option<IdentityRecord>, StoreError>;

    /// Insert or overwrite a record.
    async fn upsert(&self, record: &IdentityRecord) -> Result<(), StoreError>;

    /// Set status to `revoked`. Returns whether a record existed.
    async fn revoke(&self, id: &str) -> Result<bool, StoreError>;

    /// All records, ordered by id.
    async fn list(&self) -> Result<Vec<IdentityRecord>, StoreError>;

    /// Find a record by fingerprint.
    async fn find_by_fingerprint(
        &self,
        fingerprint: &str,
    ) -> Result<Option<IdentityRecord>, StoreError> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .find(|r| r.fingerprint == fingerprint))
    }

    /// Find a record by canonical base64 public key.
    async fn find_by_public_key(
        &self,
        public_key_b64: &str,
    ) -> Result<Option<IdentityRecord>, StoreError> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .find(|r| r.public_key_b64 == public_key_b64))
    }
}

// ---------------------------------------------------------------------------
// Per-identity locking
// ---------------------------------------------------------------------------

/// Prune idle lock entries once the table reaches this size.
const LOCK_PRUNE_THRESHOLD: usize = 1024;

/// Table of async mutexes keyed by identity id.
#[derive(Debug, Default)]
pub struct IdentityLocks {
    locks: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl IdentityLocks {
    /// Wait for exclusive access to `id`.
    pub async fn acquire(&self, id: &str) -> IdentityGuard {
        let lock = {
            let mut map = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            if map.len() >= LOCK_PRUNE_THRESHOLD {
                map.retain(|_, l| Arc::strong_count(l) > 1);
            }
            Arc::clone(map.entry(id.to_owned()).or_default())
        };
        IdentityGuard {
            id: id.to_owned(),
            _guard: lock.lock_owned().await,
        }
    }
}

/// Exclusive access to one identity, released on drop.
#[derive(Debug)]
pub struct IdentityGuard {
    id: String,
    _guard: OwnedMutexGuard<()>,
}

impl IdentityGuard {
    /// The locked identity.
    pub fn id(&self) -> &str {
        &self.id
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// CRUD and trust transitions over identity records.
pub struct KeyRegistry {
    store: Arc<dyn KeyStore>,
    fingerprinter: Arc<dyn Fingerprinter>,
    audit: Arc<dyn AuditSink>,
    locks: IdentityLocks,
}

impl KeyRegistry {
    /// Registry over `store` using SHA-256 fingerprints.
    pub fn new(store: Arc<dyn KeyStore>, audit: Arc<dyn AuditSink>) -> Self {
        Self::with_fingerprinter(store, Arc::new(Sha256Fingerprinter), audit)
    }

    /// Registry with a custom fingerprint function.
    pub fn with_fingerprinter(
        store: Arc<dyn KeyStore>,
        fingerprinter: Arc<dyn Fingerprinter>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            store,
            fingerprinter,
            audit,
            locks: IdentityLocks::default(),
        }
    }

    /// Wait for exclusive access to `id`.
    pub async fn lock(&self, id: &str) -> IdentityGuard {
        self.locks.acquire(id).await
    }

    /// Fingerprint of raw public key bytes.
    pub fn fingerprint(&self, public_key: &[u8]) -> String {
        self.fingerprinter.fingerprint(public_key)
    }

    /// Enroll or re-enroll an identity.
    ///
    /// Re-enrolling overwrites key material, fingerprint, roles and expiry.
    /// A revoked identity stays revoked.
    ///
    /// # Errors
    ///
    /// Returns an error for an empty id, an undecodable key, or a storage fault.
    pub async fn enroll(&self, enrollment: Enrollment) -> Result<IdentityRecord, RegistryError> {
        if enrollment.id.trim().is_empty() {
            return Err(RegistryError::InvalidId);
        }
        let key_bytes = crypto::decode_b64_lenient(&enrollment.public_key_b64)
            .map_err(|e| RegistryError::InvalidPublicKey(e.to_string()))?;

        let guard = self.lock(&enrollment.id).await;
        let mut status = enrollment.status;
        if let Some(existing) = self.store.get(guard.id()).await? {
            if existing.status == TrustStatus::Revoked && status != TrustStatus::Revoked {
                warn!(ae_id = %guard.id(), "re-enrollment of revoked identity keeps it revoked");
                status = TrustStatus::Revoked;
            }
        }

        let record = IdentityRecord {
            id: enrollment.id.clone(),
            public_key_b64: crypto::encode_b64(&key_bytes),
            fingerprint: self.fingerprint(&key_bytes),
            roles: enrollment.roles,
            status,
            expires_at: enrollment.expires_at,
        };
        self.store.upsert(&record).await?;
        drop(guard);

        info!(
            ae_id = %record.id,
            fingerprint = %record.fingerprint,
            status = %record.status,
            "identity enrolled"
        );
        self.audit.record(
            AuditEventType::KeyAdded,
            serde_json::json!({
                "ae_id": record.id,
                "fingerprint": record.fingerprint,
                "status": record.status,
                "roles": record.roles,
                "ts": Utc::now().timestamp(),
            }),
        );
        Ok(record)
    }

    /// Revoke an identity. Idempotent; a no-op for unknown ids.
    ///
    /// # Errors
    ///
    /// Returns an error only on a storage fault.
    pub async fn revoke(&self, id: &str) -> Result<(), RegistryError> {
        let guard = self.lock(id).await;
        let found = self.store.revoke(guard.id()).await?;
        drop(guard);

        if !found {
            debug!(ae_id = %id, "revoke ignored for unknown identity");
            return Ok(());
        }
        info!(ae_id = %id, "identity revoked");
        self.audit.record(
            AuditEventType::KeyRevoked,
            serde_json::json!({ "ae_id": id, "ts": Utc::now().timestamp() }),
        );
        Ok(())
    }

    /// Move an identity to `trusted` unless it is revoked.
    ///
    /// Returns `false` for unknown or revoked identities, `true` otherwise.
    /// Only an actual transition emits `key_trusted`.
    ///
    /// # Errors
    ///
    /// Returns an error only on a storage fault.
    pub async fn elevate(&self, id: &str) -> Result<bool, RegistryError> {
        let guard = self.lock(id).await;
        self.elevate_locked(&guard).await
    }

    /// [`KeyRegistry::elevate`] for a caller already holding the identity lock.
    pub(crate) async fn elevate_locked(
        &self,
        guard: &IdentityGuard,
    ) -> Result<bool, RegistryError> {
        let Some(mut record) = self.store.get(guard.id()).await? else {
            return Ok(false);
        };
        match record.status {
            TrustStatus::Revoked => Ok(false),
            TrustStatus::Trusted => Ok(true),
            TrustStatus::Pending | TrustStatus::Untrusted => {
                record.status = TrustStatus::Trusted;
                self.store.upsert(&record).await?;
                info!(ae_id = %record.id, "identity trusted");
                self.audit.record(
                    AuditEventType::KeyTrusted,
                    serde_json::json!({ "ae_id": record.id, "ts": Utc::now().timestamp() }),
                );
                Ok(true)
            }
        }
    }

    /// Replace the role set of an identity.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotFound`] for unknown ids, or a storage fault.
    pub async fn set_roles(&self, id: &str, roles: Roles) -> Result<IdentityRecord, RegistryError> {
        let guard = self.lock(id).await;
        let mut record = self
            .store
            .get(guard.id())
            .await?
            .ok_or_else(|| RegistryError::NotFound(id.to_owned()))?;
        record.roles = roles;
        self.store.upsert(&record).await?;
        drop(guard);

        info!(ae_id = %id, roles = %record.roles.to_wire(), "identity roles updated");
        self.audit.record(
            AuditEventType::KeyRolesUpdated,
            serde_json::json!({
                "ae_id": id,
                "roles": record.roles,
                "ts": Utc::now().timestamp(),
            }),
        );
        Ok(record)
    }

    /// Fetch a record by id.
    ///
    /// # Errors
    ///
    /// Returns an error only on a storage fault.
    pub async fn lookup(&self, id: &str) -> Result<Option<IdentityRecord>, RegistryError> {
        Ok(self.store.get(id).await?)
    }

    /// Fetch a record under a held identity lock.
    pub(crate) async fn lookup_locked(
        &self,
        guard: &IdentityGuard,
    ) -> Result<Option<IdentityRecord>, RegistryError> {
        Ok(self.store.get(guard.id()).await?)
    }

    /// Fetch a record by fingerprint.
    ///
    /// # Errors
    ///
    /// Returns an error only on a storage fault.
    pub async fn lookup_by_fingerprint(
        &self,
        fingerprint: &str,
    ) -> Result<Option<IdentityRecord>, RegistryError> {
        Ok(self.store.find_by_fingerprint(fingerprint).await?)
    }

    /// Fetch a record by base64 public key; padding differences are ignored.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is not base64, or on a storage fault.
    pub async fn lookup_by_public_key(
        &self,
        public_key_b64: &str,
    ) -> Result<Option<IdentityRecord>, RegistryError> {
        let bytes = crypto::decode_b64_lenient(public_key_b64)
            .map_err(|e| RegistryError::InvalidPublicKey(e.to_string()))?;
        Ok(self
            .store
            .find_by_public_key(&crypto::encode_b64(&bytes))
            .await?)
    }

    /// All records, ordered by id.
    ///
    /// # Errors
    ///
    /// Returns an error only on a storage fault.
    pub async fn list(&self) -> Result<Vec<IdentityRecord>, RegistryError> {
        Ok(self.store.list().await?)
    }
}
