//! Challenge/response admission.
//!
//! An identity proves possession of its private key by signing a 16-byte
//! random nonce issued by [`AdmissionService::issue_challenge`]. A successful
//! [`AdmissionService::verify_response`] consumes the challenge and elevates
//! the identity to `trusted` in the [`KeyRegistry`].
//!
//! Protocol failures are values ([`ReasonCode`]), never errors. The only
//! `Err` a caller sees is a storage fault from the registry.
//!
//! Per-identity state (challenge and trust status) is only touched while
//! holding the registry's identity lock, so issue, verify, revoke and elevate
//! on the same identity are serialized. Distinct identities never contend.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::audit::{AuditEventType, AuditSink};
use crate::crypto::{self, SignatureVerifier};
use crate::registry::{KeyRegistry, RegistryError, TrustStatus};

/// Nonce length in bytes.
pub const NONCE_LEN: usize = 16;

/// Default challenge lifetime in seconds.
pub const DEFAULT_CHALLENGE_TTL_SECS: i64 = 300;

/// Issuing sweeps expired challenges once the table reaches this size.
pub const CHALLENGE_SWEEP_THRESHOLD: usize = 1024;

/// Outcome of a verification attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReasonCode {
    /// The signature verified; the identity is trusted.
    Verified,
    /// No record exists for the identity.
    UnknownIdentity,
    /// The identity is revoked.
    RevokedIdentity,
    /// No live challenge is pending for the identity.
    NoActiveChallenge,
    /// The stored key or supplied signature is not valid base64.
    DecodeError(String),
    /// The signature does not verify over the pending nonce.
    InvalidSignature,
    /// The verification primitive failed over the inputs.
    VerificationError(String),
}

impl ReasonCode {
    /// True for [`ReasonCode::Verified`].
    pub fn is_verified(&self) -> bool {
        matches!(self, Self::Verified)
    }
}

impl std::fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Verified => f.write_str("verified"),
            Self::UnknownIdentity => f.write_str("unknown_ae"),
            Self::RevokedIdentity => f.write_str("revoked"),
            Self::NoActiveChallenge => f.write_str("no_active_challenge"),
            Self::DecodeError(detail) => write!(f, "decode_error:{detail}"),
            Self::InvalidSignature => f.write_str("invalid_signature"),
            Self::VerificationError(detail) => write!(f, "verification_error:{detail}"),
        }
    }
}

/// Result of [`AdmissionService::verify_response`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verification {
    /// Whether the identity was admitted.
    pub admitted: bool,
    /// Why.
    pub reason: ReasonCode,
}

impl Verification {
    fn admitted() -> Self {
        Self {
            admitted: true,
            reason: ReasonCode::Verified,
        }
    }

    fn denied(reason: ReasonCode) -> Self {
        Self {
            admitted: false,
            reason,
        }
    }

    /// `(admitted, reason_code)` in wire form.
    pub fn into_parts(self) -> (bool, String) {
        (self.admitted, self.reason.to_string())
    }
}

/// A pending challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    /// Random nonce the identity must sign.
    pub nonce: [u8; NONCE_LEN],
    /// When the nonce was issued.
    pub issued_at: DateTime<Utc>,
}

impl Challenge {
    fn is_expired(&self, ttl: Option<Duration>, now: DateTime<Utc>) -> bool {
        let Some(ttl) = ttl else {
            return false;
        };
        match self.issued_at.checked_add_signed(ttl) {
            Some(deadline) => deadline <= now,
            None => false,
        }
    }
}

/// Tunables for the challenge lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionPolicy {
    /// Challenge lifetime. `None` disables expiry.
    pub challenge_ttl: Option<Duration>,
    /// Whether an `invalid_signature` outcome consumes the pending challenge.
    pub consume_on_failure: bool,
}

impl Default for AdmissionPolicy {
    fn default() -> Self {
        Self {
            challenge_ttl: Some(Duration::seconds(DEFAULT_CHALLENGE_TTL_SECS)),
            consume_on_failure: false,
        }
    }
}

/// Infrastructure failure during admission.
#[derive(Debug, Error)]
pub enum AdmissionError {
    /// Registry or storage fault.
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Runs the nonce challenge/response handshake.
pub struct AdmissionService {
    registry: Arc<KeyRegistry>,
    verifier: Arc<dyn SignatureVerifier>,
    audit: Arc<dyn AuditSink>,
    policy: AdmissionPolicy,
    challenges: Mutex<HashMap<String, Challenge>>,
}

impl AdmissionService {
    /// Create a service over `registry` using `verifier` for signatures.
    pub fn new(
        registry: Arc<KeyRegistry>,
        verifier: Arc<dyn SignatureVerifier>,
        audit: Arc<dyn AuditSink>,
        policy: AdmissionPolicy,
    ) -> Self {
        Self {
            registry,
            verifier,
            audit,
            policy,
            challenges: Mutex::new(HashMap::new()),
        }
    }

    /// The active lifecycle policy.
    pub fn policy(&self) -> &AdmissionPolicy {
        &self.policy
    }

    /// Issue a fresh nonce for `id`, replacing any pending one.
    ///
    /// The identity is not looked up; unknown identities are rejected at
    /// verification time.
    pub async fn issue_challenge(&self, id: &str) -> String {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let guard = self.registry.lock(id).await;
        let now = Utc::now();
        let replaced = {
            let mut map = self.challenges();
            if map.len() >= CHALLENGE_SWEEP_THRESHOLD {
                let ttl = self.policy.challenge_ttl;
                map.retain(|_, c| !c.is_expired(ttl, now));
            }
            map.insert(
                guard.id().to_owned(),
                Challenge {
                    nonce,
                    issued_at: now,
                },
            )
            .is_some()
        };
        drop(guard);

        debug!(ae_id = %id, replaced, "challenge issued");
        self.audit.record(
            AuditEventType::ChallengeIssued,
            serde_json::json!({ "ae_id": id, "ts": Utc::now().timestamp() }),
        );
        crypto::encode_b64(&nonce)
    }

    /// Verify a base64 signature over the pending nonce for `id`.
    ///
    /// Checks, in order: identity exists, identity not revoked, challenge
    /// pending and unexpired, inputs decode, signature verifies. On success
    /// the challenge is consumed and the identity elevated. An
    /// `invalid_signature` outcome leaves the challenge in place unless
    /// [`AdmissionPolicy::consume_on_failure`] is set.
    ///
    /// # Errors
    ///
    /// Returns an error only when the registry's storage fails.
    pub async fn verify_response(
        &self,
        id: &str,
        signature_b64: &str,
    ) -> Result<Verification, AdmissionError> {
        let guard = self.registry.lock(id).await;

        let Some(record) = self.registry.lookup_locked(&guard).await? else {
            return Ok(self.deny(id, ReasonCode::UnknownIdentity));
        };
        if record.status == TrustStatus::Revoked {
            return Ok(self.deny(id, ReasonCode::RevokedIdentity));
        }

        let Some(challenge) = self.live_challenge(id) else {
            return Ok(self.deny(id, ReasonCode::NoActiveChallenge));
        };

        let public_key = match record.public_key_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                let reason = ReasonCode::DecodeError(format!("public key: {e}"));
                return Ok(self.deny(id, reason));
            }
        };
        let signature = match crypto::decode_b64_lenient(signature_b64) {
            Ok(bytes) => bytes,
            Err(e) => {
                let reason = ReasonCode::DecodeError(format!("signature: {e}"));
                return Ok(self.deny(id, reason));
            }
        };

        match self
            .verifier
            .verify(&public_key, &signature, &challenge.nonce)
        {
            Ok(true) => {
                self.challenges().remove(id);
                self.registry.elevate_locked(&guard).await?;
                drop(guard);

                info!(ae_id = %id, "challenge verified");
                self.audit.record(
                    AuditEventType::ChallengeVerified,
                    serde_json::json!({ "ae_id": id, "ts": Utc::now().timestamp() }),
                );
                Ok(Verification::admitted())
            }
            Ok(false) => {
                if self.policy.consume_on_failure {
                    self.challenges().remove(id);
                }
                Ok(self.deny(id, ReasonCode::InvalidSignature))
            }
            Err(e) => Ok(self.deny(id, ReasonCode::VerificationError(e.to_string()))),
        }
    }

    /// The pending challenge for `id`, if any, regardless of expiry.
    pub fn pending_challenge(&self, id: &str) -> Option<Challenge> {
        self.challenges().get(id).cloned()
    }

    /// Number of pending challenges, expired ones not yet swept included.
    pub fn pending_count(&self) -> usize {
        self.challenges().len()
    }

    /// Drop every expired challenge. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let ttl = self.policy.challenge_ttl;
        let mut map = self.challenges();
        let before = map.len();
        map.retain(|_, c| !c.is_expired(ttl, now));
        let purged = before.saturating_sub(map.len());
        if purged > 0 {
            debug!(purged, "expired challenges purged");
        }
        purged
    }

    /// Pending challenge for `id`, removing it first if it has expired.
    fn live_challenge(&self, id: &str) -> Option<Challenge> {
        let mut map = self.challenges();
        let challenge = map.get(id)?.clone();
        if challenge.is_expired(self.policy.challenge_ttl, Utc::now()) {
            map.remove(id);
            debug!(ae_id = %id, "expired challenge discarded");
            return None;
        }
        Some(challenge)
    }

    fn challenges(&self) -> MutexGuard<'_, HashMap<String, Challenge>> {
        self.challenges.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn deny(&self, id: &str, reason: ReasonCode) -> Verification {
        match reason {
            ReasonCode::RevokedIdentity | ReasonCode::InvalidSignature => {
                warn!(ae_id = %id, reason = %reason, "challenge response rejected");
            }
            _ => debug!(ae_id = %id, reason = %reason, "challenge response rejected"),
        }
        self.audit.record(
            AuditEventType::ChallengeFailed,
            serde_json::json!({
                "ae_id": id,
                "reason": reason.to_string(),
                "ts": Utc::now().timestamp(),
            }),
        );
        Verification::denied(reason)
    }
}
