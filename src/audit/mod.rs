//! Audit sink for identity and admission state changes.
//!
//! Every record is one canonical JSON object per line (keys sorted, no
//! whitespace) appended to a local sink. When a signing key is configured the
//! record carries `sig = {keyId, signature}` computed over the canonical form
//! of the record without `sig`. When a transport is configured the same line
//! is published to the audit topic in the background.
//!
//! Audit emission is fire-and-forget relative to the operation that triggered
//! it: [`AuditSink::record`] never returns an error, failures are logged.

pub mod transport;

use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

use self::transport::AuditTransport;
use crate::crypto::{self, AuditSigner, CryptoError, SignatureVerifier};

/// Default producer name stamped on every record.
pub const DEFAULT_PRODUCER: &str = "abi-service";

/// Default topic for transport publication.
pub const DEFAULT_TOPIC: &str = "abi.audit.events";

/// Audit event type discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    /// An identity was enrolled or re-enrolled.
    KeyAdded,
    /// An identity was revoked.
    KeyRevoked,
    /// An identity transitioned to `trusted`.
    KeyTrusted,
    /// An identity's role set was replaced.
    KeyRolesUpdated,
    /// A challenge nonce was issued.
    ChallengeIssued,
    /// A challenge response verified.
    ChallengeVerified,
    /// A challenge response was rejected.
    ChallengeFailed,
}

impl AuditEventType {
    /// Wire name of the event type.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::KeyAdded => "key_added",
            Self::KeyRevoked => "key_revoked",
            Self::KeyTrusted => "key_trusted",
            Self::KeyRolesUpdated => "key_roles_updated",
            Self::ChallengeIssued => "challenge_issued",
            Self::ChallengeVerified => "challenge_verified",
            Self::ChallengeFailed => "challenge_failed",
        }
    }

    /// Record subject, `audit.<event_type>`.
    pub fn subject(&self) -> String {
        format!("audit.{}", self.as_str())
    }
}

/// Fire-and-forget audit capability.
pub trait AuditSink: Send + Sync {
    /// Record an event. Must not fail the caller.
    fn record(&self, event: AuditEventType, payload: Value);
}

/// Errors from writing or checking audit records.
#[derive(Debug, Error)]
pub enum AuditError {
    /// The sink could not be opened or written.
    #[error("audit io error: {0}")]
    Io(#[from] std::io::Error),
    /// The record could not be serialized or parsed.
    #[error("audit json error: {0}")]
    Json(#[from] serde_json::Error),
    /// The sink mutex was poisoned.
    #[error("audit lock poisoned")]
    LockPoisoned,
    /// The record is not a JSON object or lacks a field.
    #[error("malformed audit record: {0}")]
    Malformed(String),
    /// Signature check could not run.
    #[error("audit signature error: {0}")]
    Crypto(#[from] CryptoError),
}

/// Signature block attached to signed records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureBlock {
    /// Identifier of the signing key.
    #[serde(rename = "keyId")]
    pub key_id: String,
    /// Base64 Ed25519 signature over the unsigned canonical record.
    pub signature: String,
}

/// One audit record as written to the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Name of the producing service.
    pub producer: String,
    /// `audit.<event_type>`.
    pub subject: String,
    /// Event payload.
    pub payload: Value,
    /// Emission time, epoch seconds.
    pub ts: i64,
    /// Signature block, present when a signing key is configured.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub sig: Option<SignatureBlock>,
}

impl AuditRecord {
    /// Canonical JSON line for this record.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be converted to JSON.
    pub fn to_canonical(&self) -> Result<String, AuditError> {
        Ok(canonical_json(&serde_json::to_value(self)?))
    }

    /// Canonical JSON of the record with `sig` stripped; the signed message.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be converted to JSON.
    pub fn signing_input(&self) -> Result<String, AuditError> {
        let unsigned = AuditRecord {
            sig: None,
            ..self.clone()
        };
        unsigned.to_canonical()
    }
}

/// Serialize a JSON value with object keys sorted and no whitespace.
pub fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|(a, _), (b, _)| a.as_str().cmp(b.as_str()));
            let body: Vec<String> = entries
                .into_iter()
                .map(|(k, v)| format!("{}:{}", Value::String(k.clone()), canonical_json(v)))
                .collect();
            format!("{{{}}}", body.join(","))
        }
        Value::Array(items) => {
            let body: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", body.join(","))
        }
        other => other.to_string(),
    }
}

/// Append-only audit logger.
pub struct AuditLogger {
    producer: String,
    writer: Mutex<Box<dyn Write + Send>>,
    signer: Option<AuditSigner>,
    transport: Option<(Arc<dyn AuditTransport>, String)>,
}

impl AuditLogger {
    /// Create an audit logger that appends to the given file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened for appending.
    pub fn new(path: impl AsRef<Path>, producer: impl Into<String>) -> Result<Self, AuditError> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_ref())?;
        Ok(Self::from_writer(Box::new(file), producer))
    }

    /// Create an audit logger from an arbitrary writer.
    pub fn from_writer(writer: Box<dyn Write + Send>, producer: impl Into<String>) -> Self {
        Self {
            producer: producer.into(),
            writer: Mutex::new(writer),
            signer: None,
            transport: None,
        }
    }

    /// Sign every record with `signer`.
    pub fn with_signer(mut self, signer: AuditSigner) -> Self {
        self.signer = Some(signer);
        self
    }

    /// Publish every record to `topic` on `transport`.
    pub fn with_transport(
        mut self,
        transport: Arc<dyn AuditTransport>,
        topic: impl Into<String>,
    ) -> Self {
        self.transport = Some((transport, topic.into()));
        self
    }

    /// Build, sign, write and publish one record.
    ///
    /// Transport publication runs on the current tokio runtime in the
    /// background; its failures are logged and do not affect the result.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be serialized or written locally.
    pub fn log_event(
        &self,
        event: AuditEventType,
        payload: Value,
    ) -> Result<AuditRecord, AuditError> {
        let mut record = AuditRecord {
            producer: self.producer.clone(),
            subject: event.subject(),
            payload,
            ts: Utc::now().timestamp(),
            sig: None,
        };
        if let Some(signer) = &self.signer {
            let message = record.signing_input()?;
            record.sig = Some(SignatureBlock {
                key_id: signer.key_id().to_owned(),
                signature: crypto::encode_b64(&signer.sign(message.as_bytes())),
            });
        }

        let line = record.to_canonical()?;
        {
            let mut writer = self.writer.lock().map_err(|_| AuditError::LockPoisoned)?;
            writeln!(writer, "{line}")?;
            writer.flush()?;
        }

        if let Some((transport, topic)) = &self.transport {
            self.publish(Arc::clone(transport), topic.clone(), line.into_bytes());
        }

        Ok(record)
    }

    fn publish(&self, transport: Arc<dyn AuditTransport>, topic: String, data: Vec<u8>) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = transport.publish(&topic, &data).await {
                        warn!(topic = %topic, error = %e, "failed to publish audit record");
                    }
                });
            }
            Err(_) => {
                warn!(topic = %topic, "no async runtime, audit record not published");
            }
        }
    }
}

impl AuditSink for AuditLogger {
    fn record(&self, event: AuditEventType, payload: Value) {
        if let Err(e) = self.log_event(event, payload) {
            warn!(event = event.as_str(), error = %e, "failed to write audit record");
        }
    }
}

/// Audit sink that keeps records in memory, for embedding and tests.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<(AuditEventType, Value)>>,
}

impl MemoryAuditSink {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything recorded so far.
    pub fn events(&self) -> Vec<(AuditEventType, Value)> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(_) => Vec::new(),
        }
    }

    /// Number of records of the given type.
    pub fn count(&self, event: AuditEventType) -> usize {
        self.events().iter().filter(|(e, _)| *e == event).count()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, event: AuditEventType, payload: Value) {
        if let Ok(mut events) = self.events.lock() {
            events.push((event, payload));
        }
    }
}

/// Check the signature on one logged line against `public_key`.
///
/// Returns `Ok(false)` for unsigned records and for signatures that do not
/// verify.
///
/// # Errors
///
/// Returns an error if the line is not a valid record or the signature block
/// cannot be decoded.
pub fn verify_record(
    line: &str,
    public_key: &[u8],
    verifier: &dyn SignatureVerifier,
) -> Result<bool, AuditError> {
    let record: AuditRecord = serde_json::from_str(line.trim())?;
    let Some(sig) = &record.sig else {
        return Ok(false);
    };
    let signature = crypto::decode_b64_lenient(&sig.signature)
        .map_err(|e| AuditError::Malformed(format!("signature: {e}")))?;
    let message = record.signing_input()?;
    Ok(verifier.verify(public_key, &signature, message.as_bytes())?)
}
