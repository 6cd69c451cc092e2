//! Cryptographic capabilities consumed by the registry, admission and audit paths.
//!
//! The core never calls a signature scheme directly. It goes through two narrow
//! traits: [`SignatureVerifier`] for `verify(pubkey, signature, message)` and
//! [`Fingerprinter`] for `fingerprint(pubkey)`. The defaults are Ed25519 and
//! SHA-256, but any scheme can be substituted.

use base64::Engine;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Length of an Ed25519 public key in bytes.
pub const ED25519_PUBLIC_KEY_LEN: usize = 32;

/// Length of an Ed25519 signature in bytes.
pub const ED25519_SIGNATURE_LEN: usize = 64;

/// Errors raised by a crypto primitive (as opposed to a clean "does not verify").
#[derive(Debug, Error)]
pub enum CryptoError {
    /// The public key bytes are not a valid key for the scheme.
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),
    /// The signature bytes are malformed for the scheme.
    #[error("malformed signature: {0}")]
    MalformedSignature(String),
    /// The signing seed could not be parsed.
    #[error("invalid signing seed: {0}")]
    InvalidSeed(String),
}

/// Signature verification capability.
///
/// `Ok(false)` means the signature is well-formed but does not verify.
/// `Err` means the primitive itself could not run over the inputs.
pub trait SignatureVerifier: Send + Sync {
    /// Verify `signature` over `message` with `public_key`.
    fn verify(
        &self,
        public_key: &[u8],
        signature: &[u8],
        message: &[u8],
    ) -> Result<bool, CryptoError>;
}

/// Public key fingerprinting capability. Must be a pure function of its input.
pub trait Fingerprinter: Send + Sync {
    /// Compute the fingerprint of raw public key bytes.
    fn fingerprint(&self, public_key: &[u8]) -> String;
}

/// Ed25519 verifier backed by `ed25519-dalek`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ed25519Verifier;

impl SignatureVerifier for Ed25519Verifier {
    fn verify(
        &self,
        public_key: &[u8],
        signature: &[u8],
        message: &[u8],
    ) -> Result<bool, CryptoError> {
        let key_bytes: [u8; ED25519_PUBLIC_KEY_LEN] = public_key.try_into().map_err(|_| {
            CryptoError::InvalidPublicKey(format!(
                "expected {ED25519_PUBLIC_KEY_LEN} bytes, got {}",
                public_key.len()
            ))
        })?;
        let key = VerifyingKey::from_bytes(&key_bytes)
            .map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))?;

        let sig_bytes: [u8; ED25519_SIGNATURE_LEN] = signature.try_into().map_err(|_| {
            CryptoError::MalformedSignature(format!(
                "expected {ED25519_SIGNATURE_LEN} bytes, got {}",
                signature.len()
            ))
        })?;
        let sig = Signature::from_bytes(&sig_bytes);

        Ok(key.verify(message, &sig).is_ok())
    }
}

/// SHA-256 fingerprint, lowercase hex.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sha256Fingerprinter;

impl Fingerprinter for Sha256Fingerprinter {
    fn fingerprint(&self, public_key: &[u8]) -> String {
        hex::encode(Sha256::digest(public_key))
    }
}

/// Ed25519 key used to sign audit records.
///
/// `Debug` never prints the seed.
#[derive(Clone)]
pub struct AuditSigner {
    key_id: String,
    signing_key: SigningKey,
}

impl AuditSigner {
    /// Build a signer from a 32-byte seed.
    pub fn from_seed(key_id: impl Into<String>, seed: &[u8; 32]) -> Self {
        Self {
            key_id: key_id.into(),
            signing_key: SigningKey::from_bytes(seed),
        }
    }

    /// Build a signer from a hex-encoded seed (optionally `0x`-prefixed).
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidSeed`] if the value is not 32 bytes of hex.
    pub fn from_hex(key_id: impl Into<String>, hex_seed: &str) -> Result<Self, CryptoError> {
        Ok(Self::from_seed(key_id, &parse_seed_hex(hex_seed)?))
    }

    /// Key identifier written into signature blocks.
    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    /// Raw public key bytes.
    pub fn public_key(&self) -> [u8; ED25519_PUBLIC_KEY_LEN] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Sign a message, returning raw signature bytes.
    pub fn sign(&self, message: &[u8]) -> [u8; ED25519_SIGNATURE_LEN] {
        self.signing_key.sign(message).to_bytes()
    }
}

impl std::fmt::Debug for AuditSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditSigner")
            .field("key_id", &self.key_id)
            .field("signing_key", &"__REDACTED__")
            .finish()
    }
}

/// Length of an Ed25519 signing seed in bytes.
pub const ED25519_SEED_LEN: usize = 32;

/// Parse a hex-encoded Ed25519 seed, optionally `0x`-prefixed.
///
/// # Errors
///
/// Returns [`CryptoError::InvalidSeed`] if the value is not 32 bytes of hex.
pub fn parse_seed_hex(hex_seed: &str) -> Result<[u8; ED25519_SEED_LEN], CryptoError> {
    let trimmed = hex_seed.trim();
    let trimmed = trimmed.strip_prefix("0x").unwrap_or(trimmed);
    let bytes = hex::decode(trimmed).map_err(|e| CryptoError::InvalidSeed(e.to_string()))?;
    bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidSeed(format!("seed must be {ED25519_SEED_LEN} bytes")))
}

/// Standard-alphabet base64 encoding with padding.
pub fn encode_b64(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

/// Decode standard-alphabet base64, tolerating missing `=` padding.
///
/// Surrounding whitespace is ignored. The input is padded to a multiple of
/// four before decoding.
///
/// # Errors
///
/// Returns the underlying decode error for malformed input.
pub fn decode_b64_lenient(input: &str) -> Result<Vec<u8>, base64::DecodeError> {
    let trimmed = input.trim();
    let missing = match trimmed.len() % 4 {
        0 => 0,
        rem => 4usize.saturating_sub(rem),
    };
    let mut padded = String::with_capacity(trimmed.len().saturating_add(missing));
    padded.push_str(trimmed);
    padded.extend(std::iter::repeat('=').take(missing));
    base64::engine::general_purpose::STANDARD.decode(padded)
}
