//! Configuration loading.
//!
//! Loads `config.toml` from `$AEGNIX_CONFIG_PATH` or `~/.aegnix/config.toml`.
//! Precedence: env vars > config file > defaults. A missing file yields
//! defaults.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::admission::{AdmissionPolicy, DEFAULT_CHALLENGE_TTL_SECS};
use crate::audit::transport::AuditTransport;
use crate::audit::{AuditLogger, DEFAULT_PRODUCER, DEFAULT_TOPIC};
use crate::crypto::AuditSigner;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AbiConfig {
    /// Identity store settings.
    pub storage: StorageConfig,
    /// Challenge lifecycle settings.
    pub admission: AdmissionConfig,
    /// Audit log settings.
    pub audit: AuditConfig,
    /// Policy file settings.
    pub policy: PolicyConfig,
    /// Log output settings.
    pub logging: LoggingConfig,
}

/// Identity store settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite keyring path.
    pub db_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("abi_state.db"),
        }
    }
}

/// Challenge lifecycle settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Challenge lifetime in seconds; 0 disables expiry.
    pub challenge_ttl_secs: u64,
    /// Whether a failed signature consumes the pending challenge.
    pub consume_on_failure: bool,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            challenge_ttl_secs: DEFAULT_CHALLENGE_TTL_SECS.unsigned_abs(),
            consume_on_failure: false,
        }
    }
}

impl AdmissionConfig {
    /// Runtime policy for the admission service.
    pub fn to_policy(&self) -> AdmissionPolicy {
        let ttl = i64::try_from(self.challenge_ttl_secs).unwrap_or(i64::MAX);
        AdmissionPolicy {
            challenge_ttl: if ttl == 0 {
                None
            } else {
                chrono::Duration::try_seconds(ttl)
            },
            consume_on_failure: self.consume_on_failure,
        }
    }
}

/// Audit log settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Append-only JSONL path.
    pub log_path: PathBuf,
    /// Producer name stamped on records.
    pub producer: String,
    /// Key identifier written into signature blocks.
    pub key_id: String,
    /// Name of the env var holding a hex Ed25519 seed. Unset: unsigned records.
    pub signing_key_env: Option<String>,
    /// Topic records are published to when a transport is attached.
    pub topic: String,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            log_path: PathBuf::from("abi_audit.log"),
            producer: DEFAULT_PRODUCER.to_owned(),
            key_id: "abi-ed25519-1".to_owned(),
            signing_key_env: None,
            topic: DEFAULT_TOPIC.to_owned(),
        }
    }
}

impl AuditConfig {
    /// Open the configured audit log.
    ///
    /// The signing seed is read through `env` from the variable named by
    /// `signing_key_env`. When `transport` is given, records are also
    /// published to `topic`.
    ///
    /// # Errors
    ///
    /// Returns an error if the log cannot be opened, or the signing key
    /// variable is unset or not a valid seed.
    pub fn open_logger(
        &self,
        env: impl Fn(&str) -> Option<String>,
        transport: Option<Arc<dyn AuditTransport>>,
    ) -> Result<AuditLogger> {
        let mut logger = AuditLogger::new(&self.log_path, self.producer.clone())
            .with_context(|| format!("failed to open audit log {}", self.log_path.display()))?;
        if let Some(var) = &self.signing_key_env {
            let seed = env(var)
                .ok_or_else(|| anyhow::anyhow!("audit signing key env var {var} is not set"))?;
            let signer = AuditSigner::from_hex(self.key_id.clone(), &seed)
                .context("invalid audit signing key")?;
            tracing::debug!(key_id = %signer.key_id(), "audit records will be signed");
            logger = logger.with_signer(signer);
        }
        if let Some(transport) = transport {
            tracing::debug!(topic = %self.topic, "audit records will be published");
            logger = logger.with_transport(transport, self.topic.clone());
        }
        Ok(logger)
    }
}

/// Policy file settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Path to the policy TOML.
    pub path: PathBuf,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("policy.toml"),
        }
    }
}

/// Log output settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default `EnvFilter` directive when `RUST_LOG` is unset.
    pub level: String,
    /// Directory for daily-rotated JSON logs. Unset: stderr only.
    pub dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            dir: None,
        }
    }
}

impl AbiConfig {
    /// Load configuration with env overrides applied.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load() -> Result<Self> {
        let env = |key: &str| std::env::var(key).ok();
        let path = config_path_with(env)?;
        let mut config = Self::load_from(&path)?;
        config.apply_overrides(env);
        Ok(config)
    }

    /// Load from a specific file, without env overrides. Missing file: defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_from(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(contents) => {
                tracing::debug!(path = %path.display(), "loading config from file");
                Self::from_toml(&contents)
                    .with_context(|| format!("failed to parse config at {}", path.display()))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(anyhow::anyhow!(
                "failed to read config at {}: {e}",
                path.display()
            )),
        }
    }

    /// Parse a TOML string into config.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is malformed.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str).context("failed to parse config TOML")
    }

    /// Apply environment overrides using `env` as the resolver.
    pub fn apply_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        if let Some(v) = env("AEGNIX_DB_PATH") {
            self.storage.db_path = PathBuf::from(v);
        }
        if let Some(v) = env("AEGNIX_CHALLENGE_TTL_SECS") {
            match v.parse() {
                Ok(n) => self.admission.challenge_ttl_secs = n,
                Err(_) => tracing::warn!(
                    var = "AEGNIX_CHALLENGE_TTL_SECS",
                    value = %v,
                    "ignoring invalid env override"
                ),
            }
        }
        if let Some(v) = env("AEGNIX_AUDIT_LOG") {
            self.audit.log_path = PathBuf::from(v);
        }
        if let Some(v) = env("AEGNIX_POLICY_PATH") {
            self.policy.path = PathBuf::from(v);
        }
        if let Some(v) = env("AEGNIX_LOG_DIR") {
            self.logging.dir = Some(PathBuf::from(v));
        }
    }
}

/// Resolve the default config directory (`~/.aegnix/`).
///
/// # Errors
///
/// Returns an error if the home directory cannot be determined.
pub fn config_dir() -> Result<PathBuf> {
    let home = directories::BaseDirs::new()
        .ok_or_else(|| anyhow::anyhow!("cannot determine home directory"))?;
    Ok(home.home_dir().join(".aegnix"))
}

/// Resolve the config file path using `env` as the resolver.
///
/// # Errors
///
/// Returns an error if no override is set and the home directory is unknown.
pub fn config_path_with(env: impl Fn(&str) -> Option<String>) -> Result<PathBuf> {
    if let Some(p) = env("AEGNIX_CONFIG_PATH") {
        return Ok(PathBuf::from(p));
    }
    Ok(config_dir()?.join("config.toml"))
}
