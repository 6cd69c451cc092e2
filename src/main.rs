//! Aegnix operator CLI.
//!
//! Manages the identity keyring, runs a local admission handshake, answers
//! policy questions and checks signed audit logs.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use ed25519_dalek::{Signer, SigningKey};
use rand::rngs::OsRng;
use tracing::info;

use aegnix::admission::AdmissionService;
use aegnix::audit::{self, AuditLogger, AuditSink};
use aegnix::config::AbiConfig;
use aegnix::crypto::{self, Ed25519Verifier, Fingerprinter, Sha256Fingerprinter};
use aegnix::policy::{self, PolicyFile};
use aegnix::registry::sqlite::SqliteKeyStore;
use aegnix::registry::{Enrollment, KeyRegistry, Roles, TrustStatus};

/// Aegnix: identity admission and subject policy for an agent mesh.
#[derive(Parser)]
#[command(name = "aegnix", version, about)]
struct Cli {
    /// Config file (default: `$AEGNIX_CONFIG_PATH` or `~/.aegnix/config.toml`).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Also write JSON logs to this directory (overrides `[logging] dir`).
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

/// Available CLI subcommands.
#[derive(Subcommand)]
enum Command {
    /// Generate an Ed25519 key pair for an identity.
    Keygen,
    /// Sign a base64 message (e.g. a challenge nonce) with a hex seed.
    Sign {
        /// Hex-encoded 32-byte Ed25519 seed.
        #[arg(long)]
        seed: String,
        /// Base64 message to sign.
        #[arg(long)]
        message: String,
    },
    /// Enroll or re-enroll an identity.
    Enroll {
        /// Identity id.
        #[arg(long)]
        id: String,
        /// Base64 public key.
        #[arg(long)]
        pubkey: String,
        /// Comma-separated roles.
        #[arg(long, default_value = "")]
        roles: String,
        /// Initial status.
        #[arg(long, default_value = "untrusted", value_parser = parse_status)]
        status: TrustStatus,
        /// Expiry, epoch seconds.
        #[arg(long)]
        expires_at: Option<i64>,
    },
    /// Revoke an identity.
    Revoke {
        /// Identity id.
        #[arg(long)]
        id: String,
    },
    /// Replace an identity's roles.
    SetRoles {
        /// Identity id.
        #[arg(long)]
        id: String,
        /// Comma-separated roles.
        #[arg(long)]
        roles: String,
    },
    /// Show one identity by id, fingerprint or public key.
    Show {
        /// Identity id.
        #[arg(long, conflicts_with_all = ["fingerprint", "pubkey"])]
        id: Option<String>,
        /// Public key fingerprint.
        #[arg(long, conflicts_with = "pubkey")]
        fingerprint: Option<String>,
        /// Base64 public key.
        #[arg(long)]
        pubkey: Option<String>,
    },
    /// List all identities.
    List,
    /// Run a full local handshake for an identity holding `seed`.
    Admit {
        /// Identity id.
        #[arg(long)]
        id: String,
        /// Hex-encoded 32-byte Ed25519 seed of the identity.
        #[arg(long)]
        seed: String,
    },
    /// Query the subject policy.
    Policy {
        /// Policy subcommand.
        #[command(subcommand)]
        command: PolicyCommand,
    },
    /// Audit log utilities.
    Audit {
        /// Audit subcommand.
        #[command(subcommand)]
        command: AuditCommand,
    },
}

/// Policy queries.
#[derive(Subcommand)]
enum PolicyCommand {
    /// Decide whether an identity may publish or subscribe to a subject.
    Check {
        /// Identity id.
        #[arg(long)]
        id: String,
        /// Subject name.
        #[arg(long)]
        subject: String,
        /// Direction.
        #[arg(long, value_enum)]
        action: CliAction,
    },
    /// Print the static labels of a subject.
    Labels {
        /// Subject name.
        #[arg(long)]
        subject: String,
    },
}

/// Audit utilities.
#[derive(Subcommand)]
enum AuditCommand {
    /// Check every signed line of an audit log against a public key.
    Verify {
        /// Audit log path (default: configured log).
        #[arg(long)]
        file: Option<PathBuf>,
        /// Base64 Ed25519 public key of the audit signer.
        #[arg(long)]
        pubkey: String,
    },
}

/// Policy direction on the command line.
#[derive(Clone, Copy, ValueEnum)]
enum CliAction {
    /// Publish.
    Publish,
    /// Subscribe.
    Subscribe,
}

impl From<CliAction> for policy::Action {
    fn from(action: CliAction) -> Self {
        match action {
            CliAction::Publish => Self::Publish,
            CliAction::Subscribe => Self::Subscribe,
        }
    }
}

fn parse_status(s: &str) -> Result<TrustStatus, String> {
    TrustStatus::parse(s).map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = load_config(cli.config.as_deref())?;
    if let Some(dir) = cli.log_dir {
        config.logging.dir = Some(dir);
    }
    let _logging = aegnix::logging::init(&config.logging)?;

    match cli.command {
        Command::Keygen => handle_keygen(),
        Command::Sign { seed, message } => handle_sign(&seed, &message),
        Command::Enroll {
            id,
            pubkey,
            roles,
            status,
            expires_at,
        } => handle_enroll(&config, id, pubkey, &roles, status, expires_at).await,
        Command::Revoke { id } => {
            let registry = open_registry(&config).await?;
            registry.revoke(&id).await?;
            println!("revoked {id}");
            Ok(())
        }
        Command::SetRoles { id, roles } => {
            let registry = open_registry(&config).await?;
            let record = registry.set_roles(&id, Roles::parse(&roles)).await?;
            print_json(&record)
        }
        Command::Show {
            id,
            fingerprint,
            pubkey,
        } => handle_show(&config, id, fingerprint, pubkey).await,
        Command::List => {
            let registry = open_registry(&config).await?;
            print_json(&registry.list().await?)
        }
        Command::Admit { id, seed } => handle_admit(&config, &id, &seed).await,
        Command::Policy { command } => handle_policy(&config, command),
        Command::Audit {
            command: AuditCommand::Verify { file, pubkey },
        } => handle_audit_verify(&config, file, &pubkey),
    }
}

fn load_config(path: Option<&std::path::Path>) -> Result<AbiConfig> {
    match path {
        Some(path) => {
            let mut config = AbiConfig::load_from(path)?;
            config.apply_overrides(|key| std::env::var(key).ok());
            Ok(config)
        }
        None => AbiConfig::load(),
    }
}

/// The CLI has no off-box bus, so records are only written locally.
fn build_audit(config: &AbiConfig) -> Result<Arc<AuditLogger>> {
    let logger = config
        .audit
        .open_logger(|key| std::env::var(key).ok(), None)?;
    Ok(Arc::new(logger))
}

async fn open_registry(config: &AbiConfig) -> Result<Arc<KeyRegistry>> {
    let audit: Arc<dyn AuditSink> = build_audit(config)?;
    open_registry_with(config, audit).await
}

async fn open_registry_with(
    config: &AbiConfig,
    audit: Arc<dyn AuditSink>,
) -> Result<Arc<KeyRegistry>> {
    let store = SqliteKeyStore::open(&config.storage.db_path)
        .await
        .with_context(|| {
            format!(
                "failed to open keyring {}",
                config.storage.db_path.display()
            )
        })?;
    Ok(Arc::new(KeyRegistry::new(Arc::new(store), audit)))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn signing_key_from_hex(seed: &str) -> Result<SigningKey> {
    let seed = crypto::parse_seed_hex(seed).context("invalid identity seed")?;
    Ok(SigningKey::from_bytes(&seed))
}

fn handle_keygen() -> Result<()> {
    let key = SigningKey::generate(&mut OsRng);
    let public = key.verifying_key().to_bytes();
    print_json(&serde_json::json!({
        "seed_hex": hex::encode(key.to_bytes()),
        "public_key_b64": crypto::encode_b64(&public),
        "fingerprint": Sha256Fingerprinter.fingerprint(&public),
    }))
}

fn handle_sign(seed: &str, message_b64: &str) -> Result<()> {
    let key = signing_key_from_hex(seed)?;
    let message = crypto::decode_b64_lenient(message_b64).context("message must be base64")?;
    println!("{}", crypto::encode_b64(&key.sign(&message).to_bytes()));
    Ok(())
}

async fn handle_enroll(
    config: &AbiConfig,
    id: String,
    pubkey: String,
    roles: &str,
    status: TrustStatus,
    expires_at: Option<i64>,
) -> Result<()> {
    let expires_at = match expires_at {
        Some(secs) => Some(
            chrono::DateTime::from_timestamp(secs, 0)
                .ok_or_else(|| anyhow::anyhow!("expires-at out of range: {secs}"))?,
        ),
        None => None,
    };
    let registry = open_registry(config).await?;
    let record = registry
        .enroll(
            Enrollment::new(id, pubkey)
                .roles(Roles::parse(roles))
                .status(status)
                .expires_at(expires_at),
        )
        .await?;
    print_json(&record)
}

async fn handle_show(
    config: &AbiConfig,
    id: Option<String>,
    fingerprint: Option<String>,
    pubkey: Option<String>,
) -> Result<()> {
    let registry = open_registry(config).await?;
    let record = match (id, fingerprint, pubkey) {
        (Some(id), _, _) => registry.lookup(&id).await?,
        (None, Some(fpr), _) => registry.lookup_by_fingerprint(&fpr).await?,
        (None, None, Some(pk)) => registry.lookup_by_public_key(&pk).await?,
        (None, None, None) => anyhow::bail!("one of --id, --fingerprint or --pubkey is required"),
    };
    match record {
        Some(record) => print_json(&record),
        None => anyhow::bail!("identity not found"),
    }
}

async fn handle_admit(config: &AbiConfig, id: &str, seed: &str) -> Result<()> {
    let key = signing_key_from_hex(seed)?;
    let audit: Arc<dyn AuditSink> = build_audit(config)?;
    let registry = open_registry_with(config, Arc::clone(&audit)).await?;
    let service = AdmissionService::new(
        registry,
        Arc::new(Ed25519Verifier),
        audit,
        config.admission.to_policy(),
    );

    let nonce_b64 = service.issue_challenge(id).await;
    let nonce = crypto::decode_b64_lenient(&nonce_b64).context("nonce must be base64")?;
    let signature = crypto::encode_b64(&key.sign(&nonce).to_bytes());

    let (admitted, reason) = service.verify_response(id, &signature).await?.into_parts();
    println!("{reason}");
    if !admitted {
        anyhow::bail!("admission failed for {id}: {reason}");
    }
    info!(ae_id = %id, "identity admitted");
    Ok(())
}

fn handle_policy(config: &AbiConfig, command: PolicyCommand) -> Result<()> {
    let engine = PolicyFile::load(&config.policy.path)
        .with_context(|| format!("failed to load policy {}", config.policy.path.display()))?
        .into_engine();

    match command {
        PolicyCommand::Check {
            id,
            subject,
            action,
        } => match engine.authorize(&id, &subject, action.into()) {
            Ok(()) => {
                println!("allow");
                Ok(())
            }
            Err(denied) => {
                println!("deny");
                Err(denied.into())
            }
        },
        PolicyCommand::Labels { subject } => {
            print_json(&engine.subject_labels(&subject))
        }
    }
}

fn handle_audit_verify(config: &AbiConfig, file: Option<PathBuf>, pubkey: &str) -> Result<()> {
    let path = file.unwrap_or_else(|| config.audit.log_path.clone());
    let public_key = crypto::decode_b64_lenient(pubkey).context("public key must be base64")?;
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read audit log {}", path.display()))?;

    let mut valid: usize = 0;
    let mut invalid: Vec<usize> = Vec::new();
    for (idx, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let ok = audit::verify_record(line, &public_key, &Ed25519Verifier).unwrap_or(false);
        if ok {
            valid = valid.saturating_add(1);
        } else {
            invalid.push(idx.saturating_add(1));
        }
    }

    print_json(&serde_json::json!({ "valid": valid, "invalid_lines": invalid }))?;
    if !invalid.is_empty() {
        anyhow::bail!("{} audit line(s) failed verification", invalid.len());
    }
    Ok(())
}
