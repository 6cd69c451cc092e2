//! Subject policy: who may publish or subscribe to each named subject.
//!
//! The effective policy is a one-shot merge of a static allow-list (the
//! ceiling) with the capabilities each identity declares for itself. A
//! declaration only counts when the identity already appears in the static
//! list for that subject and direction; declarations for unknown subjects or
//! outside the ceiling are recorded as rejected and otherwise ignored.
//!
//! A built [`PolicyEngine`] is immutable. When the static config or the
//! capability roster changes, build a new engine with [`PolicyEngine::rebuild`].

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

// ---------------------------------------------------------------------------
// Inputs
// ---------------------------------------------------------------------------

/// Static rule for one subject.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubjectRule {
    /// Identities allowed to publish.
    pub publishers: Vec<String>,
    /// Identities allowed to subscribe.
    pub subscribers: Vec<String>,
    /// Labels attached to the subject.
    pub labels: Vec<String>,
}

/// Static subject table, keyed by subject name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StaticPolicy(pub BTreeMap<String, SubjectRule>);

impl StaticPolicy {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the rule for `subject`.
    pub fn insert(&mut self, subject: impl Into<String>, rule: SubjectRule) {
        self.0.insert(subject.into(), rule);
    }

    /// Rule for `subject`.
    pub fn get(&self, subject: &str) -> Option<&SubjectRule> {
        self.0.get(subject)
    }
}

/// Capabilities an identity declares for itself.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeclaredCapabilities {
    /// Subjects the identity wants to publish to.
    pub publishes: Vec<String>,
    /// Subjects the identity wants to subscribe to.
    pub subscribes: Vec<String>,
}

/// Snapshot of declared capabilities, keyed by identity id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapabilityRoster(pub BTreeMap<String, DeclaredCapabilities>);

impl CapabilityRoster {
    /// Empty roster.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the declaration for `ae_id`.
    pub fn declare(&mut self, ae_id: impl Into<String>, caps: DeclaredCapabilities) {
        self.0.insert(ae_id.into(), caps);
    }
}

/// Direction of a message-path decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// Publish to a subject.
    Publish,
    /// Subscribe to a subject.
    Subscribe,
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Publish => f.write_str("publish"),
            Self::Subscribe => f.write_str("subscribe"),
        }
    }
}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// A message-path decision that came back negative.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{action} on '{subject}' denied for '{ae_id}'")]
pub struct PolicyDenied {
    /// Identity that asked.
    pub ae_id: String,
    /// Subject asked about.
    pub subject: String,
    /// Direction asked about.
    pub action: Action,
}

/// Why a declaration was not merged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectionReason {
    /// The subject is not in the static table.
    UnknownSubject,
    /// The identity is not in the static list for that subject and direction.
    OutsideCeiling,
}

/// A declaration the merge ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedDeclaration {
    /// Declaring identity.
    pub ae_id: String,
    /// Declared subject.
    pub subject: String,
    /// Declared direction.
    pub action: Action,
    /// Why it was ignored.
    pub reason: RejectionReason,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
struct EffectiveSubject {
    publishers: HashSet<String>,
    subscribers: HashSet<String>,
    labels: BTreeSet<String>,
}

/// Read-only effective authorization map.
#[derive(Debug, Clone)]
pub struct PolicyEngine {
    static_policy: Arc<StaticPolicy>,
    effective: HashMap<String, EffectiveSubject>,
    rejected: Vec<RejectedDeclaration>,
}

impl PolicyEngine {
    /// Merge `static_policy` with `roster` into an effective map.
    ///
    /// Pure and deterministic; performs no I/O.
    pub fn build(static_policy: StaticPolicy, roster: &CapabilityRoster) -> Self {
        Self::build_shared(Arc::new(static_policy), roster)
    }

    /// A new engine over the same static table and a new roster.
    pub fn rebuild(&self, roster: &CapabilityRoster) -> Self {
        Self::build_shared(Arc::clone(&self.static_policy), roster)
    }

    fn build_shared(static_policy: Arc<StaticPolicy>, roster: &CapabilityRoster) -> Self {
        let mut effective: HashMap<String, EffectiveSubject> = static_policy
            .0
            .iter()
            .map(|(subject, rule)| {
                let entry = EffectiveSubject {
                    publishers: rule.publishers.iter().cloned().collect(),
                    subscribers: rule.subscribers.iter().cloned().collect(),
                    labels: rule.labels.iter().cloned().collect(),
                };
                (subject.clone(), entry)
            })
            .collect();

        let mut rejected = Vec::new();
        for (ae_id, caps) in &roster.0 {
            let declared = caps
                .publishes
                .iter()
                .map(|s| (s, Action::Publish))
                .chain(caps.subscribes.iter().map(|s| (s, Action::Subscribe)));

            for (subject, action) in declared {
                let (Some(rule), Some(entry)) =
                    (static_policy.get(subject), effective.get_mut(subject))
                else {
                    debug!(
                        ae_id = %ae_id,
                        subject = %subject,
                        %action,
                        "declaration for unknown subject ignored"
                    );
                    rejected.push(RejectedDeclaration {
                        ae_id: ae_id.clone(),
                        subject: subject.clone(),
                        action,
                        reason: RejectionReason::UnknownSubject,
                    });
                    continue;
                };

                let (ceiling, set) = match action {
                    Action::Publish => (&rule.publishers, &mut entry.publishers),
                    Action::Subscribe => (&rule.subscribers, &mut entry.subscribers),
                };
                if ceiling.iter().any(|allowed| allowed == ae_id) {
                    set.insert(ae_id.clone());
                } else {
                    debug!(
                        ae_id = %ae_id,
                        subject = %subject,
                        %action,
                        "declaration outside static ceiling ignored"
                    );
                    rejected.push(RejectedDeclaration {
                        ae_id: ae_id.clone(),
                        subject: subject.clone(),
                        action,
                        reason: RejectionReason::OutsideCeiling,
                    });
                }
            }
        }

        if !rejected.is_empty() {
            info!(
                subjects = effective.len(),
                declarations = roster.0.len(),
                rejected = rejected.len(),
                "policy built with rejected declarations"
            );
        }

        Self {
            static_policy,
            effective,
            rejected,
        }
    }

    /// Whether `ae_id` may publish to `subject`.
    pub fn can_publish(&self, ae_id: &str, subject: &str) -> bool {
        self.effective
            .get(subject)
            .is_some_and(|s| s.publishers.contains(ae_id))
    }

    /// Whether `ae_id` may subscribe to `subject`.
    pub fn can_subscribe(&self, ae_id: &str, subject: &str) -> bool {
        self.effective
            .get(subject)
            .is_some_and(|s| s.subscribers.contains(ae_id))
    }

    /// Static labels of `subject`; empty for unknown subjects.
    pub fn subject_labels(&self, subject: &str) -> BTreeSet<String> {
        self.effective
            .get(subject)
            .map(|s| s.labels.clone())
            .unwrap_or_default()
    }

    /// Decision as a result value.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyDenied`] when the identity is not in the effective set.
    pub fn authorize(
        &self,
        ae_id: &str,
        subject: &str,
        action: Action,
    ) -> Result<(), PolicyDenied> {
        let allowed = match action {
            Action::Publish => self.can_publish(ae_id, subject),
            Action::Subscribe => self.can_subscribe(ae_id, subject),
        };
        if allowed {
            Ok(())
        } else {
            Err(PolicyDenied {
                ae_id: ae_id.to_owned(),
                subject: subject.to_owned(),
                action,
            })
        }
    }

    /// Known subject names, sorted.
    pub fn subjects(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.effective.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Declarations the last build ignored.
    pub fn rejected_declarations(&self) -> &[RejectedDeclaration] {
        &self.rejected
    }

    /// Grant directly into the effective map. Test builds only.
    #[cfg(test)]
    pub(crate) fn allow(
        &mut self,
        subject: &str,
        publisher: Option<&str>,
        subscriber: Option<&str>,
        labels: &[&str],
    ) {
        let entry = self.effective.entry(subject.to_owned()).or_default();
        if let Some(p) = publisher {
            entry.publishers.insert(p.to_owned());
        }
        if let Some(s) = subscriber {
            entry.subscribers.insert(s.to_owned());
        }
        entry.labels.extend(labels.iter().map(|l| (*l).to_owned()));
    }
}

// ---------------------------------------------------------------------------
// Policy file
// ---------------------------------------------------------------------------

/// Errors loading a policy file.
#[derive(Debug, Error)]
pub enum PolicyError {
    /// The file could not be read.
    #[error("failed to read policy file {path}: {source}")]
    Io {
        /// Offending path.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// The file is not valid policy TOML.
    #[error("failed to parse policy: {0}")]
    Parse(#[from] toml::de::Error),
}

/// On-disk policy: static subjects plus declared capabilities.
///
/// ```toml
/// [subjects."telemetry.raw"]
/// publishers = ["ae-1"]
/// subscribers = ["ae-3"]
/// labels = ["raw"]
///
/// [capabilities."ae-1"]
/// publishes = ["telemetry.raw"]
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyFile {
    /// Static subject table.
    pub subjects: StaticPolicy,
    /// Declared capabilities per identity.
    pub capabilities: CapabilityRoster,
}

impl PolicyFile {
    /// Parse policy TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is malformed.
    pub fn from_toml(toml_str: &str) -> Result<Self, PolicyError> {
        Ok(toml::from_str(toml_str)?)
    }

    /// Read and parse a policy file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self, PolicyError> {
        let contents = std::fs::read_to_string(path).map_err(|source| PolicyError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&contents)
    }

    /// Build the engine described by this file.
    pub fn into_engine(self) -> PolicyEngine {
        PolicyEngine::build(self.subjects, &self.capabilities)
    }
}
