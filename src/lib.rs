//! Aegnix: identity admission and subject authorization for an agent mesh.
//!
//! Three pieces carry the logic:
//! - [`registry`]: identity records, trust status transitions, key lookup
//! - [`admission`]: nonce challenge/response proving key possession
//! - [`policy`]: per-subject publish/subscribe decisions under a static ceiling
//!
//! Crypto primitives, storage and the audit sink are capabilities behind
//! traits ([`crypto`], [`registry::KeyStore`], [`audit::AuditSink`]).

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod crypto;
pub mod logging;

pub mod audit;
pub mod registry;

pub mod admission;
pub mod policy;
