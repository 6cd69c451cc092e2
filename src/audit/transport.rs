//! Narrow transport capability for shipping audit records off-box.
//!
//! Any message bus can sit behind [`AuditTransport`]. The crate only ships an
//! in-process [`ChannelTransport`] used for fan-out inside a single service
//! and in tests.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

/// Transport failure. Reported by the audit logger, never propagated.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The receiving side has gone away.
    #[error("transport closed")]
    Closed,
    /// Backend-specific failure.
    #[error("transport backend error: {0}")]
    Backend(String),
}

/// Publish raw bytes to a named topic.
#[async_trait]
pub trait AuditTransport: Send + Sync {
    /// Publish `data` to `topic`.
    async fn publish(&self, topic: &str, data: &[u8]) -> Result<(), TransportError>;
}

/// A message delivered through a [`ChannelTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    /// Topic the message was published to.
    pub topic: String,
    /// Message body.
    pub data: Vec<u8>,
}

/// In-process transport backed by an unbounded tokio channel.
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    tx: mpsc::UnboundedSender<PublishedMessage>,
}

impl ChannelTransport {
    /// Create a transport and the receiver that observes everything published.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<PublishedMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl AuditTransport for ChannelTransport {
    async fn publish(&self, topic: &str, data: &[u8]) -> Result<(), TransportError> {
        self.tx
            .send(PublishedMessage {
                topic: topic.to_owned(),
                data: data.to_vec(),
            })
            .map_err(|_| TransportError::Closed)
    }
}
