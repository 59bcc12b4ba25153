//! Transport seam between the publisher and a broker.
//!
//! Implementations: the WebSocket client and the in-process loopback in
//! `telebus_transport`, plus scripted fakes in tests.

use async_trait::async_trait;
use telebus_protocol::{Ack, HealthStatus};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Connection refused, I/O failure, timeout: worth retrying.
    #[error("transient transport error: {0}")]
    Transient(String),
    /// Authentication failure or protocol violation: retrying cannot help.
    #[error("permanent transport error: {0}")]
    Permanent(String),
}

impl TransportError {
    pub fn is_transient(&self) -> bool {
        matches!(self, TransportError::Transient(_))
    }
}

#[async_trait]
pub trait BrokerTransport: Send + Sync {
    /// Send one encoded envelope and wait for the broker's verdict.
    async fn publish(&self, envelope: Vec<u8>) -> Result<Ack, TransportError>;

    async fn health(&self) -> Result<HealthStatus, TransportError>;
}
