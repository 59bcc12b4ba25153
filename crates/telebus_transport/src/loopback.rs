//! In-process transport
//!
//! Calls an `Arc<Broker>` directly, with a switch to simulate the broker
//! being unreachable. Used for embedding a broker and agent in one process
//! and for end-to-end tests without sockets.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use telebus_broker::Broker;
use telebus_client::{BrokerTransport, TransportError};
use telebus_protocol::{Ack, HealthStatus};

#[derive(Debug)]
pub struct LoopbackTransport {
    broker: Arc<Broker>,
    reachable: AtomicBool,
}

impl LoopbackTransport {
    pub fn new(broker: Arc<Broker>) -> Self {
        Self {
            broker,
            reachable: AtomicBool::new(true),
        }
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), TransportError> {
        if self.is_reachable() {
            Ok(())
        } else {
            Err(TransportError::Transient("broker unreachable".to_string()))
        }
    }
}

#[async_trait]
impl BrokerTransport for LoopbackTransport {
    async fn publish(&self, envelope: Vec<u8>) -> Result<Ack, TransportError> {
        self.check()?;
        Ok(self.broker.publish(&envelope).await)
    }

    async fn health(&self) -> Result<HealthStatus, TransportError> {
        self.check()?;
        Ok(self.broker.health())
    }
}
