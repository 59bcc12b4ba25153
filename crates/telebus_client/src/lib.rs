//! telebus_client
//!
//! Agent-side half of the bus. A `Publisher` signs payloads into envelopes,
//! sends them through a `BrokerTransport` and keeps anything the broker could
//! not take yet in a durable local buffer until it can.
//!
//! Modules:
//! - `publisher`: publish / drain / run, client metrics
//! - `delivery`: the per-event state machine
//! - `backoff`: exponential backoff with jitter
//! - `idempotency`: content-derived idempotency keys
//! - `transport`: the transport trait and its error classification

pub mod backoff;
pub mod delivery;
pub mod idempotency;
pub mod publisher;
pub mod transport;

pub use backoff::Backoff;
pub use delivery::{DeliveryEvent, DeliveryState, Verdict};
pub use idempotency::derive_key;
pub use publisher::{
    ClientError, ClientMetricsSnapshot, DrainReport, PublishOutcome, Publisher, PublisherOptions,
};
pub use transport::{BrokerTransport, TransportError};
