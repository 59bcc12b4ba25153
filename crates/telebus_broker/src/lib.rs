//! telebus_broker
//!
//! The ingestion side of the bus: everything between "bytes arrived" and
//! "envelope is durably in the WAL".
//!
//! Public types:
//! - `Broker`: the publish pipeline plus health and metrics
//! - `DedupCache`: bounded, TTL-expiring idempotency-key cache
//! - `OverloadController`: lock-free admission control
//!
//! Every piece of shared state is owned by a `Broker` instance and injected
//! at construction, so tests can build as many isolated brokers as they like.
//! Transports (the WebSocket server, the in-process loopback) sit on top.

pub mod dedup;
pub mod engine;
pub mod metrics;
pub mod overload;

pub use dedup::{DedupCache, DedupOutcome};
pub use engine::{Broker, BrokerOptions};
pub use metrics::{BrokerMetrics, MetricsSnapshot};
pub use overload::{Admission, AdmissionPermit, OverloadController};
