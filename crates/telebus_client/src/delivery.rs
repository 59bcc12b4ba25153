//! Per-event delivery state machine
//!
//! ```text
//! Pending ─dispatch─▶ Sending ─ack ok──────▶ Acked
//!                       │  ▲  ─invalid/perm─▶ Rejected
//!                retry  │  │ dispatch
//!                       ▼  │
//!                      Backoff
//! ```
//!
//! Transitions are pure; the publisher feeds in what happened on the wire
//! (as a [`Verdict`]) and the retry time it computed. `Acked` and `Rejected`
//! are terminal and absorb every further event.

use std::time::Duration;

use telebus_protocol::{Ack, AckStatus};

use crate::transport::TransportError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryState {
    Pending,
    Sending,
    Acked,
    Backoff { next_retry_at_ns: i64 },
    Rejected { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryEvent {
    Dispatch,
    Acked,
    Retry { next_retry_at_ns: i64 },
    Rejected { reason: String },
}

/// What a single send attempt amounted to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Acked,
    Retry { retry_after: Option<Duration> },
    Rejected { reason: String },
}

impl Verdict {
    pub fn from_response(response: &Result<Ack, TransportError>) -> Self {
        match response {
            Ok(ack) => match ack.status {
                AckStatus::Ok => Verdict::Acked,
                AckStatus::Retry => Verdict::Retry {
                    retry_after: ack
                        .retry_after_ms
                        .map(|ms| Duration::from_millis(u64::from(ms))),
                },
                AckStatus::Invalid => Verdict::Rejected {
                    reason: ack
                        .reason
                        .clone()
                        .unwrap_or_else(|| "rejected by broker".to_string()),
                },
            },
            Err(TransportError::Transient(_)) => Verdict::Retry { retry_after: None },
            Err(TransportError::Permanent(reason)) => Verdict::Rejected {
                reason: reason.clone(),
            },
        }
    }
}

impl DeliveryState {
    pub fn next(self, event: DeliveryEvent) -> DeliveryState {
        use DeliveryState as S;
        match (self, event) {
            (S::Pending | S::Backoff { .. }, DeliveryEvent::Dispatch) => S::Sending,
            (S::Sending, DeliveryEvent::Acked) => S::Acked,
            (S::Sending, DeliveryEvent::Retry { next_retry_at_ns }) => {
                S::Backoff { next_retry_at_ns }
            }
            (S::Sending, DeliveryEvent::Rejected { reason }) => S::Rejected { reason },
            (state, _) => state,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, DeliveryState::Acked | DeliveryState::Rejected { .. })
    }
}
