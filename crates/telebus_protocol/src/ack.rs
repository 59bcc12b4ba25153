//! Broker responses
//!
//! Every publish ends in exactly one `Ack`. Internal failures never cross
//! the RPC boundary; they are folded into one of the three statuses:
//! - `Ok`: durably accepted (or an idempotent duplicate of an accepted event)
//! - `Retry`: transient; resend the same envelope, honouring `retry_after_ms`
//! - `Invalid`: permanent; resending the same bytes will never succeed

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckStatus {
    Ok,
    Retry,
    Invalid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub status: AckStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl Ack {
    pub fn ok() -> Self {
        Self {
            status: AckStatus::Ok,
            retry_after_ms: None,
            reason: None,
        }
    }

    pub fn retry(retry_after_ms: Option<u32>) -> Self {
        Self {
            status: AckStatus::Retry,
            retry_after_ms,
            reason: None,
        }
    }

    pub fn invalid(reason: impl Into<String>) -> Self {
        Self {
            status: AckStatus::Invalid,
            retry_after_ms: None,
            reason: Some(reason.into()),
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn is_ok(&self) -> bool {
        self.status == AckStatus::Ok
    }

    pub fn is_retry(&self) -> bool {
        self.status == AckStatus::Retry
    }

    pub fn is_invalid(&self) -> bool {
        self.status == AckStatus::Invalid
    }
}

/// Broker readiness as reported by `Health`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub ready: bool,
    pub wal_writable: bool,
    pub trust_store_loaded: bool,
}

impl HealthStatus {
    pub fn from_parts(wal_writable: bool, trust_store_loaded: bool) -> Self {
        Self {
            ready: wal_writable && trust_store_loaded,
            wal_writable,
            trust_store_loaded,
        }
    }
}
