// Broker counters. These are the minimum signals an operator needs to tell
// rejections from sustained backpressure.
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Default)]
pub struct BrokerMetrics {
    accepted: AtomicU64,
    duplicates: AtomicU64,
    rejected: AtomicU64,
    shed: AtomicU64,
    wal_failed: AtomicU64,
    in_flight_retries: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct MetricsSnapshot {
    pub accepted: u64,
    pub duplicates: u64,
    pub rejected: u64,
    pub shed: u64,
    pub wal_failed: u64,
    pub in_flight_retries: u64,
    pub in_flight: usize,
    pub wal_len: usize,
    pub dedup_entries: usize,
}

impl BrokerMetrics {
    pub(crate) fn record_accepted(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_duplicate(&self) {
        self.duplicates.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_shed(&self) {
        self.shed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_wal_failed(&self) {
        self.wal_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_in_flight_retry(&self) {
        self.in_flight_retries.fetch_add(1, Ordering::Relaxed);
    }

    /// Counter values; gauges are filled in by the broker.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            shed: self.shed.load(Ordering::Relaxed),
            wal_failed: self.wal_failed.load(Ordering::Relaxed),
            in_flight_retries: self.in_flight_retries.load(Ordering::Relaxed),
            ..MetricsSnapshot::default()
        }
    }
}
