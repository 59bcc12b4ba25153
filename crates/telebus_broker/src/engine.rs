//! Broker engine
//!
//! `Broker` runs the ingestion pipeline for one publish request:
//!
//! 1. decode (size bound first, then structure) → `Invalid`
//! 2. verify the signature against the current trust store → `Invalid`
//! 3. dedup test-and-set → `Ok` for an accepted duplicate, `Retry` while the
//!    same key is still in flight elsewhere
//! 4. overload admission → `Retry` with a hint; the dedup reservation is
//!    released so the retry is treated as new
//! 5. durable WAL append → `Ok`, or `Retry` if the append could not be
//!    committed (reservation released)
//!
//! The dedup key only becomes a committed "seen" entry after the WAL append
//! has been flushed. The append and the commit/release run together on the
//! blocking pool, so a caller that goes away mid-request cannot leave a
//! reservation dangling or tear down a write that has started.
//!
//! Concurrency: `publish` takes `&self`; every shared piece (trust store,
//! dedup cache, overload gauge, WAL writer) does its own synchronization, so
//! the broker is shared as a plain `Arc<Broker>`.

use std::sync::Arc;
use std::time::Duration;

use telebus_persistence::{EventLog, WalError};
use telebus_protocol::{
    Ack, DEFAULT_MAX_ENVELOPE_BYTES, EnvelopeCodec, HealthStatus, SharedTrustStore,
    verify_detailed,
};
use telebus_utils::{Clock, SystemClock};
use tracing::{debug, error, info, warn};

use crate::dedup::{
    DEFAULT_DEDUP_CAPACITY, DEFAULT_DEDUP_TTL, DedupCache, DedupOutcome, scoped_key,
};
use crate::metrics::{BrokerMetrics, MetricsSnapshot};
use crate::overload::{
    Admission, DEFAULT_OVERLOAD_THRESHOLD, DEFAULT_RETRY_AFTER_BASE, DEFAULT_RETRY_AFTER_MAX,
    OverloadController,
};

/// Tunables for a broker instance.
#[derive(Debug, Clone)]
pub struct BrokerOptions {
    pub max_envelope_bytes: usize,
    pub dedup_ttl: Duration,
    pub dedup_capacity: usize,
    pub overload_threshold: usize,
    pub retry_after_base: Duration,
    pub retry_after_max: Duration,
}

impl Default for BrokerOptions {
    fn default() -> Self {
        Self {
            max_envelope_bytes: DEFAULT_MAX_ENVELOPE_BYTES,
            dedup_ttl: DEFAULT_DEDUP_TTL,
            dedup_capacity: DEFAULT_DEDUP_CAPACITY,
            overload_threshold: DEFAULT_OVERLOAD_THRESHOLD,
            retry_after_base: DEFAULT_RETRY_AFTER_BASE,
            retry_after_max: DEFAULT_RETRY_AFTER_MAX,
        }
    }
}

pub struct Broker {
    codec: EnvelopeCodec,
    trust: Arc<SharedTrustStore>,
    dedup: Arc<DedupCache>,
    overload: OverloadController,
    wal: Arc<dyn EventLog>,
    clock: Arc<dyn Clock>,
    metrics: Arc<BrokerMetrics>,
    retry_after_ms: u32,
}

impl Broker {
    pub fn new(
        options: BrokerOptions,
        trust: Arc<SharedTrustStore>,
        wal: Arc<dyn EventLog>,
    ) -> Self {
        Self::with_clock(options, trust, wal, Arc::new(SystemClock))
    }

    pub fn with_clock(
        options: BrokerOptions,
        trust: Arc<SharedTrustStore>,
        wal: Arc<dyn EventLog>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let retry_after_ms =
            u32::try_from(options.retry_after_base.as_millis()).unwrap_or(u32::MAX);
        Self {
            codec: EnvelopeCodec::new(options.max_envelope_bytes),
            trust,
            dedup: Arc::new(DedupCache::new(
                options.dedup_ttl,
                options.dedup_capacity,
                clock.clone(),
            )),
            overload: OverloadController::new(
                options.overload_threshold,
                options.retry_after_base,
                options.retry_after_max,
            ),
            wal,
            clock,
            metrics: Arc::new(BrokerMetrics::default()),
            retry_after_ms,
        }
    }

    /// Run one publish request through the pipeline. Always answers.
    pub async fn publish(&self, raw: &[u8]) -> Ack {
        let envelope = match self.codec.decode(raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.metrics.record_rejected();
                warn!(bytes = raw.len(), error = %e, "publish rejected: bad envelope");
                return Ack::invalid(e.to_string());
            }
        };

        let trust = self.trust.snapshot();
        if let Err(e) = verify_detailed(&envelope, &trust) {
            self.metrics.record_rejected();
            warn!(
                producer_id = %envelope.producer_id,
                idempotency_key = %envelope.idempotency_key,
                error = %e,
                "publish rejected: signature"
            );
            return Ack::invalid(e.to_string());
        }

        let key = envelope.idempotency_key.clone();
        let dedup_key = scoped_key(&envelope.producer_id, &key);
        match self.dedup.check_and_record(&dedup_key) {
            DedupOutcome::New => {}
            DedupOutcome::Duplicate => {
                self.metrics.record_duplicate();
                debug!(idempotency_key = %key, "duplicate publish acknowledged");
                return Ack::ok().with_reason("duplicate");
            }
            DedupOutcome::InFlight => {
                self.metrics.record_in_flight_retry();
                debug!(idempotency_key = %key, "same key already in flight");
                return Ack::retry(Some(self.retry_after_ms)).with_reason("in flight");
            }
        }

        let _permit = match self.overload.admit() {
            Admission::Admit(permit) => permit,
            Admission::Shed { retry_after_ms } => {
                self.dedup.release(&dedup_key);
                self.metrics.record_shed();
                warn!(
                    idempotency_key = %key,
                    in_flight = self.overload.in_flight(),
                    retry_after_ms,
                    "publish shed: overloaded"
                );
                return Ack::retry(Some(retry_after_ms)).with_reason("overloaded");
            }
        };

        let appended_at_ns = self.clock.now_ns();
        let producer_id = envelope.producer_id.clone();
        let wal = Arc::clone(&self.wal);
        let dedup = Arc::clone(&self.dedup);
        let metrics = Arc::clone(&self.metrics);
        let append_key = dedup_key.clone();

        // Runs to completion on the blocking pool even if this future is dropped.
        let appended = tokio::task::spawn_blocking(move || {
            let result = wal.append(&envelope, appended_at_ns);
            match &result {
                Ok(_) => {
                    dedup.commit(&append_key);
                    metrics.record_accepted();
                }
                Err(_) => {
                    dedup.release(&append_key);
                    metrics.record_wal_failed();
                }
            }
            result
        })
        .await;

        let result = appended.unwrap_or_else(|join_err| {
            self.dedup.release(&dedup_key);
            self.metrics.record_wal_failed();
            Err(WalError::Aborted(join_err.to_string()))
        });

        match result {
            Ok(sequence) => {
                debug!(%producer_id, idempotency_key = %key, sequence, "publish accepted");
                Ack::ok()
            }
            Err(e) => {
                error!(%producer_id, idempotency_key = %key, error = %e, "WAL append failed");
                Ack::retry(Some(self.retry_after_ms)).with_reason("storage unavailable")
            }
        }
    }

    /// Ready when the WAL is writable and at least one producer is trusted.
    pub fn health(&self) -> HealthStatus {
        HealthStatus::from_parts(self.wal.is_writable(), !self.trust.snapshot().is_empty())
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            in_flight: self.overload.in_flight(),
            wal_len: self.wal.len(),
            dedup_entries: self.dedup.len(),
            ..self.metrics.snapshot()
        }
    }

    pub fn trust_store(&self) -> &SharedTrustStore {
        &self.trust
    }

    pub fn dedup(&self) -> &DedupCache {
        &self.dedup
    }

    pub fn overload(&self) -> &OverloadController {
        &self.overload
    }

    pub fn max_envelope_bytes(&self) -> usize {
        self.codec.max_bytes()
    }

    /// One maintenance pass: sweep expired dedup keys and report counters.
    pub fn run_maintenance(&self) -> MetricsSnapshot {
        let purged = self.dedup.purge_expired();
        let snapshot = self.metrics();
        info!(
            purged,
            accepted = snapshot.accepted,
            duplicates = snapshot.duplicates,
            rejected = snapshot.rejected,
            shed = snapshot.shed,
            wal_failed = snapshot.wal_failed,
            in_flight = snapshot.in_flight,
            wal_len = snapshot.wal_len,
            dedup_entries = snapshot.dedup_entries,
            "broker stats"
        );
        snapshot
    }

    /// Background loop calling [`Broker::run_maintenance`] every `period`.
    pub async fn start_maintenance_loop(broker: Arc<Broker>, period: Duration) {
        let mut ticker = tokio::time::interval(period);
        // first tick completes immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            broker.run_maintenance();
        }
    }
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("max_envelope_bytes", &self.codec.max_bytes())
            .field("overload_threshold", &self.overload.threshold())
            .field("metrics", &self.metrics())
            .finish()
    }
}
