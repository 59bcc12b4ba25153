//! Agent-side publisher
//!
//! `Publisher` turns payloads into signed envelopes and gets them into the
//! broker:
//!
//! - one immediate send attempt per `publish`
//! - `OK` → done; `INVALID` or a permanent transport error → rejected,
//!   surfaced to the caller and never retried
//! - `RETRY` or a transient transport error → the envelope is durably parked
//!   in the [`LocalBuffer`] with its own backoff deadline before `publish`
//!   returns
//! - `drain_due` (driven by `run`) resends parked envelopes oldest-first,
//!   each one only once its own deadline has passed
//!
//! Resends reuse the stored, already-signed envelope, so the idempotency key
//! never changes across retries or agent restarts.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::Serialize;
use telebus_persistence::{BufferEntry, BufferError, LocalBuffer};
use telebus_protocol::{Ack, CodecError, Envelope, EnvelopeCodec, EnvelopeSigner, SignError};
use telebus_utils::clock::duration_to_ns;
use telebus_utils::{Clock, SystemClock};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::backoff::Backoff;
use crate::delivery::{DeliveryEvent, DeliveryState, Verdict};
use crate::idempotency::derive_key;
use crate::transport::{BrokerTransport, TransportError};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("cannot sign envelope: {0}")]
    Sign(#[from] SignError),
    #[error("cannot encode envelope: {0}")]
    Encode(#[from] CodecError),
    #[error("local buffer failure: {0}")]
    Buffer(#[from] BufferError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    Acked,
    /// Parked in the local buffer; `drain_due` will resend it.
    Buffered {
        buffer_id: u64,
        next_retry_at_ns: i64,
    },
    Rejected {
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub acked: usize,
    pub rejected: usize,
    pub rescheduled: usize,
    pub not_due: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ClientMetricsSnapshot {
    pub buffer_depth: usize,
    pub oldest_buffered_age_ms: Option<u64>,
    pub acked: u64,
    pub rejected: u64,
    pub retries: u64,
}

#[derive(Debug, Default)]
struct ClientMetrics {
    acked: AtomicU64,
    rejected: AtomicU64,
    retries: AtomicU64,
}

#[derive(Debug, Clone, Copy)]
pub struct PublisherOptions {
    pub request_timeout: Duration,
    pub backoff: Backoff,
    pub max_envelope_bytes: usize,
}

impl Default for PublisherOptions {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            backoff: Backoff::default(),
            max_envelope_bytes: telebus_protocol::DEFAULT_MAX_ENVELOPE_BYTES,
        }
    }
}

pub struct Publisher {
    transport: Arc<dyn BrokerTransport>,
    signer: Arc<dyn EnvelopeSigner>,
    buffer: LocalBuffer,
    codec: EnvelopeCodec,
    backoff: Backoff,
    request_timeout: Duration,
    clock: Arc<dyn Clock>,
    rng: Mutex<StdRng>,
    metrics: ClientMetrics,
}

impl Publisher {
    pub fn new(
        transport: Arc<dyn BrokerTransport>,
        signer: Arc<dyn EnvelopeSigner>,
        buffer: LocalBuffer,
        options: PublisherOptions,
    ) -> Self {
        Self {
            transport,
            signer,
            buffer,
            codec: EnvelopeCodec::new(options.max_envelope_bytes),
            backoff: options.backoff,
            request_timeout: options.request_timeout,
            clock: Arc::new(SystemClock),
            rng: Mutex::new(StdRng::from_entropy()),
            metrics: ClientMetrics::default(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Deterministic jitter, for tests and reproducible runs.
    pub fn with_rng_seed(mut self, seed: u64) -> Self {
        self.rng = Mutex::new(StdRng::seed_from_u64(seed));
        self
    }

    /// Publish a payload under a key derived from its content.
    pub async fn publish(&self, payload: impl Into<Vec<u8>>) -> Result<PublishOutcome, ClientError> {
        let payload = payload.into();
        let timestamp_ns = self.clock.now_ns();
        let key = derive_key(self.signer.producer_id(), timestamp_ns, &payload);
        self.publish_envelope(Envelope::unsigned(payload, "", key, timestamp_ns))
            .await
    }

    /// Publish under a caller-chosen idempotency key.
    pub async fn publish_with_key(
        &self,
        payload: impl Into<Vec<u8>>,
        idempotency_key: impl Into<String>,
    ) -> Result<PublishOutcome, ClientError> {
        let envelope = Envelope::unsigned(payload, "", idempotency_key, self.clock.now_ns());
        self.publish_envelope(envelope).await
    }

    async fn publish_envelope(&self, unsigned: Envelope) -> Result<PublishOutcome, ClientError> {
        // Signing or encoding failures never reach the broker.
        let envelope = unsigned.sign_with(self.signer.as_ref())?;
        let bytes = self.codec.encode(&envelope)?;

        let state = self.attempt(bytes, &envelope, 1).await;
        match state {
            DeliveryState::Acked => Ok(PublishOutcome::Acked),
            DeliveryState::Rejected { reason } => Ok(PublishOutcome::Rejected { reason }),
            unsettled => {
                let now = self.clock.now_ns();
                let next_retry_at_ns = match unsettled {
                    DeliveryState::Backoff { next_retry_at_ns } => next_retry_at_ns,
                    _ => now,
                };
                let buffer_id = self.buffer.push(&BufferEntry {
                    envelope,
                    attempt_count: 1,
                    next_retry_at_ns,
                    buffered_at_ns: now,
                })?;
                info!(buffer_id, next_retry_at_ns, "envelope buffered for retry");
                Ok(PublishOutcome::Buffered {
                    buffer_id,
                    next_retry_at_ns,
                })
            }
        }
    }

    /// Resend every buffered envelope whose backoff has elapsed, oldest first.
    pub async fn drain_due(&self) -> Result<DrainReport, ClientError> {
        let mut report = DrainReport::default();
        for (id, entry) in self.buffer.entries()? {
            if entry.next_retry_at_ns > self.clock.now_ns() {
                report.not_due += 1;
                continue;
            }

            // Permanent for this entry only; the rest of the buffer still drains.
            let bytes = match self.codec.encode(&entry.envelope) {
                Ok(bytes) => bytes,
                Err(e) => {
                    self.metrics.rejected.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        buffer_id = id,
                        idempotency_key = %entry.envelope.idempotency_key,
                        error = %e,
                        "buffered envelope can no longer be encoded, dropping it"
                    );
                    self.buffer.remove(id)?;
                    report.rejected += 1;
                    continue;
                }
            };
            let attempt = entry.attempt_count.saturating_add(1);
            self.metrics.retries.fetch_add(1, Ordering::Relaxed);
            match self.attempt(bytes, &entry.envelope, attempt).await {
                DeliveryState::Acked => {
                    self.buffer.remove(id)?;
                    report.acked += 1;
                }
                DeliveryState::Rejected { .. } => {
                    self.buffer.remove(id)?;
                    report.rejected += 1;
                }
                DeliveryState::Backoff { next_retry_at_ns } => {
                    self.buffer.update(
                        id,
                        &BufferEntry {
                            attempt_count: attempt,
                            next_retry_at_ns,
                            ..entry
                        },
                    )?;
                    report.rescheduled += 1;
                }
                DeliveryState::Pending | DeliveryState::Sending => {}
            }
        }
        if report != DrainReport::default() {
            debug!(?report, remaining = self.buffer.len(), "buffer drain pass");
        }
        Ok(report)
    }

    /// Drain the buffer every `interval` until `shutdown` flips to true.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(pending = self.buffer.len(), "publisher drain loop started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.drain_due().await {
                        error!(error = %e, "buffer drain failed");
                    }
                }
            }
        }
        info!(pending = self.buffer.len(), "publisher drain loop stopped");
    }

    pub fn metrics(&self) -> Result<ClientMetricsSnapshot, ClientError> {
        let now = self.clock.now_ns();
        let oldest_buffered_age_ms = self.buffer.oldest()?.map(|entry| {
            let age_ns = now.saturating_sub(entry.buffered_at_ns).max(0);
            (age_ns / 1_000_000) as u64
        });
        Ok(ClientMetricsSnapshot {
            buffer_depth: self.buffer.len(),
            oldest_buffered_age_ms,
            acked: self.metrics.acked.load(Ordering::Relaxed),
            rejected: self.metrics.rejected.load(Ordering::Relaxed),
            retries: self.metrics.retries.load(Ordering::Relaxed),
        })
    }

    pub fn buffer(&self) -> &LocalBuffer {
        &self.buffer
    }

    /// One send, driven through the state machine to a settled state.
    async fn attempt(&self, bytes: Vec<u8>, envelope: &Envelope, attempt: u32) -> DeliveryState {
        let state = DeliveryState::Pending.next(DeliveryEvent::Dispatch);
        let response = self.send(bytes).await;

        let event = match Verdict::from_response(&response) {
            Verdict::Acked => {
                self.metrics.acked.fetch_add(1, Ordering::Relaxed);
                debug!(idempotency_key = %envelope.idempotency_key, attempt, "publish acked");
                DeliveryEvent::Acked
            }
            Verdict::Rejected { reason } => {
                self.metrics.rejected.fetch_add(1, Ordering::Relaxed);
                warn!(
                    idempotency_key = %envelope.idempotency_key,
                    attempt,
                    %reason,
                    "publish rejected"
                );
                DeliveryEvent::Rejected { reason }
            }
            Verdict::Retry { retry_after } => {
                let delay = self.next_delay(attempt, retry_after);
                let next_retry_at_ns = self.clock.now_ns().saturating_add(duration_to_ns(delay));
                match &response {
                    Err(e) => warn!(
                        idempotency_key = %envelope.idempotency_key,
                        attempt,
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "broker unreachable, backing off"
                    ),
                    Ok(_) => debug!(
                        idempotency_key = %envelope.idempotency_key,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "broker asked to retry"
                    ),
                }
                DeliveryEvent::Retry { next_retry_at_ns }
            }
        };
        state.next(event)
    }

    async fn send(&self, bytes: Vec<u8>) -> Result<Ack, TransportError> {
        match tokio::time::timeout(self.request_timeout, self.transport.publish(bytes)).await {
            Ok(response) => response,
            Err(_) => Err(TransportError::Transient(format!(
                "no response within {} ms",
                self.request_timeout.as_millis()
            ))),
        }
    }

    fn next_delay(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
        self.backoff.delay_with(attempt, retry_after, &mut *rng)
    }
}

impl std::fmt::Debug for Publisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publisher")
            .field("producer_id", &self.signer.producer_id())
            .field("buffer", &self.buffer)
            .field("backoff", &self.backoff)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}
