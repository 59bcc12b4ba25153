//! Idempotency key derivation.
//!
//! The key is a hex SHA-256 over the producer id, the event timestamp and the
//! payload, each length-prefixed, so the same logical event always maps to
//! the same key and retries stay deduplicable.

use sha2::{Digest, Sha256};

const KEY_TAG: &[u8] = b"telebus-idempotency-v1";

pub fn derive_key(producer_id: &str, timestamp_ns: i64, payload: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(KEY_TAG);
    hasher.update((producer_id.len() as u64).to_be_bytes());
    hasher.update(producer_id.as_bytes());
    hasher.update(timestamp_ns.to_be_bytes());
    hasher.update((payload.len() as u64).to_be_bytes());
    hasher.update(payload);
    hex::encode(hasher.finalize())
}
