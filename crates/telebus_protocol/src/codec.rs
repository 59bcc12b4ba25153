//! Envelope codec
//!
//! JSON encoding with base64 byte fields. Decoding is pure: no I/O and no
//! cryptography. The size limit is enforced on the raw bytes before any
//! parsing so oversize input is rejected as cheaply as possible.

use serde::Deserialize;

use crate::envelope::Envelope;

/// Reference limit for a serialized envelope (128 KiB).
pub const DEFAULT_MAX_ENVELOPE_BYTES: usize = 128 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("envelope is {size} bytes, limit is {max}")]
    Oversize { size: usize, max: usize },
    #[error("malformed envelope: {0}")]
    Malformed(String),
}

impl CodecError {
    pub fn is_oversize(&self) -> bool {
        matches!(self, CodecError::Oversize { .. })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EnvelopeCodec {
    max_bytes: usize,
}

impl Default for EnvelopeCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ENVELOPE_BYTES)
    }
}

// Every field optional so a missing one becomes `Malformed` with a useful
// message instead of a generic serde error.
#[derive(Deserialize)]
struct WireEnvelope {
    #[serde(default, deserialize_with = "crate::b64::option_bytes::deserialize")]
    payload: Option<Vec<u8>>,
    #[serde(default)]
    producer_id: Option<String>,
    #[serde(default)]
    idempotency_key: Option<String>,
    #[serde(default, deserialize_with = "crate::b64::option_bytes::deserialize")]
    signature: Option<Vec<u8>>,
    #[serde(default)]
    timestamp_ns: Option<i64>,
}

impl EnvelopeCodec {
    pub fn new(max_bytes: usize) -> Self {
        Self { max_bytes }
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    pub fn encode(&self, envelope: &Envelope) -> Result<Vec<u8>, CodecError> {
        check_required(envelope)?;
        let bytes =
            serde_json::to_vec(envelope).map_err(|e| CodecError::Malformed(e.to_string()))?;
        self.check_size(bytes.len())?;
        Ok(bytes)
    }

    pub fn decode(&self, bytes: &[u8]) -> Result<Envelope, CodecError> {
        self.check_size(bytes.len())?;
        let wire: WireEnvelope =
            serde_json::from_slice(bytes).map_err(|e| CodecError::Malformed(e.to_string()))?;

        let envelope = Envelope {
            payload: wire.payload.unwrap_or_default(),
            producer_id: wire.producer_id.unwrap_or_default(),
            idempotency_key: wire.idempotency_key.unwrap_or_default(),
            signature: wire.signature.unwrap_or_default(),
            timestamp_ns: wire
                .timestamp_ns
                .ok_or_else(|| CodecError::Malformed("missing timestamp_ns".into()))?,
        };
        check_required(&envelope)?;
        Ok(envelope)
    }

    fn check_size(&self, size: usize) -> Result<(), CodecError> {
        if size > self.max_bytes {
            return Err(CodecError::Oversize {
                size,
                max: self.max_bytes,
            });
        }
        Ok(())
    }
}

fn check_required(envelope: &Envelope) -> Result<(), CodecError> {
    if envelope.producer_id.is_empty() {
        return Err(CodecError::Malformed("missing producer_id".into()));
    }
    if envelope.idempotency_key.is_empty() {
        return Err(CodecError::Malformed("missing idempotency_key".into()));
    }
    if envelope.signature.is_empty() {
        return Err(CodecError::Malformed("missing signature".into()));
    }
    Ok(())
}
