//! Envelope definition
//!
//! `Envelope` is the signed unit a producer hands to the broker. Once signed
//! it must not change: every field except `signature` is covered by the
//! signature, so any mutation is caught by verification.
//!
//! The canonical signing payload is:
//! `DOMAIN_TAG || len(payload) || payload || len(producer_id) || producer_id
//!  || len(idempotency_key) || idempotency_key || timestamp_ns`
//! with lengths as big-endian u64 and the timestamp as big-endian i64.

use serde::{Deserialize, Serialize};

use crate::signing::{EnvelopeSigner, SignError};

/// Domain separator mixed into every signature.
pub const DOMAIN_TAG: &[u8] = b"telebus-envelope-v1";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(with = "crate::b64::bytes")]
    pub payload: Vec<u8>,
    pub producer_id: String,
    pub idempotency_key: String,
    #[serde(with = "crate::b64::bytes")]
    pub signature: Vec<u8>,
    pub timestamp_ns: i64,
}

impl Envelope {
    /// Build an envelope with an empty signature.
    pub fn unsigned(
        payload: impl Into<Vec<u8>>,
        producer_id: impl Into<String>,
        idempotency_key: impl Into<String>,
        timestamp_ns: i64,
    ) -> Self {
        Self {
            payload: payload.into(),
            producer_id: producer_id.into(),
            idempotency_key: idempotency_key.into(),
            signature: Vec::new(),
            timestamp_ns,
        }
    }

    /// Bytes covered by the signature, in fixed field order.
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(
            DOMAIN_TAG.len()
                + 3 * 8
                + self.payload.len()
                + self.producer_id.len()
                + self.idempotency_key.len()
                + 8,
        );
        buf.extend_from_slice(DOMAIN_TAG);
        put_field(&mut buf, &self.payload);
        put_field(&mut buf, self.producer_id.as_bytes());
        put_field(&mut buf, self.idempotency_key.as_bytes());
        buf.extend_from_slice(&self.timestamp_ns.to_be_bytes());
        buf
    }

    /// Sign the envelope, stamping the signer's producer identity first.
    pub fn sign_with(mut self, signer: &dyn EnvelopeSigner) -> Result<Self, SignError> {
        self.producer_id = signer.producer_id().to_string();
        self.signature = signer.sign(&self.signing_bytes())?;
        Ok(self)
    }

    pub fn is_signed(&self) -> bool {
        !self.signature.is_empty()
    }
}

fn put_field(buf: &mut Vec<u8>, field: &[u8]) {
    buf.extend_from_slice(&(field.len() as u64).to_be_bytes());
    buf.extend_from_slice(field);
}
