//! Signature verification
//!
//! Stateless; safe to call from any number of request handlers at once.
//! Unknown producers fail closed. Signatures are checked with
//! `verify_strict`, which rejects malleable and small-order encodings.

use ed25519_dalek::Signature;

use crate::envelope::Envelope;
use crate::trust::TrustStore;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VerifyError {
    #[error("unknown producer '{0}'")]
    UnknownProducer(String),
    #[error("signature is not a valid ed25519 encoding")]
    BadEncoding,
    #[error("signature does not match envelope contents")]
    Mismatch,
}

pub fn verify(envelope: &Envelope, trust_store: &TrustStore) -> bool {
    verify_detailed(envelope, trust_store).is_ok()
}

/// Same as [`verify`] but says why verification failed.
pub fn verify_detailed(envelope: &Envelope, trust_store: &TrustStore) -> Result<(), VerifyError> {
    let key = trust_store
        .get(&envelope.producer_id)
        .ok_or_else(|| VerifyError::UnknownProducer(envelope.producer_id.clone()))?;
    let signature =
        Signature::from_slice(&envelope.signature).map_err(|_| VerifyError::BadEncoding)?;
    key.verify_strict(&envelope.signing_bytes(), &signature)
        .map_err(|_| VerifyError::Mismatch)
}
