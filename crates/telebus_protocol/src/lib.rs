//! telebus_protocol
//!
//! Types shared by the broker and the publishing agents:
//!
//! - `envelope`: the signed `Envelope` and its canonical signing bytes
//! - `codec`: size-bounded JSON encoding/decoding with structural validation
//! - `signing`: the `EnvelopeSigner` seam and the Ed25519 implementation
//! - `trust`: producer identity → public key mapping, hot-swappable
//! - `verify`: stateless signature verification against a trust store
//! - `ack`: `Ack` and `HealthStatus`, the only things that cross the RPC boundary

pub mod ack;
pub mod b64;
pub mod codec;
pub mod envelope;
pub mod signing;
pub mod trust;
pub mod verify;

pub use ack::{Ack, AckStatus, HealthStatus};
pub use codec::{CodecError, DEFAULT_MAX_ENVELOPE_BYTES, EnvelopeCodec};
pub use envelope::Envelope;
pub use signing::{Ed25519Signer, EnvelopeSigner, SignError};
pub use trust::{SharedTrustStore, TrustStore, TrustStoreError};
pub use verify::{VerifyError, verify, verify_detailed};

#[cfg(test)]
mod tests;
