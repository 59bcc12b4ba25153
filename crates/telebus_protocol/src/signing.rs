//! Producer-side signing
//!
//! `EnvelopeSigner` is the seam the publish client signs through. The stock
//! implementation is Ed25519; keys are persisted as hex-encoded 32 byte seeds.

use std::path::{Path, PathBuf};

use ed25519_dalek::{Signer, SigningKey};
use rand::rngs::OsRng;

#[derive(Debug, thiserror::Error)]
pub enum SignError {
    #[error("failed to read signing key {path}: {source}")]
    KeyFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid signing key: {0}")]
    InvalidKey(String),
    #[error("signer unavailable: {0}")]
    Unavailable(String),
}

pub trait EnvelopeSigner: Send + Sync {
    /// Identity stamped into every envelope this signer produces.
    fn producer_id(&self) -> &str;

    fn sign(&self, message: &[u8]) -> Result<Vec<u8>, SignError>;
}

pub struct Ed25519Signer {
    producer_id: String,
    key: SigningKey,
}

impl Ed25519Signer {
    pub fn new(producer_id: impl Into<String>, key: SigningKey) -> Self {
        Self {
            producer_id: producer_id.into(),
            key,
        }
    }

    pub fn generate(producer_id: impl Into<String>) -> Self {
        Self::new(producer_id, SigningKey::generate(&mut OsRng))
    }

    pub fn from_seed(producer_id: impl Into<String>, seed: &[u8; 32]) -> Self {
        Self::new(producer_id, SigningKey::from_bytes(seed))
    }

    pub fn from_hex(producer_id: impl Into<String>, hex_seed: &str) -> Result<Self, SignError> {
        let raw = hex::decode(hex_seed.trim()).map_err(|e| SignError::InvalidKey(e.to_string()))?;
        let seed: [u8; 32] = raw
            .try_into()
            .map_err(|v: Vec<u8>| SignError::InvalidKey(format!("expected 32 bytes, got {}", v.len())))?;
        Ok(Self::from_seed(producer_id, &seed))
    }

    /// Load a hex seed from `path`.
    pub fn from_key_file(producer_id: impl Into<String>, path: &Path) -> Result<Self, SignError> {
        let contents = std::fs::read_to_string(path).map_err(|source| SignError::KeyFile {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_hex(producer_id, &contents)
    }

    pub fn secret_hex(&self) -> String {
        hex::encode(self.key.to_bytes())
    }

    /// Public half, hex encoded, as the broker trust store expects it.
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.key.verifying_key().to_bytes())
    }

    pub fn verifying_key(&self) -> ed25519_dalek::VerifyingKey {
        self.key.verifying_key()
    }
}

impl EnvelopeSigner for Ed25519Signer {
    fn producer_id(&self) -> &str {
        &self.producer_id
    }

    fn sign(&self, message: &[u8]) -> Result<Vec<u8>, SignError> {
        Ok(self.key.sign(message).to_bytes().to_vec())
    }
}

impl std::fmt::Debug for Ed25519Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // never print the seed
        f.debug_struct("Ed25519Signer")
            .field("producer_id", &self.producer_id)
            .field("public_key", &self.public_key_hex())
            .finish()
    }
}
