//! Trust store
//!
//! Maps producer identity to its Ed25519 public key. Loaded once at broker
//! startup; `SharedTrustStore` lets an operator swap in a rotated set of keys
//! without restarting the broker. Readers always verify against a single
//! consistent snapshot.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use ed25519_dalek::VerifyingKey;

#[derive(Debug, thiserror::Error)]
pub enum TrustStoreError {
    #[error("invalid public key for producer '{producer_id}': {reason}")]
    InvalidKey { producer_id: String, reason: String },
}

#[derive(Debug, Clone, Default)]
pub struct TrustStore {
    keys: HashMap<String, VerifyingKey>,
}

impl TrustStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from `(producer_id, hex public key)` pairs.
    pub fn from_hex_entries<I, K, V>(entries: I) -> Result<Self, TrustStoreError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: AsRef<str>,
    {
        let mut store = Self::new();
        for (producer_id, key_hex) in entries {
            store.insert_hex(producer_id, key_hex.as_ref())?;
        }
        Ok(store)
    }

    pub fn insert(&mut self, producer_id: impl Into<String>, key: VerifyingKey) {
        self.keys.insert(producer_id.into(), key);
    }

    pub fn insert_hex(
        &mut self,
        producer_id: impl Into<String>,
        key_hex: &str,
    ) -> Result<(), TrustStoreError> {
        let producer_id = producer_id.into();
        let invalid = |reason: String| TrustStoreError::InvalidKey {
            producer_id: producer_id.clone(),
            reason,
        };
        let raw = hex::decode(key_hex.trim()).map_err(|e| invalid(e.to_string()))?;
        let bytes: [u8; 32] = raw
            .try_into()
            .map_err(|v: Vec<u8>| invalid(format!("expected 32 bytes, got {}", v.len())))?;
        let key = VerifyingKey::from_bytes(&bytes).map_err(|e| invalid(e.to_string()))?;
        self.keys.insert(producer_id, key);
        Ok(())
    }

    pub fn get(&self, producer_id: &str) -> Option<&VerifyingKey> {
        self.keys.get(producer_id)
    }

    pub fn contains(&self, producer_id: &str) -> bool {
        self.keys.contains_key(producer_id)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Hot-swappable trust store shared by all request handlers.
#[derive(Debug, Default)]
pub struct SharedTrustStore {
    current: RwLock<Arc<TrustStore>>,
}

impl SharedTrustStore {
    pub fn new(store: TrustStore) -> Self {
        Self {
            current: RwLock::new(Arc::new(store)),
        }
    }

    /// The store in effect right now. Cheap: clones an `Arc`.
    pub fn snapshot(&self) -> Arc<TrustStore> {
        let guard = self.current.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&guard)
    }

    /// Atomically install a new set of keys.
    pub fn replace(&self, store: TrustStore) {
        let mut guard = self.current.write().unwrap_or_else(|e| e.into_inner());
        *guard = Arc::new(store);
    }
}
