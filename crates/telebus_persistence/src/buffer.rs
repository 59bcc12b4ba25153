//! Agent-side local buffer
//!
//! Envelopes that could not be delivered are parked here until the broker
//! acknowledges or permanently rejects them. Like the broker WAL it lives in
//! a `sled` tree keyed by a big-endian counter, so iteration is oldest-first,
//! and every mutation is flushed before returning so a restarted agent finds
//! exactly what it had pending.

use std::path::Path;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use sled::{Db, Tree};
use telebus_protocol::Envelope;
use tracing::debug;

const ENTRIES_TREE: &str = "pending_envelopes";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferEntry {
    pub envelope: Envelope,
    pub attempt_count: u32,
    pub next_retry_at_ns: i64,
    pub buffered_at_ns: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum BufferError {
    #[error("failed to open local buffer at {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: sled::Error,
    },
    #[error("local buffer storage error: {0}")]
    Storage(#[from] sled::Error),
    #[error("failed to encode buffer entry: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("corrupt buffer entry {id}: {reason}")]
    Corrupt { id: String, reason: String },
    #[error("local buffer lock poisoned")]
    Poisoned,
}

pub struct LocalBuffer {
    db: Db,
    entries: Tree,
    next_id: Mutex<u64>,
}

impl LocalBuffer {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, BufferError> {
        let path = path.as_ref();
        // Every write flushes explicitly; no background flusher thread.
        let db = sled::Config::new()
            .path(path)
            .flush_every_ms(None)
            .open()
            .map_err(|source| BufferError::Open {
                path: path.display().to_string(),
                source,
            })?;
        let entries = db.open_tree(ENTRIES_TREE)?;
        let next = match entries.last()? {
            Some((key, _)) => decode_id(&key)? + 1,
            None => 1,
        };
        debug!(path = %path.display(), pending = entries.len(), "local buffer opened");
        Ok(Self {
            db,
            entries,
            next_id: Mutex::new(next),
        })
    }

    /// Durably add an entry, returning its buffer id.
    pub fn push(&self, entry: &BufferEntry) -> Result<u64, BufferError> {
        let mut next = self.next_id.lock().map_err(|_| BufferError::Poisoned)?;
        let id = *next;
        self.write(id, entry)?;
        *next = id + 1;
        Ok(id)
    }

    /// Durably replace the entry stored under `id`.
    pub fn update(&self, id: u64, entry: &BufferEntry) -> Result<(), BufferError> {
        self.write(id, entry)
    }

    /// Durably remove an entry. Returns false if it was already gone.
    pub fn remove(&self, id: u64) -> Result<bool, BufferError> {
        let existed = self.entries.remove(id.to_be_bytes())?.is_some();
        self.db.flush()?;
        Ok(existed)
    }

    pub fn get(&self, id: u64) -> Result<Option<BufferEntry>, BufferError> {
        match self.entries.get(id.to_be_bytes())? {
            Some(value) => Ok(Some(decode_entry(id, &value)?)),
            None => Ok(None),
        }
    }

    /// All pending entries, oldest first.
    pub fn entries(&self) -> Result<Vec<(u64, BufferEntry)>, BufferError> {
        self.entries
            .iter()
            .map(|kv| -> Result<(u64, BufferEntry), BufferError> {
                let (key, value) = kv?;
                let id = decode_id(&key)?;
                Ok((id, decode_entry(id, &value)?))
            })
            .collect()
    }

    /// Whether an envelope with this idempotency key is already parked.
    pub fn contains_key(&self, idempotency_key: &str) -> Result<bool, BufferError> {
        Ok(self
            .entries()?
            .iter()
            .any(|(_, e)| e.envelope.idempotency_key == idempotency_key))
    }

    pub fn oldest(&self) -> Result<Option<BufferEntry>, BufferError> {
        match self.entries.first()? {
            Some((key, value)) => Ok(Some(decode_entry(decode_id(&key)?, &value)?)),
            None => Ok(None),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn write(&self, id: u64, entry: &BufferEntry) -> Result<(), BufferError> {
        let value = serde_json::to_vec(entry).map_err(BufferError::Encode)?;
        self.entries.insert(id.to_be_bytes(), value)?;
        self.db.flush()?;
        Ok(())
    }
}

impl std::fmt::Debug for LocalBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalBuffer")
            .field("db", &"sled::Db")
            .field("pending", &self.len())
            .finish()
    }
}

fn decode_id(key: &[u8]) -> Result<u64, BufferError> {
    let bytes: [u8; 8] = key.try_into().map_err(|_| BufferError::Corrupt {
        id: format!("{key:?}"),
        reason: format!("expected 8 byte key, got {}", key.len()),
    })?;
    Ok(u64::from_be_bytes(bytes))
}

fn decode_entry(id: u64, value: &[u8]) -> Result<BufferEntry, BufferError> {
    serde_json::from_slice(value).map_err(|e| BufferError::Corrupt {
        id: id.to_string(),
        reason: e.to_string(),
    })
}
