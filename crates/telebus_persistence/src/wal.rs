//! Write-ahead log backed by `sled`
//!
//! Accepted envelopes are appended to a dedicated `sled` tree keyed by a
//! big-endian `u64` sequence, so key order is sequence order and range scans
//! give an ordered, restartable read path.
//!
//! Guarantees:
//! - `append` returns only after `sled` has flushed the record to disk
//! - appends are serialized by the writer mutex; sequences are unique and
//!   strictly increasing (gaps are allowed, reordering is not)
//! - readers never take the writer lock and can run alongside appends; they
//!   stop at the committed watermark, so a record whose flush has not
//!   returned is never visible
//! - a failed flush is reported to the caller and leaves the WAL marked
//!   unwritable until the next successful append. Its sequence is burned,
//!   never handed out again

use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};
use sled::{Db, Tree};
use telebus_protocol::Envelope;
use tracing::{error, info};

const RECORDS_TREE: &str = "wal_records";

/// Sequence of the first record in an empty log.
pub const FIRST_SEQUENCE: u64 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalRecord {
    pub sequence: u64,
    pub envelope: Envelope,
    pub appended_at_ns: i64,
}

// Borrowing twin of `WalRecord` so appends don't clone the payload.
#[derive(Serialize)]
struct WalRecordRef<'a> {
    sequence: u64,
    envelope: &'a Envelope,
    appended_at_ns: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum WalError {
    #[error("failed to open WAL at {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: sled::Error,
    },
    #[error("WAL storage error: {0}")]
    Storage(#[from] sled::Error),
    #[error("failed to encode WAL record: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("corrupt WAL record at key {key}: {reason}")]
    Corrupt { key: String, reason: String },
    #[error("WAL writer lock poisoned")]
    Poisoned,
    #[error("WAL append aborted: {0}")]
    Aborted(String),
}

/// Append side of the log as the broker sees it.
pub trait EventLog: Send + Sync {
    /// Durably append an envelope, returning its sequence number.
    fn append(&self, envelope: &Envelope, appended_at_ns: i64) -> Result<u64, WalError>;

    /// Number of records currently retained.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// False after a failed durable append, until an append succeeds again.
    fn is_writable(&self) -> bool;
}

pub struct Wal {
    db: Db,
    records: Tree,
    // Next sequence to hand out. Holding this lock is what makes a writer.
    writer: Mutex<u64>,
    // Highest sequence whose flush succeeded; 0 before the first one.
    committed: AtomicU64,
    writable: AtomicBool,
    count: AtomicUsize,
}

impl Wal {
    /// Open or create a WAL at `path`, recovering the sequence counter from
    /// the last persisted record.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, WalError> {
        let path = path.as_ref();
        // Every write flushes explicitly; no background flusher thread.
        let db = sled::Config::new()
            .path(path)
            .flush_every_ms(None)
            .open()
            .map_err(|source| WalError::Open {
                path: path.display().to_string(),
                source,
            })?;
        let records = db.open_tree(RECORDS_TREE)?;

        let next = match records.last()? {
            Some((key, _)) => decode_key(&key)? + 1,
            None => FIRST_SEQUENCE,
        };
        let count = records.len();
        info!(path = %path.display(), records = count, next_sequence = next, "WAL opened");

        Ok(Self {
            db,
            records,
            writer: Mutex::new(next),
            committed: AtomicU64::new(next - 1),
            writable: AtomicBool::new(true),
            count: AtomicUsize::new(count),
        })
    }

    /// Lazily iterate records with `sequence >= from`, in sequence order.
    ///
    /// To resume after a record, call again with `record.sequence + 1`.
    pub fn read_from(&self, from: u64) -> WalIter {
        WalIter {
            inner: self.records.range(from.to_be_bytes()..),
            through: self.committed.load(Ordering::Acquire),
        }
    }

    pub fn last_sequence(&self) -> Result<Option<u64>, WalError> {
        let through = self.committed.load(Ordering::Acquire);
        match self.records.range(..=through.to_be_bytes()).next_back() {
            Some(entry) => Ok(Some(decode_key(&entry?.0)?)),
            None => Ok(None),
        }
    }

    /// Delete every record with `sequence <= through`.
    ///
    /// Only for consumers that have durably committed their own watermark.
    pub fn remove_through(&self, through: u64) -> Result<usize, WalError> {
        // Holds the writer lock: one drain or append at a time.
        let _writer = self.writer.lock().map_err(|_| WalError::Poisoned)?;
        let through = through.min(self.committed.load(Ordering::Acquire));
        let mut batch = sled::Batch::default();
        let mut removed = 0usize;
        for entry in self.records.range(..=through.to_be_bytes()) {
            let (key, _) = entry?;
            batch.remove(key);
            removed += 1;
        }
        if removed == 0 {
            return Ok(0);
        }
        self.records.apply_batch(batch)?;
        self.db.flush()?;
        self.count.fetch_sub(removed, Ordering::AcqRel);
        info!(through, removed, "WAL drained");
        Ok(removed)
    }
}

impl Wal {
    pub(crate) fn append_with(
        &self,
        envelope: &Envelope,
        appended_at_ns: i64,
        flush: impl FnOnce() -> sled::Result<()>,
    ) -> Result<u64, WalError> {
        let mut next = self.writer.lock().map_err(|_| WalError::Poisoned)?;
        let sequence = *next;

        let value = serde_json::to_vec(&WalRecordRef {
            sequence,
            envelope,
            appended_at_ns,
        })
        .map_err(WalError::Encode)?;
        let key = sequence.to_be_bytes();

        let committed = self.records.insert(key, value).and_then(|_| flush());
        // Success or not, this sequence is spent.
        *next = sequence + 1;

        match committed {
            Ok(()) => {
                self.committed.store(sequence, Ordering::Release);
                self.count.fetch_add(1, Ordering::AcqRel);
                self.writable.store(true, Ordering::Release);
                Ok(sequence)
            }
            Err(e) => {
                self.writable.store(false, Ordering::Release);
                if let Err(remove_err) = self.records.remove(key) {
                    error!(sequence, error = %remove_err, "failed to discard uncommitted WAL record");
                }
                error!(sequence, error = %e, "WAL append failed to commit");
                Err(e.into())
            }
        }
    }
}

impl EventLog for Wal {
    fn append(&self, envelope: &Envelope, appended_at_ns: i64) -> Result<u64, WalError> {
        self.append_with(envelope, appended_at_ns, || self.db.flush().map(|_| ()))
    }

    fn len(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    fn is_writable(&self) -> bool {
        self.writable.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for Wal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wal")
            .field("db", &"sled::Db")
            .field("len", &self.len())
            .field("writable", &self.is_writable())
            .finish()
    }
}

/// Ordered iterator returned by [`Wal::read_from`].
pub struct WalIter {
    inner: sled::Iter,
    through: u64,
}

impl Iterator for WalIter {
    type Item = Result<WalRecord, WalError>;

    fn next(&mut self) -> Option<Self::Item> {
        let (key, value) = match self.inner.next()? {
            Ok(kv) => kv,
            Err(e) => return Some(Err(e.into())),
        };
        match decode_key(&key) {
            Ok(sequence) if sequence > self.through => return None,
            Ok(_) => {}
            Err(e) => return Some(Err(e)),
        }
        Some(serde_json::from_slice(&value).map_err(|e| WalError::Corrupt {
            key: format!("{key:?}"),
            reason: e.to_string(),
        }))
    }
}

fn decode_key(key: &[u8]) -> Result<u64, WalError> {
    let bytes: [u8; 8] = key.try_into().map_err(|_| WalError::Corrupt {
        key: format!("{key:?}"),
        reason: format!("expected 8 byte key, got {}", key.len()),
    })?;
    Ok(u64::from_be_bytes(bytes))
}
