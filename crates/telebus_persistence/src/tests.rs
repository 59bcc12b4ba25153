use crate::{BufferEntry, EventLog, LocalBuffer, Wal};
use std::sync::Arc;
use telebus_protocol::Envelope;
use tempfile::tempdir;

fn envelope(key: &str, payload: &str) -> Envelope {
    let mut e = Envelope::unsigned(payload.as_bytes().to_vec(), "agent-1", key, 42);
    e.signature = vec![1; 64];
    e
}

fn entry(key: &str) -> BufferEntry {
    BufferEntry {
        envelope: envelope(key, "cpu=1"),
        attempt_count: 1,
        next_retry_at_ns: 100,
        buffered_at_ns: 50,
    }
}

#[test]
fn test_sequential_appends_read_back_in_order() {
    let dir = tempdir().unwrap();
    let wal = Wal::open(dir.path()).unwrap();

    let s1 = wal.append(&envelope("r1", "one"), 10).unwrap();
    let s2 = wal.append(&envelope("r2", "two"), 11).unwrap();
    let s3 = wal.append(&envelope("r3", "three"), 12).unwrap();
    assert!(s1 < s2 && s2 < s3);

    let records: Vec<_> = wal.read_from(0).map(|r| r.unwrap()).collect();
    let keys: Vec<_> = records
        .iter()
        .map(|r| r.envelope.idempotency_key.as_str())
        .collect();
    assert_eq!(keys, vec!["r1", "r2", "r3"]);
    assert_eq!(records[1].appended_at_ns, 11);
    assert_eq!(wal.len(), 3);
    assert!(wal.is_writable());
}

#[test]
fn test_read_from_is_restartable() {
    let dir = tempdir().unwrap();
    let wal = Wal::open(dir.path()).unwrap();
    for i in 0..5 {
        wal.append(&envelope(&format!("k{i}"), "x"), i).unwrap();
    }

    let first_two: Vec<_> = wal.read_from(0).take(2).map(|r| r.unwrap()).collect();
    let resume_at = first_two[1].sequence + 1;
    let rest: Vec<_> = wal.read_from(resume_at).map(|r| r.unwrap()).collect();

    assert_eq!(rest.len(), 3);
    assert_eq!(rest[0].envelope.idempotency_key, "k2");
}

#[test]
fn test_concurrent_appends_get_unique_increasing_sequences() {
    let dir = tempdir().unwrap();
    let wal = Arc::new(Wal::open(dir.path()).unwrap());

    let handles: Vec<_> = (0..8)
        .map(|t| {
            let wal = wal.clone();
            std::thread::spawn(move || {
                (0..10)
                    .map(|i| wal.append(&envelope(&format!("t{t}-{i}"), "x"), 0).unwrap())
                    .collect::<Vec<_>>()
            })
        })
        .collect();
    let mut assigned: Vec<u64> = handles
        .into_iter()
        .flat_map(|h| h.join().unwrap())
        .collect();
    assigned.sort_unstable();
    assigned.dedup();
    assert_eq!(assigned.len(), 80);

    let read: Vec<u64> = wal.read_from(0).map(|r| r.unwrap().sequence).collect();
    assert_eq!(read.len(), 80);
    assert!(read.windows(2).all(|w| w[0] < w[1]));
}

#[test]
fn test_wal_survives_reopen_and_continues_sequence() {
    let dir = tempdir().unwrap();
    let last = {
        let wal = Wal::open(dir.path()).unwrap();
        wal.append(&envelope("a", "1"), 0).unwrap();
        wal.append(&envelope("b", "2"), 0).unwrap()
    };

    let wal = Wal::open(dir.path()).unwrap();
    assert_eq!(wal.len(), 2);
    assert_eq!(wal.last_sequence().unwrap(), Some(last));
    let next = wal.append(&envelope("c", "3"), 0).unwrap();
    assert_eq!(next, last + 1);
}

#[test]
fn test_remove_through_drains_prefix() {
    let dir = tempdir().unwrap();
    let wal = Wal::open(dir.path()).unwrap();
    let seqs: Vec<_> = (0..4)
        .map(|i| wal.append(&envelope(&format!("k{i}"), "x"), 0).unwrap())
        .collect();

    assert_eq!(wal.remove_through(seqs[1]).unwrap(), 2);
    assert_eq!(wal.len(), 2);
    let remaining: Vec<_> = wal.read_from(0).map(|r| r.unwrap().sequence).collect();
    assert_eq!(remaining, vec![seqs[2], seqs[3]]);
    assert_eq!(wal.remove_through(seqs[1]).unwrap(), 0);
}

#[test]
fn test_concurrent_remove_through_counts_once() {
    let dir = tempdir().unwrap();
    let wal = Arc::new(Wal::open(dir.path()).unwrap());
    for i in 0..50 {
        wal.append(&envelope(&format!("k{i}"), "x"), 0).unwrap();
    }

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let wal = wal.clone();
            std::thread::spawn(move || wal.remove_through(40).unwrap())
        })
        .collect();
    let removed: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();

    assert_eq!(removed, 40);
    assert_eq!(wal.len(), 10);
}

#[test]
fn test_failed_flush_burns_sequence_and_hides_record() {
    let dir = tempdir().unwrap();
    let wal = Wal::open(dir.path()).unwrap();
    let first = wal.append(&envelope("ok-1", "x"), 0).unwrap();

    let mut seen_during_flush = Vec::new();
    let err = wal
        .append_with(&envelope("lost", "y"), 0, || {
            seen_during_flush = wal
                .read_from(0)
                .map(|r| r.unwrap().envelope.idempotency_key)
                .collect();
            Err(sled::Error::Unsupported("disk full".to_string()))
        })
        .unwrap_err();
    assert!(matches!(err, crate::WalError::Storage(_)));
    assert_eq!(seen_during_flush, vec!["ok-1".to_string()]);
    assert!(!wal.is_writable());
    assert_eq!(wal.len(), 1);
    assert_eq!(wal.last_sequence().unwrap(), Some(first));

    let next = wal.append(&envelope("ok-2", "z"), 0).unwrap();
    assert_eq!(next, first + 2);
    assert!(wal.is_writable());
    let keys: Vec<_> = wal
        .read_from(0)
        .map(|r| r.unwrap().envelope.idempotency_key)
        .collect();
    assert_eq!(keys, vec!["ok-1", "ok-2"]);
}

#[test]
fn test_empty_wal() {
    let dir = tempdir().unwrap();
    let wal = Wal::open(dir.path()).unwrap();
    assert!(wal.is_empty());
    assert_eq!(wal.last_sequence().unwrap(), None);
    assert_eq!(wal.read_from(0).count(), 0);
}

#[test]
fn test_buffer_keeps_insertion_order() {
    let dir = tempdir().unwrap();
    let buffer = LocalBuffer::open(dir.path()).unwrap();
    let a = buffer.push(&entry("evt-a")).unwrap();
    let b = buffer.push(&entry("evt-b")).unwrap();
    assert!(a < b);

    let keys: Vec<_> = buffer
        .entries()
        .unwrap()
        .into_iter()
        .map(|(_, e)| e.envelope.idempotency_key)
        .collect();
    assert_eq!(keys, vec!["evt-a", "evt-b"]);
    assert_eq!(
        buffer.oldest().unwrap().unwrap().envelope.idempotency_key,
        "evt-a"
    );
    assert!(buffer.contains_key("evt-b").unwrap());
    assert!(!buffer.contains_key("evt-z").unwrap());
}

#[test]
fn test_buffer_update_and_remove() {
    let dir = tempdir().unwrap();
    let buffer = LocalBuffer::open(dir.path()).unwrap();
    let id = buffer.push(&entry("evt-1")).unwrap();

    let mut updated = entry("evt-1");
    updated.attempt_count = 4;
    updated.next_retry_at_ns = 999;
    buffer.update(id, &updated).unwrap();
    assert_eq!(buffer.get(id).unwrap(), Some(updated));

    assert!(buffer.remove(id).unwrap());
    assert!(!buffer.remove(id).unwrap());
    assert!(buffer.is_empty());
    assert_eq!(buffer.get(id).unwrap(), None);
}

#[test]
fn test_buffer_survives_restart() {
    let dir = tempdir().unwrap();
    {
        let buffer = LocalBuffer::open(dir.path()).unwrap();
        for key in ["evt-1", "evt-2", "evt-3"] {
            buffer.push(&entry(key)).unwrap();
        }
    }

    let reopened = LocalBuffer::open(dir.path()).unwrap();
    let keys: Vec<_> = reopened
        .entries()
        .unwrap()
        .into_iter()
        .map(|(_, e)| e.envelope.idempotency_key)
        .collect();
    assert_eq!(keys, vec!["evt-1", "evt-2", "evt-3"]);

    // ids keep growing after a restart
    let id = reopened.push(&entry("evt-4")).unwrap();
    assert_eq!(id, 4);
}
