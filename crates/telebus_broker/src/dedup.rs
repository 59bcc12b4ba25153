//! Deduplication cache
//!
//! Bounded, TTL-expiring record of idempotency keys the broker has seen.
//! `check_and_record` is a single test-and-set under one lock, so two
//! concurrent publishes with the same key can never both observe `New`.
//!
//! A `New` key starts out *pending*: the caller owns it until it either
//! `commit`s (after a durable WAL append) or `release`s it (shed, WAL
//! failure). While pending, other callers see `InFlight`.
//!
//! Eviction happens on access: expired entries are swept from the front of
//! the insertion queue, and inserts beyond `capacity` evict the oldest
//! committed entries first. Pending reservations are never evicted.
//! A key that has been evicted is simply treated as new again.
//!
//! Idempotency keys are chosen by producers, so the broker scopes them with
//! [`scoped_key`] before they reach the cache: two producers reusing the
//! same key never collide.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use telebus_utils::Clock;
use telebus_utils::clock::duration_to_ns;

pub const DEFAULT_DEDUP_TTL: Duration = Duration::from_secs(300);
pub const DEFAULT_DEDUP_CAPACITY: usize = 50_000;

/// Cache key for one producer's idempotency key. The length prefix keeps
/// `("a:b", "c")` and `("a", "b:c")` apart.
pub fn scoped_key(producer_id: &str, idempotency_key: &str) -> String {
    format!("{}:{producer_id}:{idempotency_key}", producer_id.len())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupOutcome {
    /// First sighting; the key is now reserved for the caller.
    New,
    /// Already durably accepted within the TTL window.
    Duplicate,
    /// Another request holding this key has not finished yet.
    InFlight,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryState {
    Pending,
    Committed,
}

#[derive(Debug, Clone, Copy)]
struct DedupEntry {
    generation: u64,
    first_seen_at_ns: i64,
    expires_at_ns: i64,
    state: EntryState,
}

#[derive(Debug, Default)]
struct DedupState {
    entries: HashMap<String, DedupEntry>,
    // Insertion order. May hold stale (key, generation) pairs for keys that
    // were released or re-inserted; those are skipped on eviction.
    order: VecDeque<(String, u64)>,
    next_generation: u64,
}

#[derive(Debug)]
pub struct DedupCache {
    state: Mutex<DedupState>,
    ttl_ns: i64,
    capacity: usize,
    clock: Arc<dyn Clock>,
}

impl DedupCache {
    pub fn new(ttl: Duration, capacity: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(DedupState::default()),
            ttl_ns: duration_to_ns(ttl),
            capacity: capacity.max(1),
            clock,
        }
    }

    pub fn check_and_record(&self, key: &str) -> DedupOutcome {
        let now = self.clock.now_ns();
        let mut state = self.lock();
        sweep_expired(&mut state, now);

        if let Some(entry) = state.entries.get(key) {
            return match entry.state {
                EntryState::Committed => DedupOutcome::Duplicate,
                EntryState::Pending => DedupOutcome::InFlight,
            };
        }

        let generation = state.next_generation;
        state.next_generation += 1;
        state.entries.insert(
            key.to_string(),
            DedupEntry {
                generation,
                first_seen_at_ns: now,
                expires_at_ns: now.saturating_add(self.ttl_ns),
                state: EntryState::Pending,
            },
        );
        state.order.push_back((key.to_string(), generation));
        self.evict_over_capacity(&mut state);
        DedupOutcome::New
    }

    /// Mark a reserved key as durably accepted.
    pub fn commit(&self, key: &str) {
        let mut state = self.lock();
        if let Some(entry) = state.entries.get_mut(key) {
            entry.state = EntryState::Committed;
        }
    }

    /// Drop a reservation that never turned into an acceptance.
    pub fn release(&self, key: &str) {
        let mut state = self.lock();
        if matches!(
            state.entries.get(key),
            Some(DedupEntry {
                state: EntryState::Pending,
                ..
            })
        ) {
            state.entries.remove(key);
        }
    }

    /// Sweep expired entries now rather than on the next access.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_ns();
        let mut state = self.lock();
        let before = state.entries.len();
        sweep_expired(&mut state, now);
        before - state.entries.len()
    }

    /// When a live key was first recorded.
    pub fn first_seen(&self, key: &str) -> Option<i64> {
        self.lock().entries.get(key).map(|e| e.first_seen_at_ns)
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // Pending reservations stay until their owner commits or releases them.
    fn evict_over_capacity(&self, state: &mut DedupState) {
        let mut reserved = Vec::new();
        while state.entries.len() > self.capacity {
            let Some((key, generation)) = state.order.pop_front() else {
                break;
            };
            let pending = state.entries.get(&key).is_some_and(|e| {
                e.generation == generation && e.state == EntryState::Pending
            });
            if pending {
                reserved.push((key, generation));
            } else {
                remove_if_current(state, &key, generation);
            }
        }
        for slot in reserved.into_iter().rev() {
            state.order.push_front(slot);
        }
    }

    fn lock(&self) -> MutexGuard<'_, DedupState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn sweep_expired(state: &mut DedupState, now: i64) {
    // TTL is uniform, so insertion order is expiry order.
    while let Some((key, generation)) = state.order.front() {
        let live = state
            .entries
            .get(key)
            .is_some_and(|e| e.generation == *generation && e.expires_at_ns > now);
        if live {
            break;
        }
        if let Some((key, generation)) = state.order.pop_front() {
            remove_if_current(state, &key, generation);
        }
    }
}

fn remove_if_current(state: &mut DedupState, key: &str, generation: u64) {
    if state
        .entries
        .get(key)
        .is_some_and(|entry| entry.generation == generation)
    {
        state.entries.remove(key);
    }
}
