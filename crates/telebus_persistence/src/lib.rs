//! telebus_persistence
//!
//! Durable storage on `sled` for both ends of the bus:
//!
//! - `wal`: the broker's append-only write-ahead log of accepted envelopes
//!   and the `EventLog` trait the broker appends through
//! - `buffer`: the agent's local buffer of envelopes awaiting acknowledgement

pub mod buffer;
pub mod wal;

pub use buffer::{BufferEntry, BufferError, LocalBuffer};
pub use wal::{EventLog, FIRST_SEQUENCE, Wal, WalError, WalIter, WalRecord};

#[cfg(test)]
mod tests;
