//! WalRelay - primary-side WAL replication core
//!
//! Ships write-ahead-log record batches from a primary to a fixed replica set
//! and decides when client-visible commits may be acknowledged.
//!
//! # Architecture
//!
//! - **Messages**: typed envelopes (records batch, txn applied, ack) with a
//!   checksummed little-endian wire format
//! - **Ledger**: FIFO queue of commit callback batches plus per-transaction
//!   replica applied tracking
//! - **Primary manager**: assigns batch/message ids, ships batches, consumes
//!   applied notifications, and releases callbacks in commit order
//!
//! # Policies
//!
//! - `Async`: commit callbacks fire as soon as the batch is handed over
//! - `Sync`: commit callbacks fire once every replica applied the transaction

#![deny(clippy::all)]

pub mod error;
pub mod metrics;
pub mod replication;

pub use error::{ReplicationError, Result};
pub use replication::{
  BufferPool, ChannelNetwork, CommitCallback, LogBuffer, PrimaryReplicationManager,
  PrimaryReplicationOptions, ReplicaId, ReplicationMessage, ReplicationPolicy,
};
