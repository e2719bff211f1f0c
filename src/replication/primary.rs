//! Primary-side replication orchestration.
//!
//! Ships record batches to every replica and decides when queued commit
//! callbacks may fire. Two entry points run concurrently: the commit path
//! ([`PrimaryReplicationManager::replicate_batch`]) and the transport dispatch
//! path ([`PrimaryReplicationManager::handle_message`]).

use super::buffer::{BufferPool, LogBuffer};
use super::ledger::CommitLedger;
use super::messages::{MessageIdGenerator, ReplicationMessage};
use super::options::{PrimaryReplicationOptions, ReplicaEndpoint};
use super::types::{
  CommitCallback, MessageId, RecordBatchId, ReplicaId, ReplicationPolicy, TxnId,
  INVALID_RECORD_BATCH_ID,
};
use super::transport::{noop_reply_handler, BuiltinCallback, Messenger};
use crate::error::{ReplicationError, Result};
use hashbrown::{HashMap, HashSet};
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

const FIRST_RECORD_BATCH_ID: RecordBatchId = 1;
// Ids start at 1, so 0 marks "nothing assigned yet" for the status high-water mark.
const NO_BATCH_ASSIGNED: RecordBatchId = 0;

#[derive(Debug, Clone)]
pub struct PrimaryReplicationStatus {
  pub network_identity: String,
  pub replica_count: usize,
  pub last_batch_id: Option<RecordBatchId>,
  pub last_message_id: Option<MessageId>,
  pub pending_batches: usize,
  pub pending_callbacks: usize,
  pub tracked_txns: usize,
  pub outstanding_acks: usize,
  pub oldest_pending_age: Option<Duration>,
  pub batches_sent: u64,
  pub callbacks_invoked: u64,
  pub applied_notifications: u64,
  pub send_failures: u64,
}

/// The oldest SYNC batch that has waited past the stall threshold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StalledBatch {
  pub batch_id: Option<RecordBatchId>,
  pub waiting_for: Duration,
  pub pending_callbacks: usize,
  pub blocking_txn: TxnId,
  pub missing_replicas: Vec<ReplicaId>,
}

#[derive(Debug)]
struct LedgerState {
  ledger: CommitLedger,
  ready: VecDeque<CommitCallback>,
  releasing: bool,
}

pub struct PrimaryReplicationManager {
  network_identity: String,
  replicas: IndexMap<ReplicaId, ReplicaEndpoint>,
  messenger: Arc<dyn Messenger>,
  buffer_pool: BufferPool,
  state: Mutex<LedgerState>,
  outstanding_acks: Mutex<HashMap<MessageId, HashSet<ReplicaId>>>,
  next_batch_id: AtomicU64,
  last_batch_id: AtomicU64,
  message_ids: MessageIdGenerator,
  stall_warning_after: Option<Duration>,
  batches_sent: AtomicU64,
  callbacks_invoked: AtomicU64,
  applied_notifications: AtomicU64,
  send_failures: AtomicU64,
}

impl PrimaryReplicationManager {
  pub fn new(
    options: PrimaryReplicationOptions,
    messenger: Arc<dyn Messenger>,
    buffer_pool: BufferPool,
  ) -> Result<Self> {
    options.validate()?;
    let replica_count = options.replicas.len();

    Ok(Self {
      network_identity: options.network_identity,
      replicas: options.replicas,
      messenger,
      buffer_pool,
      state: Mutex::new(LedgerState {
        ledger: CommitLedger::new(replica_count),
        ready: VecDeque::new(),
        releasing: false,
      }),
      outstanding_acks: Mutex::new(HashMap::new()),
      next_batch_id: AtomicU64::new(FIRST_RECORD_BATCH_ID),
      last_batch_id: AtomicU64::new(NO_BATCH_ASSIGNED),
      message_ids: MessageIdGenerator::new(),
      stall_warning_after: options.stall_warning_after,
      batches_sent: AtomicU64::new(0),
      callbacks_invoked: AtomicU64::new(0),
      applied_notifications: AtomicU64::new(0),
      send_failures: AtomicU64::new(0),
    })
  }

  pub fn network_identity(&self) -> &str {
    &self.network_identity
  }

  pub fn replicas(&self) -> impl Iterator<Item = &ReplicaEndpoint> {
    self.replicas.values()
  }

  pub fn replica_count(&self) -> usize {
    self.replicas.len()
  }

  /// Hand a committed batch and its commit callbacks to replication.
  ///
  /// Under `Async`, or when the batch produced no records, every callback
  /// runs before this returns. Under `Sync` the callbacks are queued and
  /// released once every replica reports having applied their transactions.
  ///
  /// # Panics
  ///
  /// Panics when called with [`ReplicationPolicy::Disable`], or when the
  /// records do not fit a single envelope (body length beyond `u32::MAX`).
  pub fn replicate_batch(
    &self,
    records: Option<Arc<LogBuffer>>,
    callbacks: Vec<CommitCallback>,
    policy: ReplicationPolicy,
  ) {
    assert!(
      policy != ReplicationPolicy::Disable,
      "replicate_batch called with replication disabled"
    );

    let Some(records) = records else {
      self.invoke_callbacks(callbacks);
      return;
    };

    // Frame the batch before queuing anything: a SYNC slot whose batch never
    // went out could never release.
    let batch_id = self.next_batch_id();
    let metadata = self.message_ids.next_metadata();
    let envelope = match ReplicationMessage::records_batch(metadata, batch_id, records.as_bytes())
      .encode()
    {
      Ok(envelope) => envelope,
      Err(error) => panic!("records batch {batch_id} cannot be framed: {error}"),
    };
    let txn_ids: Vec<TxnId> = callbacks.iter().map(CommitCallback::txn_id).collect();

    if policy == ReplicationPolicy::Async {
      self.invoke_callbacks(callbacks);
    } else {
      self
        .state
        .lock()
        .ledger
        .enqueue(Some(batch_id), callbacks, true);
    }

    self.send_records_batch(batch_id, metadata.message_id, &envelope, &txn_ids);

    if records.mark_serialized() {
      self.buffer_pool.recycle(records);
    }
  }

  /// Per-connection dispatch entry point.
  pub fn handle_message(&self, from: &ReplicaId, message: ReplicationMessage<'_>) -> Result<()> {
    match message {
      ReplicationMessage::TxnApplied { metadata, txn_id } => {
        self.handle_txn_applied(from, metadata.message_id, txn_id)
      }
      ReplicationMessage::Ack {
        acked_message_id, ..
      } => {
        self.handle_ack(from, acked_message_id);
        Ok(())
      }
      // Replicas never ship records to the primary.
      ReplicationMessage::RecordsBatch {
        metadata, batch_id, ..
      } => {
        debug!(
          replica = %from,
          message_id = metadata.message_id,
          batch_id,
          "primary ignores inbound records batch"
        );
        Ok(())
      }
    }
  }

  /// Decode a raw envelope and dispatch it.
  pub fn handle_raw(&self, from: &ReplicaId, payload: &[u8]) -> Result<()> {
    let message = ReplicationMessage::decode(payload)?;
    self.handle_message(from, message)
  }

  /// A replica applied `txn_id`.
  pub fn handle_txn_applied(
    &self,
    from: &ReplicaId,
    message_id: MessageId,
    txn_id: TxnId,
  ) -> Result<()> {
    if !self.replicas.contains_key(from) {
      return Err(ReplicationError::UnknownReplica(from.to_string()));
    }
    trace!(replica = %from, message_id, txn_id, "received txn applied");
    self.applied_notifications.fetch_add(1, Ordering::Relaxed);

    self.send_ack_for_message(from, message_id);

    let mut state = self.state.lock();
    if state.ledger.record_applied(txn_id, from) {
      let released = state.ledger.drain_ready();
      state.ready.extend(released);
    }
    if state.releasing || state.ready.is_empty() {
      // A releasing thread picks up anything appended here, in order.
      return Ok(());
    }
    state.releasing = true;
    drop(state);

    self.release_ready();
    Ok(())
  }

  /// Acknowledge receipt of `acked_message_id` to `to`.
  pub fn send_ack_for_message(&self, to: &ReplicaId, acked_message_id: MessageId) {
    let message = ReplicationMessage::ack(self.message_ids.next_metadata(), acked_message_id);
    let envelope = match message.encode() {
      Ok(envelope) => envelope,
      Err(error) => {
        warn!(replica = %to, acked_message_id, %error, "failed to encode ack");
        return;
      }
    };
    if let Err(error) = self.messenger.send(
      to,
      &envelope,
      noop_reply_handler(),
      BuiltinCallback::Noop,
      true,
    ) {
      self.send_failures.fetch_add(1, Ordering::Relaxed);
      warn!(replica = %to, acked_message_id, %error, "failed to send ack");
    }
  }

  /// Next batch id. Never returns [`INVALID_RECORD_BATCH_ID`].
  pub fn next_batch_id(&self) -> RecordBatchId {
    let mut batch_id = self.next_batch_id.fetch_add(1, Ordering::AcqRel);
    if batch_id == INVALID_RECORD_BATCH_ID {
      batch_id = self.next_batch_id.fetch_add(1, Ordering::AcqRel);
    }
    self.last_batch_id.fetch_max(batch_id, Ordering::AcqRel);
    batch_id
  }

  /// Report the head SYNC batch if it has waited past the stall threshold.
  /// Stalled batches are never released early.
  pub fn check_stalled(&self) -> Option<StalledBatch> {
    let threshold = self.stall_warning_after?;
    let head = self.state.lock().ledger.blocked_head()?;
    let waiting_for = head.enqueued_at.elapsed();
    if waiting_for < threshold {
      return None;
    }

    let missing_replicas: Vec<ReplicaId> = self
      .replicas
      .keys()
      .filter(|replica| !head.applied_by.contains(replica))
      .cloned()
      .collect();
    warn!(
      batch_id = ?head.batch_id,
      txn_id = head.blocking_txn,
      waiting_ms = waiting_for.as_millis() as u64,
      missing = ?missing_replicas,
      "sync commit stalled waiting for replicas"
    );

    Some(StalledBatch {
      batch_id: head.batch_id,
      waiting_for,
      pending_callbacks: head.pending_callbacks,
      blocking_txn: head.blocking_txn,
      missing_replicas,
    })
  }

  pub fn status(&self) -> PrimaryReplicationStatus {
    let (pending_batches, pending_callbacks, tracked_txns, oldest_pending_age) = {
      let state = self.state.lock();
      (
        state.ledger.pending_batches(),
        state.ledger.pending_callbacks(),
        state.ledger.tracked_txns(),
        state
          .ledger
          .blocked_head()
          .map(|head| head.enqueued_at.elapsed()),
      )
    };
    let outstanding_acks = self
      .outstanding_acks
      .lock()
      .values()
      .map(HashSet::len)
      .sum();
    let last_batch_id = Some(self.last_batch_id.load(Ordering::Acquire))
      .filter(|batch_id| *batch_id != NO_BATCH_ASSIGNED);

    PrimaryReplicationStatus {
      network_identity: self.network_identity.clone(),
      replica_count: self.replicas.len(),
      last_batch_id,
      last_message_id: self.message_ids.last_issued(),
      pending_batches,
      pending_callbacks,
      tracked_txns,
      outstanding_acks,
      oldest_pending_age,
      batches_sent: self.batches_sent.load(Ordering::Relaxed),
      callbacks_invoked: self.callbacks_invoked.load(Ordering::Relaxed),
      applied_notifications: self.applied_notifications.load(Ordering::Relaxed),
      send_failures: self.send_failures.load(Ordering::Relaxed),
    }
  }

  fn handle_ack(&self, from: &ReplicaId, acked_message_id: MessageId) {
    trace!(replica = %from, acked_message_id, "received ack");
    self.clear_outstanding(from, acked_message_id);
  }

  fn clear_outstanding(&self, replica: &ReplicaId, message_id: MessageId) {
    let mut outstanding = self.outstanding_acks.lock();
    if let Some(waiting) = outstanding.get_mut(&message_id) {
      waiting.remove(replica);
      if waiting.is_empty() {
        outstanding.remove(&message_id);
      }
    }
  }

  fn send_records_batch(
    &self,
    batch_id: RecordBatchId,
    message_id: MessageId,
    envelope: &[u8],
    txn_ids: &[TxnId],
  ) {
    trace!(batch_id, message_id, txns = ?txn_ids, "sending records batch");

    // Register before sending: the ack may arrive before send returns.
    self
      .outstanding_acks
      .lock()
      .insert(message_id, self.replicas.keys().cloned().collect());

    for replica in self.replicas.keys() {
      if let Err(error) = self.messenger.send(
        replica,
        envelope,
        noop_reply_handler(),
        BuiltinCallback::Noop,
        true,
      ) {
        self.send_failures.fetch_add(1, Ordering::Relaxed);
        warn!(replica = %replica, batch_id, %error, "failed to send records batch");
        self.clear_outstanding(replica, message_id);
      }
    }
    self.batches_sent.fetch_add(1, Ordering::Relaxed);
  }

  /// Invoke queued-ready callbacks outside the ledger lock until none are
  /// left. Only the thread that set `releasing` runs this.
  fn release_ready(&self) {
    let mut guard = ReleaseGuard {
      manager: self,
      unfired: VecDeque::new(),
      armed: true,
    };
    loop {
      {
        let mut state = self.state.lock();
        if state.ready.is_empty() {
          state.releasing = false;
          guard.armed = false;
          break;
        }
        guard.unfired = std::mem::take(&mut state.ready);
      }
      while let Some(callback) = guard.unfired.pop_front() {
        trace!(txn_id = callback.txn_id(), "commit callback invoked");
        callback.invoke();
        self.callbacks_invoked.fetch_add(1, Ordering::Relaxed);
      }
    }
  }

  fn invoke_callbacks(&self, callbacks: Vec<CommitCallback>) {
    for callback in callbacks {
      callback.invoke();
      self.callbacks_invoked.fetch_add(1, Ordering::Relaxed);
    }
  }
}

/// If a callback panics mid-release, puts the callbacks that never ran back
/// at the front of the ready queue and clears the releasing flag. They fire
/// on the next release pass.
struct ReleaseGuard<'a> {
  manager: &'a PrimaryReplicationManager,
  unfired: VecDeque<CommitCallback>,
  armed: bool,
}

impl Drop for ReleaseGuard<'_> {
  fn drop(&mut self) {
    if !self.armed {
      return;
    }
    let mut state = self.manager.state.lock();
    let mut ready = std::mem::take(&mut self.unfired);
    ready.append(&mut state.ready);
    state.ready = ready;
    state.releasing = false;
  }
}
