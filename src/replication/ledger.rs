//! Commit callback ledger: queued callback batches plus per-transaction
//! applied tracking.
//!
//! The queue drains strictly from the front. A batch is released only once
//! every callback before it has been released, so acknowledgement order
//! always matches commit submission order.

use super::types::{CommitCallback, RecordBatchId, ReplicaId, TxnId};
use hashbrown::{HashMap, HashSet};
use std::collections::VecDeque;
use std::time::Instant;

#[derive(Debug)]
struct BatchOfCommitCallbacks {
  batch_id: Option<RecordBatchId>,
  callbacks: VecDeque<CommitCallback>,
  has_records: bool,
  enqueued_at: Instant,
}

/// What the batch at the head of the queue is waiting for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockedHead {
  pub batch_id: Option<RecordBatchId>,
  pub enqueued_at: Instant,
  pub pending_callbacks: usize,
  pub blocking_txn: TxnId,
  pub applied_by: Vec<ReplicaId>,
}

#[derive(Debug)]
pub struct CommitLedger {
  replica_count: usize,
  queue: VecDeque<BatchOfCommitCallbacks>,
  applied: HashMap<TxnId, HashSet<ReplicaId>>,
  pending_txns: HashSet<TxnId>,
}

impl CommitLedger {
  pub fn new(replica_count: usize) -> Self {
    Self {
      replica_count,
      queue: VecDeque::new(),
      applied: HashMap::new(),
      pending_txns: HashSet::new(),
    }
  }

  pub fn replica_count(&self) -> usize {
    self.replica_count
  }

  /// Append a batch to the back of the queue. Empty callback lists reserve
  /// nothing and are not queued.
  pub fn enqueue(
    &mut self,
    batch_id: Option<RecordBatchId>,
    callbacks: Vec<CommitCallback>,
    has_records: bool,
  ) {
    if callbacks.is_empty() {
      return;
    }
    if has_records {
      self
        .pending_txns
        .extend(callbacks.iter().map(CommitCallback::txn_id));
    }
    self.queue.push_back(BatchOfCommitCallbacks {
      batch_id,
      callbacks: callbacks.into(),
      has_records,
      enqueued_at: Instant::now(),
    });
  }

  /// Note that `replica` applied `txn_id`. Returns `true` when every replica
  /// has now applied it.
  ///
  /// Notifications for transactions with no queued callback (already
  /// released, or committed asynchronously) are absorbed without creating
  /// tracking state.
  pub fn record_applied(&mut self, txn_id: TxnId, replica: &ReplicaId) -> bool {
    if !self.pending_txns.contains(&txn_id) {
      return false;
    }
    let replicas = self.applied.entry(txn_id).or_default();
    if !replicas.contains(replica) {
      replicas.insert(replica.clone());
    }
    replicas.len() >= self.replica_count
  }

  pub fn is_fully_applied(&self, txn_id: TxnId) -> bool {
    self
      .applied
      .get(&txn_id)
      .is_some_and(|replicas| replicas.len() >= self.replica_count)
  }

  /// Detach every callback that may be released now, in queue order.
  ///
  /// Scans from the front: a record-less batch is released whole; a batch
  /// with records releases its longest fully-applied prefix and, if anything
  /// remains, stops the scan there.
  pub fn drain_ready(&mut self) -> Vec<CommitCallback> {
    let mut released = Vec::new();

    while let Some(head) = self.queue.front_mut() {
      if !head.has_records {
        released.extend(head.callbacks.drain(..));
        self.queue.pop_front();
        continue;
      }

      let ready = head
        .callbacks
        .iter()
        .take_while(|callback| {
          self
            .applied
            .get(&callback.txn_id())
            .is_some_and(|replicas| replicas.len() >= self.replica_count)
        })
        .count();

      for callback in head.callbacks.drain(..ready) {
        self.applied.remove(&callback.txn_id());
        self.pending_txns.remove(&callback.txn_id());
        released.push(callback);
      }

      if !head.callbacks.is_empty() {
        break;
      }
      self.queue.pop_front();
    }

    released
  }

  pub fn blocked_head(&self) -> Option<BlockedHead> {
    let head = self.queue.front()?;
    let blocking = head.callbacks.front()?;
    let mut applied_by: Vec<ReplicaId> = self
      .applied
      .get(&blocking.txn_id())
      .map(|replicas| replicas.iter().cloned().collect())
      .unwrap_or_default();
    applied_by.sort();

    Some(BlockedHead {
      batch_id: head.batch_id,
      enqueued_at: head.enqueued_at,
      pending_callbacks: head.callbacks.len(),
      blocking_txn: blocking.txn_id(),
      applied_by,
    })
  }

  pub fn pending_batches(&self) -> usize {
    self.queue.len()
  }

  pub fn pending_callbacks(&self) -> usize {
    self.queue.iter().map(|batch| batch.callbacks.len()).sum()
  }

  pub fn tracked_txns(&self) -> usize {
    self.applied.len()
  }

  pub fn is_empty(&self) -> bool {
    self.queue.is_empty()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use parking_lot::Mutex;
  use std::sync::Arc;

  fn recording_callback(txn_id: TxnId, log: &Arc<Mutex<Vec<TxnId>>>) -> CommitCallback {
    let log = Arc::clone(log);
    CommitCallback::new(txn_id, move || log.lock().push(txn_id))
  }

  fn release(ledger: &mut CommitLedger) {
    for callback in ledger.drain_ready() {
      callback.invoke();
    }
  }

  #[test]
  fn batch_waits_for_every_replica() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let (a, b) = (ReplicaId::new("a"), ReplicaId::new("b"));
    let mut ledger = CommitLedger::new(2);
    ledger.enqueue(Some(1), vec![recording_callback(10, &log)], true);

    assert!(!ledger.record_applied(10, &a));
    release(&mut ledger);
    assert!(log.lock().is_empty());

    assert!(ledger.record_applied(10, &b));
    release(&mut ledger);
    assert_eq!(*log.lock(), vec![10]);
    assert!(ledger.is_empty());
    assert_eq!(ledger.tracked_txns(), 0);
  }

  #[test]
  fn later_batch_is_blocked_by_earlier_one() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let a = ReplicaId::new("a");
    let mut ledger = CommitLedger::new(1);
    ledger.enqueue(Some(1), vec![recording_callback(1, &log)], true);
    ledger.enqueue(Some(2), vec![recording_callback(2, &log)], true);

    ledger.record_applied(2, &a);
    release(&mut ledger);
    assert!(log.lock().is_empty());
    assert_eq!(ledger.pending_batches(), 2);

    ledger.record_applied(1, &a);
    release(&mut ledger);
    assert_eq!(*log.lock(), vec![1, 2]);
  }

  #[test]
  fn partial_batch_releases_prefix_only() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let a = ReplicaId::new("a");
    let mut ledger = CommitLedger::new(1);
    ledger.enqueue(
      Some(1),
      vec![
        recording_callback(1, &log),
        recording_callback(2, &log),
        recording_callback(3, &log),
      ],
      true,
    );

    ledger.record_applied(1, &a);
    ledger.record_applied(3, &a);
    release(&mut ledger);
    assert_eq!(*log.lock(), vec![1]);
    assert_eq!(ledger.pending_callbacks(), 2);

    let head = ledger.blocked_head().expect("blocked head");
    assert_eq!(head.blocking_txn, 2);
    assert!(head.applied_by.is_empty());

    ledger.record_applied(2, &a);
    release(&mut ledger);
    assert_eq!(*log.lock(), vec![1, 2, 3]);
  }

  #[test]
  fn record_less_batch_releases_when_it_reaches_head() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let a = ReplicaId::new("a");
    let mut ledger = CommitLedger::new(1);
    ledger.enqueue(Some(1), vec![recording_callback(1, &log)], true);
    ledger.enqueue(None, vec![recording_callback(2, &log)], false);

    release(&mut ledger);
    assert!(log.lock().is_empty());

    ledger.record_applied(1, &a);
    release(&mut ledger);
    assert_eq!(*log.lock(), vec![1, 2]);
  }

  #[test]
  fn duplicate_notifications_are_idempotent() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let (a, b) = (ReplicaId::new("a"), ReplicaId::new("b"));
    let mut ledger = CommitLedger::new(2);
    ledger.enqueue(Some(1), vec![recording_callback(5, &log)], true);

    assert!(!ledger.record_applied(5, &a));
    assert!(!ledger.record_applied(5, &a));
    release(&mut ledger);
    assert!(log.lock().is_empty());

    assert!(ledger.record_applied(5, &b));
    release(&mut ledger);
    assert!(!ledger.record_applied(5, &b));
    release(&mut ledger);
    assert_eq!(*log.lock(), vec![5]);
    assert_eq!(ledger.tracked_txns(), 0);
  }

  #[test]
  fn empty_callback_lists_are_not_queued() {
    let mut ledger = CommitLedger::new(1);
    ledger.enqueue(Some(1), Vec::new(), true);
    assert!(ledger.is_empty());
    assert!(ledger.blocked_head().is_none());
  }
}
