//! Replication identifiers, policies and commit callbacks.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ReplicationError;

/// Identifier of a shipped record batch.
pub type RecordBatchId = u64;

/// Identifier of a protocol message, unique per sender.
pub type MessageId = u64;

/// Transaction start timestamp; identifies one in-flight commit.
pub type TxnId = u64;

/// Reserved batch id meaning "no batch". Never assigned.
pub const INVALID_RECORD_BATCH_ID: RecordBatchId = u64::MAX;

/// Identity of a replica on the messaging transport.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReplicaId(String);

impl ReplicaId {
  pub fn new(identity: impl Into<String>) -> Self {
    Self(identity.into())
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for ReplicaId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

impl From<&str> for ReplicaId {
  fn from(value: &str) -> Self {
    Self::new(value)
  }
}

impl From<String> for ReplicaId {
  fn from(value: String) -> Self {
    Self(value)
  }
}

/// Per-transaction replication policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplicationPolicy {
  /// No replicas are configured.
  #[default]
  Disable,
  /// Acknowledge the commit without waiting for replicas.
  Async,
  /// Acknowledge the commit once every replica applied it.
  Sync,
}

impl fmt::Display for ReplicationPolicy {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      ReplicationPolicy::Disable => write!(f, "disable"),
      ReplicationPolicy::Async => write!(f, "async"),
      ReplicationPolicy::Sync => write!(f, "sync"),
    }
  }
}

impl FromStr for ReplicationPolicy {
  type Err = ReplicationError;

  fn from_str(value: &str) -> Result<Self, Self::Err> {
    match value.trim().to_ascii_lowercase().as_str() {
      "disable" | "disabled" => Ok(ReplicationPolicy::Disable),
      "async" => Ok(ReplicationPolicy::Async),
      "sync" => Ok(ReplicationPolicy::Sync),
      other => Err(ReplicationError::InvalidConfig(format!(
        "unknown replication policy: {other}"
      ))),
    }
  }
}

/// Notifies a committing client that its transaction is durable under the
/// active policy. Consumed on invocation, so it can only ever fire once.
pub struct CommitCallback {
  txn_id: TxnId,
  callback: Box<dyn FnOnce() + Send + 'static>,
}

impl CommitCallback {
  pub fn new<F>(txn_id: TxnId, callback: F) -> Self
  where
    F: FnOnce() + Send + 'static,
  {
    Self {
      txn_id,
      callback: Box::new(callback),
    }
  }

  pub fn txn_id(&self) -> TxnId {
    self.txn_id
  }

  pub fn invoke(self) {
    (self.callback)()
  }
}

impl fmt::Debug for CommitCallback {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CommitCallback")
      .field("txn_id", &self.txn_id)
      .finish_non_exhaustive()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::sync::Arc;

  #[test]
  fn policy_parses_case_insensitively() {
    assert_eq!(
      "SYNC".parse::<ReplicationPolicy>().expect("parse"),
      ReplicationPolicy::Sync
    );
    assert_eq!(
      " async ".parse::<ReplicationPolicy>().expect("parse"),
      ReplicationPolicy::Async
    );
    assert!("quorum".parse::<ReplicationPolicy>().is_err());
  }

  #[test]
  fn callback_runs_its_closure() {
    let fired = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&fired);
    let callback = CommitCallback::new(42, move || {
      counter.fetch_add(1, Ordering::SeqCst);
    });
    assert_eq!(callback.txn_id(), 42);
    callback.invoke();
    assert_eq!(fired.load(Ordering::SeqCst), 1);
  }
}
