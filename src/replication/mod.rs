//! Primary-side replication: batch shipping and commit acknowledgement.

pub mod buffer;
pub mod ledger;
pub mod messages;
pub mod options;
pub mod primary;
pub mod transport;
pub mod types;

pub use buffer::{BufferPool, LogBuffer};
pub use ledger::CommitLedger;
pub use messages::{MessageIdGenerator, MessageMetadata, ReplicationMessage, ReplicationMessageKind};
pub use options::{PrimaryReplicationOptions, ReplicaEndpoint};
pub use primary::{PrimaryReplicationManager, PrimaryReplicationStatus, StalledBatch};
pub use transport::{
  noop_reply_handler, BuiltinCallback, ChannelNetwork, ChannelTransport, Delivery, Inbox,
  Messenger, ReplyHandler,
};
pub use types::{
  CommitCallback, MessageId, RecordBatchId, ReplicaId, ReplicationPolicy, TxnId,
  INVALID_RECORD_BATCH_ID,
};
