//! Replication protocol envelopes and their wire encoding.
//!
//! Every envelope is framed as
//!
//! ```text
//! magic u32 | version u16 | kind u16 | message_id u64 | body_len u32 | body_crc32 u32 | body
//! ```
//!
//! with all integers little-endian. The body layout depends on the kind.

use super::types::{MessageId, RecordBatchId, TxnId};
use crate::error::{ReplicationError, Result};
use byteorder::{LittleEndian, ReadBytesExt};
use std::borrow::Cow;
use std::io::{self, Cursor, Read};
use std::sync::atomic::{AtomicU64, Ordering};

const MESSAGE_MAGIC: u32 = 0x594C_5257; // "WRLY" in little-endian u32
const MESSAGE_VERSION: u16 = 1;
pub const MESSAGE_HEADER_SIZE: usize = std::mem::size_of::<u32>()
  + std::mem::size_of::<u16>()
  + std::mem::size_of::<u16>()
  + std::mem::size_of::<u64>()
  + std::mem::size_of::<u32>()
  + std::mem::size_of::<u32>();
const NO_PAYLOAD: &[u8] = &[];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ReplicationMessageKind {
  RecordsBatch = 1,
  TxnApplied = 2,
  Ack = 3,
}

impl ReplicationMessageKind {
  fn from_u16(value: u16) -> Option<Self> {
    match value {
      1 => Some(Self::RecordsBatch),
      2 => Some(Self::TxnApplied),
      3 => Some(Self::Ack),
      _ => None,
    }
  }
}

/// Fields shared by every envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageMetadata {
  pub message_id: MessageId,
}

impl MessageMetadata {
  pub fn new(message_id: MessageId) -> Self {
    Self { message_id }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicationMessage<'a> {
  /// Primary to replica: one batch of serialized WAL records.
  RecordsBatch {
    metadata: MessageMetadata,
    batch_id: RecordBatchId,
    payload: Cow<'a, [u8]>,
  },
  /// Replica to primary: the transaction has been applied locally.
  TxnApplied {
    metadata: MessageMetadata,
    txn_id: TxnId,
  },
  /// Receipt of the message identified by `acked_message_id`.
  Ack {
    metadata: MessageMetadata,
    acked_message_id: MessageId,
  },
}

impl<'a> ReplicationMessage<'a> {
  pub fn records_batch(
    metadata: MessageMetadata,
    batch_id: RecordBatchId,
    payload: &'a [u8],
  ) -> Self {
    Self::RecordsBatch {
      metadata,
      batch_id,
      payload: Cow::Borrowed(payload),
    }
  }

  pub fn txn_applied(metadata: MessageMetadata, txn_id: TxnId) -> Self {
    Self::TxnApplied { metadata, txn_id }
  }

  pub fn ack(metadata: MessageMetadata, acked_message_id: MessageId) -> Self {
    Self::Ack {
      metadata,
      acked_message_id,
    }
  }

  pub fn kind(&self) -> ReplicationMessageKind {
    match self {
      Self::RecordsBatch { .. } => ReplicationMessageKind::RecordsBatch,
      Self::TxnApplied { .. } => ReplicationMessageKind::TxnApplied,
      Self::Ack { .. } => ReplicationMessageKind::Ack,
    }
  }

  pub fn metadata(&self) -> MessageMetadata {
    match self {
      Self::RecordsBatch { metadata, .. }
      | Self::TxnApplied { metadata, .. }
      | Self::Ack { metadata, .. } => *metadata,
    }
  }

  pub fn message_id(&self) -> MessageId {
    self.metadata().message_id
  }

  pub fn into_owned(self) -> ReplicationMessage<'static> {
    match self {
      Self::RecordsBatch {
        metadata,
        batch_id,
        payload,
      } => ReplicationMessage::RecordsBatch {
        metadata,
        batch_id,
        payload: Cow::Owned(payload.into_owned()),
      },
      Self::TxnApplied { metadata, txn_id } => ReplicationMessage::TxnApplied { metadata, txn_id },
      Self::Ack {
        metadata,
        acked_message_id,
      } => ReplicationMessage::Ack {
        metadata,
        acked_message_id,
      },
    }
  }

  pub fn encode(&self) -> Result<Vec<u8>> {
    let (scalar, payload): (u64, &[u8]) = match self {
      Self::RecordsBatch {
        batch_id, payload, ..
      } => (*batch_id, &payload[..]),
      Self::TxnApplied { txn_id, .. } => (*txn_id, NO_PAYLOAD),
      Self::Ack {
        acked_message_id, ..
      } => (*acked_message_id, NO_PAYLOAD),
    };
    let scalar = scalar.to_le_bytes();
    let body_segments: [&[u8]; 2] = [&scalar, payload];

    let body_len = body_segments[0].len() + body_segments[1].len();
    let body_len_u32 = u32::try_from(body_len).map_err(|_| {
      ReplicationError::InvalidMessage(format!("body length does not fit u32: {body_len}"))
    })?;

    let mut hasher = crc32fast::Hasher::new();
    for segment in body_segments {
      hasher.update(segment);
    }
    let crc32 = hasher.finalize();

    let mut bytes = Vec::with_capacity(MESSAGE_HEADER_SIZE + body_len);
    bytes.extend_from_slice(&MESSAGE_MAGIC.to_le_bytes());
    bytes.extend_from_slice(&MESSAGE_VERSION.to_le_bytes());
    bytes.extend_from_slice(&(self.kind() as u16).to_le_bytes());
    bytes.extend_from_slice(&self.message_id().to_le_bytes());
    bytes.extend_from_slice(&body_len_u32.to_le_bytes());
    bytes.extend_from_slice(&crc32.to_le_bytes());
    for segment in body_segments {
      bytes.extend_from_slice(segment);
    }
    Ok(bytes)
  }
}

impl ReplicationMessage<'static> {
  pub fn decode(bytes: &[u8]) -> Result<Self> {
    let mut reader = Cursor::new(bytes);

    let magic = read_u32_checked(&mut reader, "magic")?;
    if magic != MESSAGE_MAGIC {
      return Err(ReplicationError::InvalidMessage(format!(
        "invalid replication message magic: 0x{magic:08X}"
      )));
    }

    let version = read_u16_checked(&mut reader, "version")?;
    if version != MESSAGE_VERSION {
      return Err(ReplicationError::VersionMismatch {
        required: version as u32,
        current: MESSAGE_VERSION as u32,
      });
    }

    let raw_kind = read_u16_checked(&mut reader, "kind")?;
    let kind = ReplicationMessageKind::from_u16(raw_kind).ok_or_else(|| {
      ReplicationError::InvalidMessage(format!("unknown replication message kind: {raw_kind}"))
    })?;
    let metadata = MessageMetadata::new(read_u64_checked(&mut reader, "message_id")?);
    let body_len = read_u32_checked(&mut reader, "body_len")? as usize;
    let stored_crc32 = read_u32_checked(&mut reader, "body_crc32")?;

    let available = bytes.len() - reader.position() as usize;
    if body_len > available {
      return Err(ReplicationError::InvalidMessage(format!(
        "truncated replication message: body_len {body_len}, {available} bytes available"
      )));
    }

    let mut body = vec![0; body_len];
    reader
      .read_exact(&mut body)
      .map_err(|error| map_unexpected_eof(error, "body"))?;
    if reader.position() as usize != bytes.len() {
      return Err(ReplicationError::InvalidMessage(format!(
        "trailing bytes after message body: {}",
        bytes.len() - reader.position() as usize
      )));
    }

    let computed_crc32 = crc32fast::hash(&body);
    if computed_crc32 != stored_crc32 {
      return Err(ReplicationError::CrcMismatch {
        stored: stored_crc32,
        computed: computed_crc32,
      });
    }

    let mut body_reader = Cursor::new(body.as_slice());
    let scalar = read_u64_checked(&mut body_reader, "body scalar")?;
    let consumed = body_reader.position() as usize;

    match kind {
      ReplicationMessageKind::RecordsBatch => Ok(Self::RecordsBatch {
        metadata,
        batch_id: scalar,
        payload: Cow::Owned(body[consumed..].to_vec()),
      }),
      ReplicationMessageKind::TxnApplied | ReplicationMessageKind::Ack => {
        if consumed != body.len() {
          return Err(ReplicationError::InvalidMessage(format!(
            "{kind:?} body must be 8 bytes, got {}",
            body.len()
          )));
        }
        if kind == ReplicationMessageKind::TxnApplied {
          Ok(Self::TxnApplied {
            metadata,
            txn_id: scalar,
          })
        } else {
          Ok(Self::Ack {
            metadata,
            acked_message_id: scalar,
          })
        }
      }
    }
  }
}

/// Hands out strictly increasing message ids, starting at 1.
#[derive(Debug)]
pub struct MessageIdGenerator {
  next: AtomicU64,
}

impl MessageIdGenerator {
  pub fn new() -> Self {
    Self::starting_at(1)
  }

  pub fn starting_at(first: MessageId) -> Self {
    Self {
      next: AtomicU64::new(first),
    }
  }

  pub fn next_id(&self) -> MessageId {
    let id = self.next.fetch_add(1, Ordering::AcqRel);
    assert!(id != MessageId::MAX, "message id space exhausted");
    id
  }

  /// Last id handed out, or `None` before the first call to `next_id`.
  pub fn last_issued(&self) -> Option<MessageId> {
    self.next.load(Ordering::Acquire).checked_sub(1).filter(|id| *id > 0)
  }

  pub fn next_metadata(&self) -> MessageMetadata {
    MessageMetadata::new(self.next_id())
  }
}

impl Default for MessageIdGenerator {
  fn default() -> Self {
    Self::new()
  }
}

fn read_u16_checked(reader: &mut impl Read, field: &'static str) -> Result<u16> {
  reader
    .read_u16::<LittleEndian>()
    .map_err(|error| map_unexpected_eof(error, field))
}

fn read_u32_checked(reader: &mut impl Read, field: &'static str) -> Result<u32> {
  reader
    .read_u32::<LittleEndian>()
    .map_err(|error| map_unexpected_eof(error, field))
}

fn read_u64_checked(reader: &mut impl Read, field: &'static str) -> Result<u64> {
  reader
    .read_u64::<LittleEndian>()
    .map_err(|error| map_unexpected_eof(error, field))
}

fn map_unexpected_eof(error: io::Error, field: &'static str) -> ReplicationError {
  if error.kind() == io::ErrorKind::UnexpectedEof {
    ReplicationError::InvalidMessage(format!(
      "truncated replication message while reading {field}"
    ))
  } else {
    ReplicationError::Io(error)
  }
}
