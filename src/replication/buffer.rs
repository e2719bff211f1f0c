//! Serialized WAL record batches and the pool they are recycled through.

use crossbeam_channel::{Receiver, Sender};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

/// Default number of consumers that serialize a buffer: the disk log writer
/// and the replication manager.
pub const DEFAULT_BUFFER_CONSUMERS: u8 = 2;

/// A span of already-serialized WAL records.
///
/// The buffer is shared by every consumer that has to serialize it. Each
/// consumer calls [`LogBuffer::mark_serialized`] once it is done; the call
/// that observes the last outstanding consumer owns recycling the buffer.
#[derive(Debug)]
pub struct LogBuffer {
  bytes: Vec<u8>,
  consumers: u8,
  remaining: AtomicU8,
}

impl LogBuffer {
  pub fn new() -> Self {
    Self::with_consumers(DEFAULT_BUFFER_CONSUMERS)
  }

  pub fn with_consumers(consumers: u8) -> Self {
    let consumers = consumers.max(1);
    Self {
      bytes: Vec::new(),
      consumers,
      remaining: AtomicU8::new(consumers),
    }
  }

  pub fn from_bytes(bytes: Vec<u8>, consumers: u8) -> Self {
    let mut buffer = Self::with_consumers(consumers);
    buffer.bytes = bytes;
    buffer
  }

  pub fn append(&mut self, records: &[u8]) {
    self.bytes.extend_from_slice(records);
  }

  pub fn as_bytes(&self) -> &[u8] {
    &self.bytes
  }

  pub fn len(&self) -> usize {
    self.bytes.len()
  }

  pub fn is_empty(&self) -> bool {
    self.bytes.is_empty()
  }

  /// Record that one consumer finished serializing this buffer. Returns
  /// `true` exactly once, for the last consumer.
  pub fn mark_serialized(&self) -> bool {
    let previous = self
      .remaining
      .fetch_update(Ordering::AcqRel, Ordering::Acquire, |remaining| {
        remaining.checked_sub(1)
      });
    matches!(previous, Ok(1))
  }

  pub fn is_fully_serialized(&self) -> bool {
    self.remaining.load(Ordering::Acquire) == 0
  }

  fn reset(&mut self) {
    self.bytes.clear();
    *self.remaining.get_mut() = self.consumers;
  }
}

impl Default for LogBuffer {
  fn default() -> Self {
    Self::new()
  }
}

/// Bounded pool of empty log buffers. Cloning yields another handle to the
/// same pool.
#[derive(Debug, Clone)]
pub struct BufferPool {
  sender: Sender<Arc<LogBuffer>>,
  receiver: Receiver<Arc<LogBuffer>>,
  consumers: u8,
}

impl BufferPool {
  pub fn new(capacity: usize) -> Self {
    Self::with_consumers(capacity, DEFAULT_BUFFER_CONSUMERS)
  }

  pub fn with_consumers(capacity: usize, consumers: u8) -> Self {
    let (sender, receiver) = crossbeam_channel::bounded(capacity.max(1));
    Self {
      sender,
      receiver,
      consumers,
    }
  }

  /// Take a recycled buffer, or allocate one if the pool is empty or every
  /// pooled buffer is still referenced elsewhere.
  pub fn acquire(&self) -> LogBuffer {
    while let Ok(pooled) = self.receiver.try_recv() {
      if let Ok(mut buffer) = Arc::try_unwrap(pooled) {
        buffer.reset();
        return buffer;
      }
    }
    LogBuffer::with_consumers(self.consumers)
  }

  /// Return a buffer to the pool. Dropped when the pool is full.
  pub fn recycle(&self, buffer: Arc<LogBuffer>) -> bool {
    self.sender.try_send(buffer).is_ok()
  }

  pub fn len(&self) -> usize {
    self.receiver.len()
  }

  pub fn is_empty(&self) -> bool {
    self.receiver.is_empty()
  }
}
