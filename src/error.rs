//! Error types for the replication core

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReplicationError {
  #[error("I/O error: {0}")]
  Io(#[from] std::io::Error),

  #[error("serialization error: {0}")]
  Serialization(String),

  #[error("invalid replication message: {0}")]
  InvalidMessage(String),

  #[error("CRC mismatch: stored 0x{stored:08X}, computed 0x{computed:08X}")]
  CrcMismatch { stored: u32, computed: u32 },

  #[error("message version mismatch: required {required}, current {current}")]
  VersionMismatch { required: u32, current: u32 },

  #[error("unknown replica: {0}")]
  UnknownReplica(String),

  #[error("invalid replication config: {0}")]
  InvalidConfig(String),

  #[error("transport error: {0}")]
  Transport(String),
}

pub type Result<T> = std::result::Result<T, ReplicationError>;
