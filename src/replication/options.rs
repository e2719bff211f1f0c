//! Primary replication configuration.

use super::types::ReplicaId;
use crate::error::{ReplicationError, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

const DEFAULT_NETWORK_IDENTITY: &str = "primary";
const DEFAULT_STALL_WARNING_AFTER: Duration = Duration::from_secs(5);

/// Where a replica can be reached. Only the identity matters to the
/// replication core; the address is carried for the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaEndpoint {
  pub identity: ReplicaId,
  #[serde(default)]
  pub hostname: Option<String>,
  #[serde(default)]
  pub port: Option<u16>,
}

impl ReplicaEndpoint {
  pub fn new(identity: impl Into<ReplicaId>) -> Self {
    Self {
      identity: identity.into(),
      hostname: None,
      port: None,
    }
  }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct HostsFile {
  #[serde(default)]
  replicas: Vec<ReplicaEndpoint>,
}

/// Options for [`PrimaryReplicationManager`](super::primary::PrimaryReplicationManager).
#[derive(Debug, Clone)]
pub struct PrimaryReplicationOptions {
  /// This node's identity on the messaging transport
  pub network_identity: String,
  /// Fixed replica set, in configuration order
  pub replicas: IndexMap<ReplicaId, ReplicaEndpoint>,
  /// Age after which a blocked SYNC batch is reported as stalled (None = never)
  pub stall_warning_after: Option<Duration>,
}

impl Default for PrimaryReplicationOptions {
  fn default() -> Self {
    Self {
      network_identity: DEFAULT_NETWORK_IDENTITY.to_string(),
      replicas: IndexMap::new(),
      stall_warning_after: Some(DEFAULT_STALL_WARNING_AFTER),
    }
  }
}

impl PrimaryReplicationOptions {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn network_identity(mut self, identity: impl Into<String>) -> Self {
    self.network_identity = identity.into();
    self
  }

  /// Add a replica by identity
  pub fn replica(self, identity: impl Into<ReplicaId>) -> Self {
    self.replica_endpoint(ReplicaEndpoint::new(identity))
  }

  pub fn replicas<I, R>(mut self, identities: I) -> Self
  where
    I: IntoIterator<Item = R>,
    R: Into<ReplicaId>,
  {
    for identity in identities {
      self = self.replica(identity);
    }
    self
  }

  pub fn replica_endpoint(mut self, endpoint: ReplicaEndpoint) -> Self {
    self.replicas.insert(endpoint.identity.clone(), endpoint);
    self
  }

  pub fn stall_warning_after(mut self, threshold: Option<Duration>) -> Self {
    self.stall_warning_after = threshold;
    self
  }

  /// Add every replica listed in a JSON hosts file:
  ///
  /// ```json
  /// {"replicas": [{"identity": "replica1", "hostname": "10.0.0.2", "port": 15445}]}
  /// ```
  ///
  /// The entry naming this node itself is skipped so one file can be shared
  /// across the whole cluster.
  pub fn hosts_file<P: AsRef<Path>>(mut self, path: P) -> Result<Self> {
    let path = path.as_ref();
    let bytes = std::fs::read(path)?;
    let hosts: HostsFile = serde_json::from_slice(&bytes).map_err(|error| {
      ReplicationError::Serialization(format!(
        "decode replication hosts file {} failed: {error}",
        path.display()
      ))
    })?;

    for endpoint in hosts.replicas {
      if endpoint.identity.as_str() == self.network_identity {
        continue;
      }
      if self.replicas.contains_key(&endpoint.identity) {
        return Err(ReplicationError::InvalidConfig(format!(
          "duplicate replica identity in hosts file: {}",
          endpoint.identity
        )));
      }
      self = self.replica_endpoint(endpoint);
    }
    Ok(self)
  }

  pub fn validate(&self) -> Result<()> {
    if self.network_identity.trim().is_empty() {
      return Err(ReplicationError::InvalidConfig(
        "network identity must not be empty".to_string(),
      ));
    }
    if self.replicas.is_empty() {
      return Err(ReplicationError::InvalidConfig(
        "primary replication requires at least one replica".to_string(),
      ));
    }
    for identity in self.replicas.keys() {
      if identity.as_str().trim().is_empty() {
        return Err(ReplicationError::InvalidConfig(
          "replica identity must not be empty".to_string(),
        ));
      }
      if identity.as_str() == self.network_identity {
        return Err(ReplicationError::InvalidConfig(format!(
          "replica identity collides with primary identity: {identity}"
        )));
      }
    }
    Ok(())
  }
}
