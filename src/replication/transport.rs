//! Messaging transport seam and an in-process channel implementation.

use super::types::ReplicaId;
use crate::error::{ReplicationError, Result};
use crossbeam_channel::{Receiver, Sender};
use hashbrown::HashMap;
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Invoked with the sender identity and raw payload when the transport itself
/// produces a reply to a sent message.
pub type ReplyHandler = Arc<dyn Fn(&ReplicaId, &[u8]) + Send + Sync>;

/// Reply handler that does nothing.
pub fn noop_reply_handler() -> ReplyHandler {
  Arc::new(|_, _| {})
}

/// Callbacks the remote end can run on receipt without a round trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuiltinCallback {
  Noop,
  Echo,
}

/// Delivers opaque payloads between named endpoints.
///
/// Delivery is best effort: a message that arrives is intact and attributed
/// to its sender, nothing more.
pub trait Messenger: Send + Sync {
  fn send(
    &self,
    destination: &ReplicaId,
    envelope: &[u8],
    reply: ReplyHandler,
    remote_callback: BuiltinCallback,
    one_way: bool,
  ) -> Result<()>;
}

/// A payload as seen by the receiving endpoint.
#[derive(Clone)]
pub struct Delivery {
  pub from: ReplicaId,
  pub payload: Vec<u8>,
  pub remote_callback: BuiltinCallback,
  reply: Option<ReplyHandler>,
}

impl Delivery {
  /// Run the sender's reply handler, if the message expected one.
  pub fn reply(&self, responder: &ReplicaId, payload: &[u8]) {
    if let Some(reply) = self.reply.as_ref() {
      reply(responder, payload);
    }
  }
}

impl fmt::Debug for Delivery {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Delivery")
      .field("from", &self.from)
      .field("payload_len", &self.payload.len())
      .field("remote_callback", &self.remote_callback)
      .field("expects_reply", &self.reply.is_some())
      .finish()
  }
}

/// In-process network of named endpoints backed by unbounded channels.
#[derive(Clone, Default)]
pub struct ChannelNetwork {
  endpoints: Arc<RwLock<HashMap<ReplicaId, Sender<Delivery>>>>,
}

impl ChannelNetwork {
  pub fn new() -> Self {
    Self::default()
  }

  /// Register `identity` and return its transport handle and inbox.
  pub fn connect(&self, identity: impl Into<ReplicaId>) -> Result<(ChannelTransport, Inbox)> {
    let identity = identity.into();
    let (sender, receiver) = crossbeam_channel::unbounded();
    {
      let mut endpoints = self.endpoints.write();
      if endpoints.contains_key(&identity) {
        return Err(ReplicationError::Transport(format!(
          "endpoint already registered: {identity}"
        )));
      }
      endpoints.insert(identity.clone(), sender);
    }

    Ok((
      ChannelTransport {
        identity: identity.clone(),
        network: self.clone(),
      },
      Inbox { identity, receiver },
    ))
  }

  /// Remove an endpoint. Later sends to it fail.
  pub fn disconnect(&self, identity: &ReplicaId) -> bool {
    self.endpoints.write().remove(identity).is_some()
  }
}

/// One endpoint's sending half.
#[derive(Clone)]
pub struct ChannelTransport {
  identity: ReplicaId,
  network: ChannelNetwork,
}

impl ChannelTransport {
  pub fn identity(&self) -> &ReplicaId {
    &self.identity
  }
}

impl Messenger for ChannelTransport {
  fn send(
    &self,
    destination: &ReplicaId,
    envelope: &[u8],
    reply: ReplyHandler,
    remote_callback: BuiltinCallback,
    one_way: bool,
  ) -> Result<()> {
    let sender = self
      .network
      .endpoints
      .read()
      .get(destination)
      .cloned()
      .ok_or_else(|| {
        ReplicationError::Transport(format!("no endpoint registered for {destination}"))
      })?;

    let delivery = Delivery {
      from: self.identity.clone(),
      payload: envelope.to_vec(),
      remote_callback,
      reply: (!one_way).then_some(reply),
    };
    sender
      .send(delivery)
      .map_err(|_| ReplicationError::Transport(format!("endpoint {destination} is closed")))
  }
}

/// One endpoint's receiving half.
pub struct Inbox {
  identity: ReplicaId,
  receiver: Receiver<Delivery>,
}

impl Inbox {
  pub fn identity(&self) -> &ReplicaId {
    &self.identity
  }

  pub fn try_recv(&self) -> Option<Delivery> {
    self.receiver.try_recv().ok()
  }

  pub fn recv_timeout(&self, timeout: Duration) -> Option<Delivery> {
    self.receiver.recv_timeout(timeout).ok()
  }

  pub fn drain(&self) -> Vec<Delivery> {
    self.receiver.try_iter().collect()
  }

  pub fn len(&self) -> usize {
    self.receiver.len()
  }

  pub fn is_empty(&self) -> bool {
    self.receiver.is_empty()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicUsize, Ordering};

  #[test]
  fn delivers_payload_with_sender_identity() {
    let network = ChannelNetwork::new();
    let (primary, _primary_inbox) = network.connect("primary").expect("connect");
    let (_replica, replica_inbox) = network.connect("replica-1").expect("connect");

    primary
      .send(
        &ReplicaId::new("replica-1"),
        b"hello",
        noop_reply_handler(),
        BuiltinCallback::Noop,
        true,
      )
      .expect("send");

    let delivery = replica_inbox.try_recv().expect("delivery");
    assert_eq!(delivery.from, ReplicaId::new("primary"));
    assert_eq!(delivery.payload, b"hello");
    assert!(replica_inbox.is_empty());
  }

  #[test]
  fn reply_handler_only_kept_for_two_way_sends() {
    let network = ChannelNetwork::new();
    let (primary, _) = network.connect("primary").expect("connect");
    let (_, inbox) = network.connect("replica-1").expect("connect");
    let replies = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&replies);
    let handler: ReplyHandler = Arc::new(move |_, _| {
      counter.fetch_add(1, Ordering::SeqCst);
    });
    let destination = ReplicaId::new("replica-1");

    primary
      .send(&destination, b"a", handler.clone(), BuiltinCallback::Echo, false)
      .expect("send");
    primary
      .send(&destination, b"b", handler, BuiltinCallback::Noop, true)
      .expect("send");

    for delivery in inbox.drain() {
      delivery.reply(&destination, b"pong");
    }
    assert_eq!(replies.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn unknown_destination_fails() {
    let network = ChannelNetwork::new();
    let (primary, _) = network.connect("primary").expect("connect");
    let err = primary
      .send(
        &ReplicaId::new("ghost"),
        b"x",
        noop_reply_handler(),
        BuiltinCallback::Noop,
        true,
      )
      .expect_err("send should fail");
    assert!(matches!(err, ReplicationError::Transport(_)));
  }

  #[test]
  fn duplicate_identity_is_rejected() {
    let network = ChannelNetwork::new();
    let _first = network.connect("replica-1").expect("connect");
    assert!(network.connect("replica-1").is_err());
    assert!(network.disconnect(&ReplicaId::new("replica-1")));
    assert!(network.connect("replica-1").is_ok());
  }
}
