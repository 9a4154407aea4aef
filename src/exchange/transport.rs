//! The transport capability: unicast send to a peer and a pull-based
//! inbound queue (spec §6).
//!
//! Modeled as a capability trait the same way [`crate::store::BackingStore`]
//! and [`crate::clock::Clock`] are: the coordination core depends only on
//! the trait, never on a concrete transport.

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;

/// A peer's address on the transport, opaque to the coordination core.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub String);

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("unknown peer: {0}")]
    UnknownPeer(PeerId),
    #[error("transport closed")]
    Closed,
}

/// Unicast send plus a pull-based inbound queue, with at-least-once
/// delivery and no ordering guarantee across distinct paths.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send `payload` to `peer`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] if `peer` is unreachable.
    async fn send(&self, peer: &PeerId, payload: Bytes) -> Result<(), TransportError>;

    /// Pull the next inbound `(peer, payload)` pair, or `None` once the
    /// transport has been closed and drained.
    async fn recv(&self) -> Option<(PeerId, Bytes)>;
}

/// An in-process loopback transport connecting a fixed set of peers via
/// `tokio::sync::mpsc` channels, for tests and single-process deployments.
pub struct InMemoryTransport {
    self_id: PeerId,
    peers: parking_lot::RwLock<std::collections::HashMap<PeerId, mpsc::UnboundedSender<(PeerId, Bytes)>>>,
    inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<(PeerId, Bytes)>>,
    inbound_sender: mpsc::UnboundedSender<(PeerId, Bytes)>,
}

impl InMemoryTransport {
    /// Create a transport identified as `self_id` with no peers wired in yet.
    #[must_use]
    pub fn new(self_id: PeerId) -> Self {
        let (inbound_sender, inbound) = mpsc::unbounded_channel();
        Self {
            self_id,
            peers: parking_lot::RwLock::new(std::collections::HashMap::new()),
            inbound: tokio::sync::Mutex::new(inbound),
            inbound_sender,
        }
    }

    #[must_use]
    pub fn self_id(&self) -> &PeerId {
        &self.self_id
    }

    /// Wire `peer`'s inbound channel to this transport so `send(peer, ...)`
    /// is delivered to it directly (loopback; no real network I/O).
    pub fn connect(&self, peer: PeerId, sender: mpsc::UnboundedSender<(PeerId, Bytes)>) {
        self.peers.write().insert(peer, sender);
    }

    /// The sender end of this transport's own inbound queue, handed to
    /// peers via [`InMemoryTransport::connect`].
    #[must_use]
    pub fn inbound_sender(&self) -> mpsc::UnboundedSender<(PeerId, Bytes)> {
        self.inbound_sender.clone()
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn send(&self, peer: &PeerId, payload: Bytes) -> Result<(), TransportError> {
        let sender = self.peers.read().get(peer).cloned();
        match sender {
            Some(sender) => sender
                .send((self.self_id.clone(), payload))
                .map_err(|_| TransportError::UnknownPeer(peer.clone())),
            None => Err(TransportError::UnknownPeer(peer.clone())),
        }
    }

    async fn recv(&self) -> Option<(PeerId, Bytes)> {
        self.inbound.lock().await.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_to_a_connected_peer() {
        let a = InMemoryTransport::new(PeerId("a".into()));
        let b = InMemoryTransport::new(PeerId("b".into()));
        a.connect(b.self_id().clone(), b.inbound_sender());

        a.send(&PeerId("b".into()), Bytes::from_static(b"hello")).await.unwrap();
        let (from, payload) = b.recv().await.unwrap();
        assert_eq!(from, PeerId("a".into()));
        assert_eq!(&payload[..], b"hello");
    }

    #[tokio::test]
    async fn send_to_unknown_peer_errors() {
        let a = InMemoryTransport::new(PeerId("a".into()));
        let result = a.send(&PeerId("ghost".into()), Bytes::from_static(b"x")).await;
        assert!(matches!(result, Err(TransportError::UnknownPeer(_))));
    }
}
