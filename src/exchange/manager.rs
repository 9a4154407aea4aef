//! Exchange manager: the inbound endpoint routing exchange messages to the
//! wait directory and invalidation directory by kind (spec §4.6).

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::instrument;

use crate::model::path::Path;
use crate::model::session::SessionId;
use crate::wait::WaitDirectory;

use super::message::ExchangeMessage;
use super::transport::{PeerId, Transport, TransportError};

/// Local callback invoked for an inbound `InvalidateCacheEntry` directed at
/// this node; wired to [`crate::invalidation::InvalidationDirectory::invoke`]
/// by [`crate::coordination::CoordinationService`].
#[async_trait::async_trait]
pub trait InvalidationSink: Send + Sync {
    async fn invalidate(&self, path: &Path, session: SessionId);
}

/// Owns the one inbound endpoint for exchange messages; dispatch happens by
/// message kind (spec §4.6).
pub struct ExchangeManager {
    transport: Arc<dyn Transport>,
    wait_directory: Arc<WaitDirectory>,
}

impl ExchangeManager {
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, wait_directory: Arc<WaitDirectory>) -> Self {
        Self {
            transport,
            wait_directory,
        }
    }

    /// Broadcast that the read-lock held by `released_by` on `path` was
    /// released, to every peer in `peers`.
    ///
    /// # Errors
    ///
    /// Returns the first [`TransportError`] encountered; sends to other
    /// peers are still attempted (message delivery is at-least-once, not
    /// all-or-nothing).
    #[instrument(skip(self, peers), err)]
    pub async fn broadcast_read_lock_released(
        &self,
        path: &Path,
        released_by: SessionId,
        peers: &[PeerId],
    ) -> Result<(), TransportError> {
        self.broadcast(
            ExchangeMessage::ReadLockReleased {
                path: path.clone(),
                released_by,
            },
            peers,
        )
        .await
    }

    /// Broadcast that the write-lock held by `released_by` on `path` was
    /// released, to every peer in `peers`.
    #[instrument(skip(self, peers), err)]
    pub async fn broadcast_write_lock_released(
        &self,
        path: &Path,
        released_by: SessionId,
        peers: &[PeerId],
    ) -> Result<(), TransportError> {
        self.broadcast(
            ExchangeMessage::WriteLockReleased {
                path: path.clone(),
                released_by,
            },
            peers,
        )
        .await
    }

    /// Send `InvalidateCacheEntry(path, session)` directly to `peer`.
    #[instrument(skip(self), err)]
    pub async fn send_invalidate(&self, peer: &PeerId, path: &Path, session: SessionId) -> Result<(), TransportError> {
        self.transport
            .send(
                peer,
                ExchangeMessage::InvalidateCacheEntry {
                    path: path.clone(),
                    session,
                }
                .encode(),
            )
            .await
    }

    async fn broadcast(&self, message: ExchangeMessage, peers: &[PeerId]) -> Result<(), TransportError> {
        let payload = message.encode();
        let mut first_error = None;
        for peer in peers {
            if let Err(err) = self.transport.send(peer, payload.clone()).await {
                tracing::warn!(target: "pathkeeper::exchange", %peer, %err, "exchange broadcast delivery failed");
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Spawn the inbound dispatch loop. Runs until the transport's inbound
    /// queue closes. Decode failures are logged and skipped (duplicates and
    /// malformed records never crash the loop; delivery is at-least-once).
    pub fn spawn_dispatch_loop(self: Arc<Self>, sink: Arc<dyn InvalidationSink>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let Some((_peer, payload)) = self.transport.recv().await else {
                    return;
                };
                match ExchangeMessage::decode(payload) {
                    Ok(ExchangeMessage::ReadLockReleased { path, released_by }) => {
                        self.wait_directory.notify(&path, released_by);
                    }
                    Ok(ExchangeMessage::WriteLockReleased { path, released_by }) => {
                        self.wait_directory.notify(&path, released_by);
                    }
                    Ok(ExchangeMessage::InvalidateCacheEntry { path, session }) => {
                        sink.invalidate(&path, session).await;
                    }
                    Err(err) => {
                        tracing::warn!(target: "pathkeeper::exchange", %err, "dropping malformed exchange message");
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::transport::InMemoryTransport;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSink(Arc<AtomicUsize>);

    #[async_trait::async_trait]
    impl InvalidationSink for CountingSink {
        async fn invalidate(&self, _path: &Path, _session: SessionId) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[tokio::test]
    async fn dispatch_loop_routes_invalidate_to_sink() {
        let node_a = Arc::new(InMemoryTransport::new(PeerId("a".into())));
        let node_b = Arc::new(InMemoryTransport::new(PeerId("b".into())));
        node_a.connect(node_b.self_id().clone(), node_b.inbound_sender());

        let manager = Arc::new(ExchangeManager::new(Arc::clone(&node_a), Arc::new(WaitDirectory::new())));
        let count = Arc::new(AtomicUsize::new(0));
        let receiver_manager = Arc::new(ExchangeManager::new(Arc::clone(&node_b), Arc::new(WaitDirectory::new())));
        let handle = receiver_manager.spawn_dispatch_loop(Arc::new(CountingSink(Arc::clone(&count))));

        manager
            .send_invalidate(&PeerId("b".into()), &Path::root(), SessionId::new())
            .await
            .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(count.load(Ordering::Relaxed), 1);
        handle.abort();
    }

    #[tokio::test]
    async fn dispatch_loop_routes_release_to_wait_directory() {
        let node_a = Arc::new(InMemoryTransport::new(PeerId("a".into())));
        let node_b = Arc::new(InMemoryTransport::new(PeerId("b".into())));
        node_a.connect(node_b.self_id().clone(), node_b.inbound_sender());

        let wait_directory = Arc::new(WaitDirectory::new());
        let sender_manager = Arc::new(ExchangeManager::new(Arc::clone(&node_a), Arc::clone(&wait_directory)));
        let receiver_manager = Arc::new(ExchangeManager::new(Arc::clone(&node_b), Arc::clone(&wait_directory)));
        let count = Arc::new(AtomicUsize::new(0));
        let handle = receiver_manager.spawn_dispatch_loop(Arc::new(CountingSink(Arc::clone(&count))));

        let session = SessionId::new();
        let path = Path::root();
        let cancellation = tokio_util::sync::CancellationToken::new();
        let waiter_directory = Arc::clone(&wait_directory);
        let waiter_path = path.clone();
        let waiter = tokio::spawn(async move { waiter_directory.wait(&waiter_path, session, &cancellation).await });

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        sender_manager
            .broadcast_write_lock_released(&path, session, &[PeerId("b".into())])
            .await
            .unwrap();

        assert!(waiter.await.unwrap());
        handle.abort();
    }
}
