//! Lock wait directory: a purely in-process multimap from `(path, session)`
//! to suspended waiters (spec §4.4).
//!
//! Keyed the same way `event_bus::hub::EventHub` holds its single broadcast
//! channel, except one channel is created lazily per key instead of one
//! global channel for the whole process.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::broadcast::{self, Sender};
use tokio_util::sync::CancellationToken;

use crate::model::path::Path;
use crate::model::session::SessionId;

type Key = (Path, SessionId);

/// Wakes waiters suspended on a `(path, session)` key when a lock they are
/// contending for becomes available.
#[derive(Default)]
pub struct WaitDirectory {
    channels: RwLock<HashMap<Key, Sender<()>>>,
}

impl WaitDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wake every waiter currently suspended on `(path, session)`. A no-op if
    /// nobody is waiting.
    pub fn notify(&self, path: &Path, session: SessionId) {
        let key = (path.clone(), session);
        let sender = self.channels.read().get(&key).cloned();
        if let Some(sender) = sender {
            let _ = sender.send(());
        }
    }

    /// Suspend until either a matching [`WaitDirectory::notify`] arrives or
    /// `cancellation` fires. Returns `true` if woken by a notification.
    pub async fn wait(&self, path: &Path, session: SessionId, cancellation: &CancellationToken) -> bool {
        let key = (path.clone(), session);
        let mut receiver = {
            let mut channels = self.channels.write();
            channels
                .entry(key)
                .or_insert_with(|| broadcast::channel(16).0)
                .subscribe()
        };

        tokio::select! {
            biased;
            () = cancellation.cancelled() => false,
            result = receiver.recv() => result.is_ok(),
        }
    }
}
