//! Wait manager: composes the session manager and wait directory to
//! suspend until a lock condition on a path becomes true (spec §4.8).

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::error::{CoordinationError, Result};
use crate::model::entry::StoredEntry;
use crate::model::path::Path;
use crate::model::session::SessionId;
use crate::session::SessionManager;
use crate::store::BackingStore;
use crate::wait::WaitDirectory;

/// Composes [`SessionManager`] and [`WaitDirectory`] into the two suspend
/// conditions the lock manager needs: waiting for a write-lock to clear and
/// waiting for every read-lock to clear.
pub struct WaitManager {
    store: Arc<dyn BackingStore>,
    session_manager: Arc<SessionManager>,
    wait_directory: Arc<WaitDirectory>,
    poll_interval: Duration,
}

impl WaitManager {
    #[must_use]
    pub fn new(
        store: Arc<dyn BackingStore>,
        session_manager: Arc<SessionManager>,
        wait_directory: Arc<WaitDirectory>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            store,
            session_manager,
            wait_directory,
            poll_interval,
        }
    }

    /// Suspend until `path`'s write-lock clears, or is held by `self_session`
    /// with `allow_write_lock_by_self` set, or a dead holder is discovered.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinationError::Cancelled`] if `cancellation` fires first,
    /// or [`CoordinationError::StoreFailure`] if the backing store cannot be
    /// read.
    #[instrument(skip(self, cancellation), err)]
    pub async fn wait_for_write_lock_release(
        &self,
        path: &Path,
        self_session: SessionId,
        allow_write_lock_by_self: bool,
        cancellation: &CancellationToken,
    ) -> Result<()> {
        loop {
            if cancellation.is_cancelled() {
                return Err(CoordinationError::Cancelled);
            }
            let entry = self.fetch(path).await?;
            match entry.write_lock {
                None => return Ok(()),
                Some(holder) if holder == self_session && allow_write_lock_by_self => return Ok(()),
                Some(holder) => {
                    if !self.holder_is_alive(holder).await? {
                        return Ok(());
                    }
                    self.sleep_until_signal_or_poll(path, holder, cancellation).await;
                }
            }
        }
    }

    /// Suspend until `path`'s `read_locks` set is empty, or every holder is
    /// discovered dead.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinationError::Cancelled`] if `cancellation` fires first,
    /// or [`CoordinationError::StoreFailure`] if the backing store cannot be
    /// read.
    #[instrument(skip(self, cancellation), err)]
    pub async fn wait_for_read_locks_release(&self, path: &Path, cancellation: &CancellationToken) -> Result<()> {
        loop {
            if cancellation.is_cancelled() {
                return Err(CoordinationError::Cancelled);
            }
            let entry = self.fetch(path).await?;
            if entry.read_locks.is_empty() {
                return Ok(());
            }
            let Some(&holder) = entry.read_locks.iter().next() else {
                return Ok(());
            };
            if !self.holder_is_alive(holder).await? {
                return Ok(());
            }
            self.sleep_until_signal_or_poll(path, holder, cancellation).await;
        }
    }

    async fn fetch(&self, path: &Path) -> Result<StoredEntry> {
        self.store
            .get_entry(path)
            .await
            .map_err(|e| CoordinationError::StoreFailure {
                message: e.to_string(),
                attempts: 1,
            })?
            .ok_or_else(|| CoordinationError::EntryNotFound { path: path.clone() })
    }

    async fn holder_is_alive(&self, holder: SessionId) -> Result<bool> {
        self.session_manager.is_alive(holder).await
    }

    async fn sleep_until_signal_or_poll(&self, path: &Path, holder: SessionId, cancellation: &CancellationToken) {
        tokio::select! {
            biased;
            () = cancellation.cancelled() => {}
            _ = self.wait_directory.wait(path, holder, cancellation) => {}
            () = tokio::time::sleep(self.poll_interval) => {}
        }
    }
}
