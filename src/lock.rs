//! Lock manager: write/read-lock acquisition and release over a single
//! entry, with local in-process exclusion, CAS-based announcement against
//! the backing store, and reader draining via invalidation (spec §4.7).

use std::collections::HashMap;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::config::CoordinationConfig;
use crate::error::{CoordinationError, Result};
use crate::exchange::{ExchangeManager, PeerId};
use crate::invalidation::InvalidationDirectory;
use crate::model::entry::StoredEntry;
use crate::model::path::Path;
use crate::model::session::SessionId;
use crate::session::SessionManager;
use crate::store::{BackingStore, CasOutcome};
use crate::telemetry::{trace_lifecycle_event, LifecycleEvent};
use crate::wait::WaitDirectory;
use crate::waitmgr::WaitManager;

/// Known remote peers to fan the release/invalidation broadcasts out to.
/// Empty in a single-node deployment; messages are idempotent so
/// over-broadcasting to a stale peer list is harmless (spec §4.6).
#[derive(Default)]
pub struct PeerBroadcast {
    pub exchange: Option<Arc<ExchangeManager>>,
    pub peers: Vec<PeerId>,
}

/// Acquires and releases read/write locks on entries (spec §4.7).
pub struct LockManager {
    store: Arc<dyn BackingStore>,
    session_manager: Arc<SessionManager>,
    wait_manager: Arc<WaitManager>,
    wait_directory: Arc<WaitDirectory>,
    invalidation_directory: Arc<InvalidationDirectory>,
    broadcast: PeerBroadcast,
    config: CoordinationConfig,
    local_intents: parking_lot::RwLock<FxHashMap<Path, SessionId>>,
    local_notify: parking_lot::RwLock<FxHashMap<Path, Arc<Notify>>>,
}

impl LockManager {
    #[must_use]
    pub fn new(
        store: Arc<dyn BackingStore>,
        session_manager: Arc<SessionManager>,
        wait_manager: Arc<WaitManager>,
        wait_directory: Arc<WaitDirectory>,
        invalidation_directory: Arc<InvalidationDirectory>,
        broadcast: PeerBroadcast,
        config: CoordinationConfig,
    ) -> Self {
        Self {
            store,
            session_manager,
            wait_manager,
            wait_directory,
            invalidation_directory,
            broadcast,
            config,
            local_intents: parking_lot::RwLock::new(HashMap::default()),
            local_notify: parking_lot::RwLock::new(HashMap::default()),
        }
    }

    /// Acquire the write-lock on `path` for `session`. Re-entrant: a second
    /// call by the same session on the same path is a no-op success.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinationError::Cancelled`] if `cancellation` fires, or
    /// [`CoordinationError::StoreFailure`] if the retry budget is exhausted.
    #[instrument(skip(self, cancellation), err)]
    pub async fn acquire_write_lock(
        &self,
        path: &Path,
        session: SessionId,
        cancellation: &CancellationToken,
    ) -> Result<StoredEntry> {
        self.acquire_local_intent(path, session, cancellation).await?;

        let entry = match self.announce_write_intent(path, session, cancellation).await {
            Ok(entry) => entry,
            Err(err) => {
                self.release_local_intent(path, session);
                return Err(err);
            }
        };

        match self.drain_readers(path, session, &entry, cancellation).await {
            Ok(final_entry) => {
                trace_lifecycle_event(&LifecycleEvent::WriteLockAcquired { path: path.clone(), session });
                Ok(final_entry)
            }
            Err(err) => {
                self.release_local_intent(path, session);
                Err(err)
            }
        }
    }

    /// Release a write-lock previously returned by
    /// [`LockManager::acquire_write_lock`], bumping `storage_version` and
    /// broadcasting `WriteLockReleased`.
    #[instrument(skip(self, entry), err)]
    pub async fn release_write_lock(&self, entry: &StoredEntry, session: SessionId) -> Result<StoredEntry> {
        let released = self
            .cas_update(entry.clone(), StoredEntry::without_write_lock)
            .await?;
        self.release_local_intent(&entry.path, session);
        self.wait_directory.notify(&entry.path, session);
        self.broadcast_write_lock_released(&entry.path, session).await;
        trace_lifecycle_event(&LifecycleEvent::WriteLockReleased {
            path: entry.path.clone(),
            session,
        });
        Ok(released)
    }

    /// Acquire a read-lock on `entry.path` for `session`. A no-op success if
    /// `session` already holds the write-lock there.
    #[instrument(skip(self, entry, cancellation), err)]
    pub async fn acquire_read_lock(
        &self,
        entry: &StoredEntry,
        session: SessionId,
        cancellation: &CancellationToken,
    ) -> Result<StoredEntry> {
        let mut current = entry.clone();
        loop {
            if current.write_lock == Some(session) {
                return Ok(current);
            }
            if let Some(holder) = current.write_lock {
                if self.session_manager.is_alive(holder).await? {
                    self.wait_manager
                        .wait_for_write_lock_release(&current.path, session, true, cancellation)
                        .await?;
                    current = self.fetch(&current.path).await?;
                    continue;
                }
                current = self.evict_dead_holder(&current, holder).await?;
                continue;
            }

            match self
                .store
                .try_update_entry(&current, current.with_read_lock(session))
                .await
                .map_err(store_err)?
            {
                CasOutcome::Applied(updated) => {
                    trace_lifecycle_event(&LifecycleEvent::ReadLockAcquired {
                        path: updated.path.clone(),
                        session,
                    });
                    return Ok(updated);
                }
                CasOutcome::Conflict(Some(fresh)) => {
                    current = fresh;
                }
                CasOutcome::Conflict(None) => {
                    return Err(CoordinationError::EntryNotFound { path: current.path });
                }
            }
        }
    }

    /// Release a read-lock previously returned by
    /// [`LockManager::acquire_read_lock`].
    #[instrument(skip(self, entry), err)]
    pub async fn release_read_lock(&self, entry: &StoredEntry, session: SessionId) -> Result<StoredEntry> {
        let released = self
            .cas_update(entry.clone(), move |e| e.without_lock_holder(session))
            .await?;
        self.wait_directory.notify(&entry.path, session);
        self.broadcast_read_lock_released(&entry.path, session).await;
        trace_lifecycle_event(&LifecycleEvent::ReadLockReleased {
            path: entry.path.clone(),
            session,
        });
        Ok(released)
    }

    /// Release a write-lock's local bookkeeping without touching the
    /// backing store, for callers that have already deleted the entry
    /// outright (spec §4.9 `delete`).
    pub async fn release_write_lock_after_delete(&self, path: &Path, session: SessionId) {
        self.release_local_intent(path, session);
        self.wait_directory.notify(path, session);
        self.broadcast_write_lock_released(path, session).await;
    }

    async fn acquire_local_intent(&self, path: &Path, session: SessionId, cancellation: &CancellationToken) -> Result<()> {
        loop {
            if cancellation.is_cancelled() {
                return Err(CoordinationError::Cancelled);
            }
            {
                let mut intents = self.local_intents.write();
                match intents.get(path) {
                    Some(holder) if *holder == session => return Ok(()),
                    None => {
                        intents.insert(path.clone(), session);
                        return Ok(());
                    }
                    Some(_) => {}
                }
            }
            let notify = self.local_notify_handle(path);
            tokio::select! {
                biased;
                () = cancellation.cancelled() => return Err(CoordinationError::Cancelled),
                () = notify.notified() => {}
            }
        }
    }

    fn release_local_intent(&self, path: &Path, session: SessionId) {
        let mut intents = self.local_intents.write();
        if intents.get(path) == Some(&session) {
            intents.remove(path);
        }
        drop(intents);
        if let Some(notify) = self.local_notify.read().get(path) {
            notify.notify_waiters();
        }
    }

    fn local_notify_handle(&self, path: &Path) -> Arc<Notify> {
        if let Some(notify) = self.local_notify.read().get(path) {
            return Arc::clone(notify);
        }
        Arc::clone(
            self.local_notify
                .write()
                .entry(path.clone())
                .or_insert_with(|| Arc::new(Notify::new())),
        )
    }

    async fn announce_write_intent(
        &self,
        path: &Path,
        session: SessionId,
        cancellation: &CancellationToken,
    ) -> Result<StoredEntry> {
        let mut current = self.fetch(path).await?;
        loop {
            match current.write_lock {
                None => {}
                Some(holder) if holder == session => return Ok(current),
                Some(holder) => {
                    if self.session_manager.is_alive(holder).await? {
                        self.wait_manager
                            .wait_for_write_lock_release(path, session, true, cancellation)
                            .await?;
                        current = self.fetch(path).await?;
                        continue;
                    }
                    current = self.evict_dead_holder(&current, holder).await?;
                    continue;
                }
            }

            match self
                .store
                .try_update_entry(&current, current.with_write_lock(session))
                .await
                .map_err(store_err)?
            {
                CasOutcome::Applied(updated) => return Ok(updated),
                CasOutcome::Conflict(Some(fresh)) => current = fresh,
                CasOutcome::Conflict(None) => return Err(CoordinationError::EntryNotFound { path: path.clone() }),
            }
        }
    }

    async fn drain_readers(
        &self,
        path: &Path,
        session: SessionId,
        entry: &StoredEntry,
        cancellation: &CancellationToken,
    ) -> Result<StoredEntry> {
        if entry.read_locks.is_empty() {
            return Ok(entry.clone());
        }
        for reader in &entry.read_locks {
            self.invalidation_directory.invoke(path).await;
            if let Some(exchange) = &self.broadcast.exchange {
                for peer in &self.broadcast.peers {
                    if let Err(err) = exchange.send_invalidate(peer, path, *reader).await {
                        tracing::warn!(target: "pathkeeper::lock", %peer, %err, "invalidate delivery failed");
                    }
                }
            }
        }
        self.wait_manager.wait_for_read_locks_release(path, cancellation).await?;
        self.fetch(path).await
    }

    async fn evict_dead_holder(&self, entry: &StoredEntry, holder: SessionId) -> Result<StoredEntry> {
        match self
            .store
            .try_update_entry(entry, entry.without_lock_holder(holder))
            .await
            .map_err(store_err)?
        {
            CasOutcome::Applied(updated) => Ok(updated),
            CasOutcome::Conflict(Some(fresh)) => Ok(fresh),
            CasOutcome::Conflict(None) => Err(CoordinationError::EntryNotFound { path: entry.path.clone() }),
        }
    }

    /// Apply `mutate` to `base` via CAS, retrying against a freshly re-read
    /// snapshot (with `mutate` re-applied) whenever another writer raced the
    /// storage_version in between.
    async fn cas_update(&self, base: StoredEntry, mutate: impl Fn(&StoredEntry) -> StoredEntry) -> Result<StoredEntry> {
        let mut current = base;
        for attempt in 0..self.config.max_retry_attempts {
            let desired = mutate(&current);
            match self.store.try_update_entry(&current, desired).await {
                Ok(CasOutcome::Applied(updated)) => return Ok(updated),
                Ok(CasOutcome::Conflict(Some(fresh))) => current = fresh,
                Ok(CasOutcome::Conflict(None)) => {
                    return Err(CoordinationError::EntryNotFound { path: current.path });
                }
                Err(e) => {
                    if attempt + 1 == self.config.max_retry_attempts {
                        return Err(CoordinationError::StoreFailure {
                            message: e.to_string(),
                            attempts: attempt + 1,
                        });
                    }
                }
            }
        }
        Err(CoordinationError::StoreFailure {
            message: "exhausted retries".into(),
            attempts: self.config.max_retry_attempts,
        })
    }

    async fn fetch(&self, path: &Path) -> Result<StoredEntry> {
        self.store
            .get_entry(path)
            .await
            .map_err(store_err)?
            .ok_or_else(|| CoordinationError::EntryNotFound { path: path.clone() })
    }

    async fn broadcast_write_lock_released(&self, path: &Path, session: SessionId) {
        if let Some(exchange) = &self.broadcast.exchange {
            if let Err(err) = exchange
                .broadcast_write_lock_released(path, session, &self.broadcast.peers)
                .await
            {
                tracing::warn!(target: "pathkeeper::lock", %err, "write-lock release broadcast failed");
            }
        }
    }

    async fn broadcast_read_lock_released(&self, path: &Path, session: SessionId) {
        if let Some(exchange) = &self.broadcast.exchange {
            if let Err(err) = exchange
                .broadcast_read_lock_released(path, session, &self.broadcast.peers)
                .await
            {
                tracing::warn!(target: "pathkeeper::lock", %err, "read-lock release broadcast failed");
            }
        }
    }
}

fn store_err(e: crate::store::StoreError) -> CoordinationError {
    CoordinationError::StoreFailure {
        message: e.to_string(),
        attempts: 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::memory::InMemoryStore;
    use chrono::Utc;

    struct Rig {
        store: Arc<InMemoryStore>,
        sessions: Arc<SessionManager>,
        locks: LockManager,
    }

    fn test_rig() -> Rig {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let config = CoordinationConfig::default();
        let sessions = Arc::new(SessionManager::new(
            store.clone() as Arc<dyn BackingStore>,
            clock.clone() as Arc<dyn crate::clock::Clock>,
            config.clone(),
        ));
        let wait_directory = Arc::new(WaitDirectory::new());
        let wait_manager = Arc::new(WaitManager::new(
            store.clone() as Arc<dyn BackingStore>,
            sessions.clone(),
            wait_directory.clone(),
            std::time::Duration::from_millis(20),
        ));
        let invalidation_directory = Arc::new(InvalidationDirectory::new());
        let locks = LockManager::new(
            store.clone() as Arc<dyn BackingStore>,
            sessions.clone(),
            wait_manager,
            wait_directory,
            invalidation_directory,
            PeerBroadcast::default(),
            config,
        );
        Rig { store, sessions, locks }
    }

    #[tokio::test]
    async fn write_lock_acquisition_is_reentrant() {
        let rig = test_rig();
        let owned = rig.sessions.allocate().await.unwrap();
        let entry = StoredEntry::new(Path::root(), vec![], None, Utc::now());
        rig.store.try_create_entry(entry).await.unwrap();
        let cancellation = CancellationToken::new();

        let first = rig.locks.acquire_write_lock(&Path::root(), owned.id, &cancellation).await.unwrap();
        assert_eq!(first.write_lock, Some(owned.id));

        let second = rig.locks.acquire_write_lock(&Path::root(), owned.id, &cancellation).await.unwrap();
        assert_eq!(second.write_lock, Some(owned.id));
    }

    #[tokio::test]
    async fn read_lock_proceeds_once_the_writer_releases() {
        let rig = test_rig();
        let writer = rig.sessions.allocate().await.unwrap();
        let reader = rig.sessions.allocate().await.unwrap();
        let entry = StoredEntry::new(Path::root(), vec![], None, Utc::now());
        rig.store.try_create_entry(entry).await.unwrap();
        let cancellation = CancellationToken::new();

        let held = rig.locks.acquire_write_lock(&Path::root(), writer.id, &cancellation).await.unwrap();
        rig.locks.release_write_lock(&held, writer.id).await.unwrap();

        let released = rig.store.get_entry(&Path::root()).await.unwrap().unwrap();
        assert_eq!(released.write_lock, None);

        let read_entry = rig.locks.acquire_read_lock(&released, reader.id, &cancellation).await.unwrap();
        assert!(read_entry.read_locks.contains(&reader.id));
    }

    #[tokio::test]
    async fn dead_write_lock_holder_is_evicted_on_next_acquisition() {
        let rig = test_rig();
        let dead = rig.sessions.allocate().await.unwrap();
        let dead_id = dead.id;
        let entry = StoredEntry::new(Path::root(), vec![], None, Utc::now()).with_write_lock(dead_id);
        rig.store.try_create_entry(entry).await.unwrap();
        rig.sessions.end(dead_id).await.unwrap();

        let new_session = rig.sessions.allocate().await.unwrap();
        let cancellation = CancellationToken::new();
        let acquired = rig
            .locks
            .acquire_write_lock(&Path::root(), new_session.id, &cancellation)
            .await
            .unwrap();
        assert_eq!(acquired.write_lock, Some(new_session.id));
    }

    #[tokio::test]
    async fn release_read_lock_removes_only_that_session() {
        let rig = test_rig();
        let a = rig.sessions.allocate().await.unwrap();
        let b = rig.sessions.allocate().await.unwrap();
        let entry = StoredEntry::new(Path::root(), vec![], None, Utc::now());
        rig.store.try_create_entry(entry.clone()).await.unwrap();

        let entry = rig.locks.acquire_read_lock(&entry, a.id, &CancellationToken::new()).await.unwrap();
        let entry = rig.locks.acquire_read_lock(&entry, b.id, &CancellationToken::new()).await.unwrap();
        assert_eq!(entry.read_locks.len(), 2);

        let entry = rig.locks.release_read_lock(&entry, a.id).await.unwrap();
        assert!(!entry.read_locks.contains(&a.id));
        assert!(entry.read_locks.contains(&b.id));
    }

    #[tokio::test]
    async fn local_intent_serializes_concurrent_acquirers_on_the_same_path() {
        let rig = Arc::new(test_rig());
        let a = rig.sessions.allocate().await.unwrap();
        let b = rig.sessions.allocate().await.unwrap();
        let entry = StoredEntry::new(Path::root(), vec![], None, Utc::now());
        rig.store.try_create_entry(entry).await.unwrap();

        let held = rig
            .locks
            .acquire_write_lock(&Path::root(), a.id, &CancellationToken::new())
            .await
            .unwrap();

        let rig_clone = Arc::clone(&rig);
        let waiter = tokio::spawn(async move {
            rig_clone
                .locks
                .acquire_write_lock(&Path::root(), b.id, &CancellationToken::new())
                .await
        });

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        rig.locks.release_write_lock(&held, a.id).await.unwrap();

        let acquired = waiter.await.unwrap().unwrap();
        assert_eq!(acquired.write_lock, Some(b.id));
    }
}
