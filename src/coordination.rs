//! Coordination manager facade: `create` / `get` / `set_value` / `delete`
//! composed from the lock manager, session manager, and invalidation
//! directory (spec §4.9).

use std::sync::Arc;

use rustc_hash::FxHashMap;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::clock::Clock;
use crate::config::CoordinationConfig;
use crate::error::{CoordinationError, Result};
use crate::exchange::InvalidationSink;
use crate::invalidation::{CallbackError, CallbackHandle, InvalidationCallback, InvalidationDirectory};
use crate::lock::LockManager;
use crate::model::entry::{CreateMode, StoredEntry};
use crate::model::path::Path;
use crate::model::session::SessionId;
use crate::session::SessionManager;
use crate::store::{BackingStore, CasOutcome};
use crate::telemetry::{trace_lifecycle_event, LifecycleEvent};

struct CachedEntry {
    entry: StoredEntry,
    session: SessionId,
    handle: CallbackHandle,
}

/// Create/Get/SetValue/Delete over the hierarchical name tree, with
/// client-side read caching guarded by held read-locks (spec §4.9).
pub struct CoordinationService {
    store: Arc<dyn BackingStore>,
    clock: Arc<dyn Clock>,
    session_manager: Arc<SessionManager>,
    lock_manager: Arc<LockManager>,
    invalidation_directory: Arc<InvalidationDirectory>,
    config: CoordinationConfig,
    cache: parking_lot::RwLock<FxHashMap<Path, CachedEntry>>,
}

impl CoordinationService {
    #[must_use]
    pub fn new(
        store: Arc<dyn BackingStore>,
        clock: Arc<dyn Clock>,
        session_manager: Arc<SessionManager>,
        lock_manager: Arc<LockManager>,
        invalidation_directory: Arc<InvalidationDirectory>,
        config: CoordinationConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            clock,
            session_manager,
            lock_manager,
            invalidation_directory,
            config,
            cache: parking_lot::RwLock::new(FxHashMap::default()),
        })
    }

    /// Ensure the root entry exists, for bootstrapping a fresh store.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinationError::StoreFailure`] if the backing store
    /// cannot be written.
    pub async fn ensure_root(&self) -> Result<()> {
        let root = StoredEntry::new(Path::root(), Vec::new(), None, self.clock.now());
        match self.store.try_create_entry(root).await.map_err(store_err)? {
            CasOutcome::Applied(_) | CasOutcome::Conflict(_) => Ok(()),
        }
    }

    /// Create a new entry at `path`, held by `session`'s write-lock on both
    /// `path` and its parent for the duration (spec §4.9).
    ///
    /// # Errors
    ///
    /// Returns [`CoordinationError::DuplicateEntry`] if `path` already
    /// exists, [`CoordinationError::ParentNotFound`] if the parent path does
    /// not exist, or a lock/store failure.
    #[instrument(skip(self, value, cancellation), err)]
    pub async fn create(
        &self,
        path: &Path,
        value: Vec<u8>,
        mode: CreateMode,
        session: SessionId,
        cancellation: &CancellationToken,
    ) -> Result<StoredEntry> {
        if !self.session_manager.is_alive(session).await? {
            return Err(CoordinationError::SessionEnded);
        }
        if path.is_root() {
            return Err(CoordinationError::DuplicateEntry { path: path.clone() });
        }
        let Some(name) = path.name() else {
            return Err(CoordinationError::DuplicateEntry { path: path.clone() });
        };
        let parent = path.parent();

        if self.store.get_entry(&parent).await.map_err(store_err)?.is_none() {
            return Err(CoordinationError::ParentNotFound { path: path.clone() });
        }

        let locked_parent = self.lock_manager.acquire_write_lock(&parent, session, cancellation).await?;

        match self.create_checked(path, value, mode, session).await {
            Ok(created) => {
                let with_child = self.cas_update_entry(locked_parent, |e| e.with_child(name)).await?;
                self.lock_manager.release_write_lock(&with_child, session).await?;

                if let CreateMode::Ephemeral = mode {
                    self.session_manager.link_entry(session, path.clone()).await?;
                }

                Ok(created)
            }
            Err(err) => {
                self.lock_manager.release_write_lock(&locked_parent, session).await?;
                Err(err)
            }
        }
    }

    /// Duplicate check and CAS creation under an already-held parent
    /// write-lock. Factored out so `create` can release that lock on any
    /// error this returns, mirroring `delete`'s `delete_subtree` split.
    async fn create_checked(&self, path: &Path, value: Vec<u8>, mode: CreateMode, session: SessionId) -> Result<StoredEntry> {
        if self.store.get_entry(path).await.map_err(store_err)?.is_some() {
            return Err(CoordinationError::DuplicateEntry { path: path.clone() });
        }

        let ephemeral_owner = matches!(mode, CreateMode::Ephemeral).then_some(session);
        let new_entry = StoredEntry::new(path.clone(), value, ephemeral_owner, self.clock.now());
        match self.store.try_create_entry(new_entry).await.map_err(store_err)? {
            CasOutcome::Applied(created) => Ok(created),
            CasOutcome::Conflict(_) => Err(CoordinationError::DuplicateEntry { path: path.clone() }),
        }
    }

    /// Read the current value at `path`, caching it locally (keyed by path
    /// and guarded by a held read-lock) when `config.cache_enabled` is set.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinationError::EntryNotFound`] if `path` does not
    /// exist, or a lock/store failure.
    #[instrument(skip(self, cancellation), err)]
    pub async fn get(self: &Arc<Self>, path: &Path, session: SessionId, cancellation: &CancellationToken) -> Result<StoredEntry> {
        if !self.session_manager.is_alive(session).await? {
            return Err(CoordinationError::SessionEnded);
        }
        if !self.config.cache_enabled {
            return self.fetch(path).await;
        }
        if let Some(cached) = self.cache.read().get(path) {
            return Ok(cached.entry.clone());
        }

        let current = self.fetch(path).await?;
        let locked = self.lock_manager.acquire_read_lock(&current, session, cancellation).await?;

        let handle = self
            .invalidation_directory
            .register(path.clone(), Arc::clone(self) as Arc<dyn InvalidationCallback>);

        // A second concurrent cache-miss for `path` loses the race here: the
        // winner's entry stays cached and the loser unwinds its own
        // just-taken read-lock and registration instead of orphaning them
        // under an overwritten `CachedEntry`.
        let lost_race = {
            let mut cache = self.cache.write();
            if cache.contains_key(path) {
                true
            } else {
                cache.insert(
                    path.clone(),
                    CachedEntry {
                        entry: locked.clone(),
                        session,
                        handle,
                    },
                );
                false
            }
        };

        if lost_race {
            self.invalidation_directory.unregister(path, handle);
            self.lock_manager.release_read_lock(&locked, session).await?;
        }

        Ok(locked)
    }

    /// Update `path`'s value, requiring the write-lock and, if
    /// `expected_version` is given, a matching current `version` (spec
    /// §4.9).
    ///
    /// # Errors
    ///
    /// Returns [`CoordinationError::VersionConflict`] if `expected_version`
    /// does not match, [`CoordinationError::EntryNotFound`] if `path` does
    /// not exist, or a lock/store failure.
    #[instrument(skip(self, value, cancellation), err)]
    pub async fn set_value(
        &self,
        path: &Path,
        value: Vec<u8>,
        expected_version: Option<u64>,
        session: SessionId,
        cancellation: &CancellationToken,
    ) -> Result<StoredEntry> {
        if !self.session_manager.is_alive(session).await? {
            return Err(CoordinationError::SessionEnded);
        }
        let current = self.fetch(path).await?;
        if let Some(expected) = expected_version {
            if expected != current.version {
                return Err(CoordinationError::VersionConflict {
                    path: path.clone(),
                    expected,
                    actual: current.version,
                });
            }
        }

        let locked = self.lock_manager.acquire_write_lock(path, session, cancellation).await?;
        if let Some(expected) = expected_version {
            if expected != locked.version {
                self.lock_manager.release_write_lock(&locked, session).await?;
                return Err(CoordinationError::VersionConflict {
                    path: path.clone(),
                    expected,
                    actual: locked.version,
                });
            }
        }

        let now = self.clock.now();
        let update_result = self.store.try_update_entry(&locked, locked.with_value(value, now)).await.map_err(store_err);

        let updated = match update_result {
            Ok(CasOutcome::Applied(updated)) => updated,
            Ok(CasOutcome::Conflict(_)) => {
                self.lock_manager.release_write_lock(&locked, session).await?;
                return Err(CoordinationError::StoreFailure {
                    message: "value update raced a concurrent write under the same write-lock".into(),
                    attempts: 1,
                });
            }
            Err(err) => {
                self.lock_manager.release_write_lock(&locked, session).await?;
                return Err(err);
            }
        };

        self.lock_manager.release_write_lock(&updated, session).await?;
        Ok(updated)
    }

    /// Recursively delete `path` and every descendant, under the same lock
    /// discipline, unlinking from the parent's `children` and, for
    /// ephemeral entries, from their owning session (spec §4.9).
    ///
    /// # Errors
    ///
    /// Returns [`CoordinationError::EntryNotFound`] if `path` does not
    /// exist, or a lock/store failure.
    #[instrument(skip(self, cancellation), err)]
    pub async fn delete(&self, path: &Path, session: SessionId, cancellation: &CancellationToken) -> Result<()> {
        if !self.session_manager.is_alive(session).await? {
            return Err(CoordinationError::SessionEnded);
        }
        if path.is_root() {
            return Err(CoordinationError::EntryNotFound { path: path.clone() });
        }
        let parent = path.parent();
        let locked_parent = self.lock_manager.acquire_write_lock(&parent, session, cancellation).await?;

        let Some(name) = path.name() else {
            self.lock_manager.release_write_lock(&locked_parent, session).await?;
            return Err(CoordinationError::EntryNotFound { path: path.clone() });
        };

        let result = self.delete_subtree(path, session, cancellation).await;

        match result {
            Ok(()) => {
                let without_child = self.cas_update_entry(locked_parent, |e| e.without_child(name)).await?;
                self.lock_manager.release_write_lock(&without_child, session).await?;
                Ok(())
            }
            Err(err) => {
                self.lock_manager.release_write_lock(&locked_parent, session).await?;
                Err(err)
            }
        }
    }

    fn delete_subtree<'a>(
        &'a self,
        path: &'a Path,
        session: SessionId,
        cancellation: &'a CancellationToken,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let locked = self.lock_manager.acquire_write_lock(path, session, cancellation).await?;

            for child_name in locked.children.clone() {
                let child_path = path.child(child_name).map_err(|_| CoordinationError::EntryNotFound { path: path.clone() })?;
                self.delete_subtree(&child_path, session, cancellation).await?;
            }

            let ephemeral_owner = locked.ephemeral_owner;
            match self.store.delete_entry(&locked).await.map_err(store_err)? {
                CasOutcome::Applied(()) | CasOutcome::Conflict(_) => {}
            }
            self.lock_manager.release_write_lock_after_delete(path, session).await;
            self.cache.write().remove(path);

            if let Some(owner) = ephemeral_owner {
                self.session_manager.unlink_entry(owner, path).await?;
            }
            trace_lifecycle_event(&LifecycleEvent::WriteLockReleased {
                path: path.clone(),
                session,
            });
            Ok(())
        })
    }

    async fn fetch(&self, path: &Path) -> Result<StoredEntry> {
        self.store
            .get_entry(path)
            .await
            .map_err(store_err)?
            .ok_or_else(|| CoordinationError::EntryNotFound { path: path.clone() })
    }

    async fn cas_update_entry(&self, base: StoredEntry, mutate: impl Fn(&StoredEntry) -> StoredEntry) -> Result<StoredEntry> {
        let mut current = base;
        for _ in 0..self.config.max_retry_attempts {
            let desired = mutate(&current);
            match self.store.try_update_entry(&current, desired).await.map_err(store_err)? {
                CasOutcome::Applied(updated) => return Ok(updated),
                CasOutcome::Conflict(Some(fresh)) => current = fresh,
                CasOutcome::Conflict(None) => return Err(CoordinationError::EntryNotFound { path: current.path }),
            }
        }
        Err(CoordinationError::StoreFailure {
            message: "exhausted retries".into(),
            attempts: self.config.max_retry_attempts,
        })
    }

    fn evict_cache_entry(&self, path: &Path) -> Option<(CachedEntry, CallbackHandle)> {
        let cached = self.cache.write().remove(path)?;
        let handle = cached.handle;
        Some((cached, handle))
    }
}

#[async_trait::async_trait]
impl InvalidationCallback for CoordinationService {
    async fn invoke(&self, path: &Path) -> std::result::Result<(), CallbackError> {
        if let Some((cached, handle)) = self.evict_cache_entry(path) {
            self.invalidation_directory.unregister(path, handle);
            if let Err(err) = self.lock_manager.release_read_lock(&cached.entry, cached.session).await {
                return Err(CallbackError(err.to_string()));
            }
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl InvalidationSink for CoordinationService {
    async fn invalidate(&self, path: &Path, _session: SessionId) {
        if self.invoke(path).await.is_err() {
            tracing::warn!(target: "pathkeeper::coordination", %path, "remote cache invalidation failed");
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
    use crate::lock::PeerBroadcast;
    use crate::store::memory::InMemoryStore;
    use crate::wait::WaitDirectory;
    use crate::waitmgr::WaitManager;
    use chrono::Utc;
    use std::time::Duration;

    fn test_service() -> (Arc<InMemoryStore>, Arc<SessionManager>, Arc<CoordinationService>) {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let config = CoordinationConfig::default();
        let sessions = Arc::new(SessionManager::new(
            store.clone() as Arc<dyn BackingStore>,
            clock.clone() as Arc<dyn Clock>,
            config.clone(),
        ));
        let wait_directory = Arc::new(WaitDirectory::new());
        let wait_manager = Arc::new(WaitManager::new(
            store.clone() as Arc<dyn BackingStore>,
            sessions.clone(),
            wait_directory.clone(),
            Duration::from_millis(20),
        ));
        let invalidation_directory = Arc::new(InvalidationDirectory::new());
        let lock_manager = Arc::new(LockManager::new(
            store.clone() as Arc<dyn BackingStore>,
            sessions.clone(),
            wait_manager,
            wait_directory,
            invalidation_directory.clone(),
            PeerBroadcast::default(),
            config.clone(),
        ));
        let service = CoordinationService::new(
            store.clone() as Arc<dyn BackingStore>,
            clock as Arc<dyn Clock>,
            sessions.clone(),
            lock_manager,
            invalidation_directory,
            config,
        );
        (store, sessions, service)
    }

    #[tokio::test]
    async fn create_then_get_round_trips_value() {
        let (_store, sessions, service) = test_service();
        service.ensure_root().await.unwrap();
        let owner = sessions.allocate().await.unwrap();
        let cancellation = CancellationToken::new();
        let path = Path::parse("/widgets").unwrap();

        service.create(&path, b"v1".to_vec(), CreateMode::Default, owner.id, &cancellation).await.unwrap();
        let fetched = service.get(&path, owner.id, &cancellation).await.unwrap();
        assert_eq!(fetched.value, b"v1");
    }

    #[tokio::test]
    async fn create_duplicate_fails() {
        let (_store, sessions, service) = test_service();
        service.ensure_root().await.unwrap();
        let owner = sessions.allocate().await.unwrap();
        let cancellation = CancellationToken::new();
        let path = Path::parse("/widgets").unwrap();

        service.create(&path, b"v1".to_vec(), CreateMode::Default, owner.id, &cancellation).await.unwrap();
        let result = service.create(&path, b"v2".to_vec(), CreateMode::Default, owner.id, &cancellation).await;
        assert!(matches!(result, Err(CoordinationError::DuplicateEntry { .. })));
    }

    #[tokio::test]
    async fn create_without_parent_fails() {
        let (_store, sessions, service) = test_service();
        service.ensure_root().await.unwrap();
        let owner = sessions.allocate().await.unwrap();
        let cancellation = CancellationToken::new();
        let path = Path::parse("/missing/child").unwrap();

        let result = service.create(&path, Vec::new(), CreateMode::Default, owner.id, &cancellation).await;
        assert!(matches!(result, Err(CoordinationError::ParentNotFound { .. })));
    }

    #[tokio::test]
    async fn set_value_rejects_stale_expected_version() {
        let (_store, sessions, service) = test_service();
        service.ensure_root().await.unwrap();
        let owner = sessions.allocate().await.unwrap();
        let cancellation = CancellationToken::new();
        let path = Path::parse("/widgets").unwrap();
        service.create(&path, b"v1".to_vec(), CreateMode::Default, owner.id, &cancellation).await.unwrap();

        let result = service.set_value(&path, b"v2".to_vec(), Some(99), owner.id, &cancellation).await;
        assert!(matches!(result, Err(CoordinationError::VersionConflict { .. })));
    }

    #[tokio::test]
    async fn delete_removes_entry_and_parent_link() {
        let (store, sessions, service) = test_service();
        service.ensure_root().await.unwrap();
        let owner = sessions.allocate().await.unwrap();
        let cancellation = CancellationToken::new();
        let path = Path::parse("/widgets").unwrap();
        service.create(&path, Vec::new(), CreateMode::Default, owner.id, &cancellation).await.unwrap();

        service.delete(&path, owner.id, &cancellation).await.unwrap();
        assert!(store.get_entry(&path).await.unwrap().is_none());
        let root = store.get_entry(&Path::root()).await.unwrap().unwrap();
        assert!(!root.children.contains("widgets"));
    }

    #[tokio::test]
    async fn ephemeral_create_links_session_and_delete_unlinks() {
        let (store, sessions, service) = test_service();
        service.ensure_root().await.unwrap();
        let owner = sessions.allocate().await.unwrap();
        let cancellation = CancellationToken::new();
        let path = Path::parse("/locks/widgets").unwrap();

        service.create(&Path::parse("/locks").unwrap(), Vec::new(), CreateMode::Default, owner.id, &cancellation).await.unwrap();
        service.create(&path, Vec::new(), CreateMode::Ephemeral, owner.id, &cancellation).await.unwrap();

        let stored_session = store.get_session(owner.id).await.unwrap().unwrap();
        assert!(stored_session.entries.contains(&path));

        service.delete(&path, owner.id, &cancellation).await.unwrap();
        let stored_session = store.get_session(owner.id).await.unwrap().unwrap();
        assert!(!stored_session.entries.contains(&path));
    }
}
