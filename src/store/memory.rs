//! Non-durable [`BackingStore`] used for tests and single-process
//! deployments. Mirrors the lock-and-hashmap shape of this codebase's
//! in-memory checkpointer, generalized to both entries and sessions with
//! compare-and-swap semantics.

use async_trait::async_trait;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::model::entry::StoredEntry;
use crate::model::path::Path;
use crate::model::session::{SessionId, StoredSession};

use super::{BackingStore, CasOutcome, Result};

/// An in-memory, process-local [`BackingStore`].
///
/// Does not survive process restart and is not shared across nodes; useful
/// for tests and for exercising the coordination core without a database.
#[derive(Default)]
pub struct InMemoryStore {
    entries: RwLock<FxHashMap<Path, StoredEntry>>,
    sessions: RwLock<FxHashMap<SessionId, StoredSession>>,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(FxHashMap::default()),
            sessions: RwLock::new(FxHashMap::default()),
        }
    }
}

#[async_trait]
impl BackingStore for InMemoryStore {
    async fn get_entry(&self, path: &Path) -> Result<Option<StoredEntry>> {
        Ok(self.entries.read().get(path).cloned())
    }

    async fn get_session(&self, id: SessionId) -> Result<Option<StoredSession>> {
        Ok(self.sessions.read().get(&id).cloned())
    }

    async fn try_create_entry(&self, entry: StoredEntry) -> Result<CasOutcome<StoredEntry>> {
        let mut map = self.entries.write();
        match map.get(&entry.path) {
            Some(existing) => Ok(CasOutcome::Conflict(Some(existing.clone()))),
            None => {
                map.insert(entry.path.clone(), entry.clone());
                Ok(CasOutcome::Applied(entry))
            }
        }
    }

    async fn try_update_entry(
        &self,
        old: &StoredEntry,
        new: StoredEntry,
    ) -> Result<CasOutcome<StoredEntry>> {
        let mut map = self.entries.write();
        match map.get(&old.path) {
            Some(current) if current.storage_version == old.storage_version => {
                map.insert(new.path.clone(), new.clone());
                Ok(CasOutcome::Applied(new))
            }
            Some(current) => Ok(CasOutcome::Conflict(Some(current.clone()))),
            None => Ok(CasOutcome::Conflict(None)),
        }
    }

    async fn delete_entry(&self, old: &StoredEntry) -> Result<CasOutcome<()>> {
        let mut map = self.entries.write();
        match map.get(&old.path) {
            Some(current) if current.storage_version == old.storage_version => {
                map.remove(&old.path);
                Ok(CasOutcome::Applied(()))
            }
            Some(_) => Ok(CasOutcome::Conflict(Some(()))),
            None => Ok(CasOutcome::Conflict(None)),
        }
    }

    async fn try_create_session(&self, session: StoredSession) -> Result<CasOutcome<StoredSession>> {
        let mut map = self.sessions.write();
        match map.get(&session.key) {
            Some(existing) => Ok(CasOutcome::Conflict(Some(existing.clone()))),
            None => {
                map.insert(session.key, session.clone());
                Ok(CasOutcome::Applied(session))
            }
        }
    }

    async fn try_update_session(
        &self,
        old: &StoredSession,
        new: StoredSession,
    ) -> Result<CasOutcome<StoredSession>> {
        let mut map = self.sessions.write();
        match map.get(&old.key) {
            Some(current) if current.storage_version == old.storage_version => {
                map.insert(new.key, new.clone());
                Ok(CasOutcome::Applied(new))
            }
            Some(current) => Ok(CasOutcome::Conflict(Some(current.clone()))),
            None => Ok(CasOutcome::Conflict(None)),
        }
    }

    async fn delete_session(&self, old: &StoredSession) -> Result<CasOutcome<()>> {
        let mut map = self.sessions.write();
        match map.get(&old.key) {
            Some(current) if current.storage_version == old.storage_version => {
                map.remove(&old.key);
                Ok(CasOutcome::Applied(()))
            }
            Some(_) => Ok(CasOutcome::Conflict(None)),
            None => Ok(CasOutcome::Conflict(None)),
        }
    }

    async fn list_sessions(&self) -> Result<Vec<StoredSession>> {
        Ok(self.sessions.read().values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn create_then_conflict_on_duplicate() {
        let store = InMemoryStore::new();
        let entry = StoredEntry::new(Path::root(), vec![1], None, Utc::now());
        let applied = store.try_create_entry(entry.clone()).await.unwrap();
        assert!(applied.is_applied());

        let dup = StoredEntry::new(Path::root(), vec![2], None, Utc::now());
        match store.try_create_entry(dup).await.unwrap() {
            CasOutcome::Conflict(Some(existing)) => assert_eq!(existing.value, vec![1]),
            other => panic!("expected conflict, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn update_rejects_stale_storage_version() {
        let store = InMemoryStore::new();
        let entry = StoredEntry::new(Path::root(), vec![1], None, Utc::now());
        store.try_create_entry(entry.clone()).await.unwrap();

        let updated = entry.with_value(vec![2], Utc::now());
        store.try_update_entry(&entry, updated.clone()).await.unwrap();

        // Second attempt with the now-stale `entry` comparand must conflict.
        let stale_attempt = entry.with_value(vec![3], Utc::now());
        match store.try_update_entry(&entry, stale_attempt).await.unwrap() {
            CasOutcome::Conflict(Some(current)) => assert_eq!(current.value, vec![2]),
            other => panic!("expected conflict, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn delete_requires_matching_storage_version() {
        let store = InMemoryStore::new();
        let entry = StoredEntry::new(Path::root(), vec![1], None, Utc::now());
        store.try_create_entry(entry.clone()).await.unwrap();

        let outcome = store.delete_entry(&entry).await.unwrap();
        assert!(outcome.is_applied());
        assert!(store.get_entry(&Path::root()).await.unwrap().is_none());
    }
}
