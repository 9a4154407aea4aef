//! The backing store capability: compare-and-swap reads and writes over
//! stored entries and sessions.
//!
//! [`BackingStore`] is the one abstraction the rest of this crate depends on
//! for durability; [`memory::InMemoryStore`] and, behind the `sqlite`
//! feature, [`sqlite::SqliteStore`] both implement it. Replication and
//! on-disk format are the store's concern, not the coordination core's (see
//! spec §1 Non-goals).

pub mod memory;
#[cfg(feature = "sqlite")]
pub mod sqlite;

use async_trait::async_trait;
use thiserror::Error;

use crate::model::entry::StoredEntry;
use crate::model::path::Path;
use crate::model::session::{SessionId, StoredSession};

/// Errors internal to a [`BackingStore`] implementation.
///
/// Callers in [`crate::lock`] and [`crate::session`] translate a bounded
/// number of these into [`crate::error::CoordinationError::StoreFailure`]
/// after retrying with backoff (spec §7).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("backend error: {0}")]
    Backend(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Outcome of a compare-and-swap write attempt.
///
/// `Conflict` carries the current stored snapshot (or `None` if the record
/// was deleted concurrently) so the caller can decide how to retry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CasOutcome<T> {
    Applied(T),
    Conflict(Option<T>),
}

impl<T> CasOutcome<T> {
    #[must_use]
    pub fn is_applied(&self) -> bool {
        matches!(self, CasOutcome::Applied(_))
    }
}

/// Conditional reads and writes over stored entries and sessions.
///
/// Every `try_*` method succeeds only when the stored `storage_version`
/// matches the caller-supplied comparand (or, for creation, only when no
/// record exists yet); otherwise it returns [`CasOutcome::Conflict`] carrying
/// the current stored snapshot so the caller can retry against fresh state.
#[async_trait]
pub trait BackingStore: Send + Sync {
    /// Fetch the current snapshot of an entry, or `None` if it does not exist.
    async fn get_entry(&self, path: &Path) -> Result<Option<StoredEntry>>;

    /// Fetch the current snapshot of a session, or `None` if it does not exist.
    async fn get_session(&self, id: SessionId) -> Result<Option<StoredSession>>;

    /// Create a new entry. Fails with `Conflict` carrying the existing entry
    /// if one is already stored at `entry.path`.
    async fn try_create_entry(&self, entry: StoredEntry) -> Result<CasOutcome<StoredEntry>>;

    /// Replace `old` with `new` only if the stored `storage_version` still
    /// matches `old.storage_version`.
    async fn try_update_entry(
        &self,
        old: &StoredEntry,
        new: StoredEntry,
    ) -> Result<CasOutcome<StoredEntry>>;

    /// Remove the entry at `old.path` only if the stored `storage_version`
    /// still matches `old.storage_version`.
    async fn delete_entry(&self, old: &StoredEntry) -> Result<CasOutcome<()>>;

    /// Create a new session record. Fails with `Conflict` if one already
    /// exists for `session.key`.
    async fn try_create_session(&self, session: StoredSession) -> Result<CasOutcome<StoredSession>>;

    /// Replace `old` with `new` only if the stored `storage_version` still
    /// matches `old.storage_version`.
    async fn try_update_session(
        &self,
        old: &StoredSession,
        new: StoredSession,
    ) -> Result<CasOutcome<StoredSession>>;

    /// Remove the session record only if the stored `storage_version` still
    /// matches `old.storage_version`.
    async fn delete_session(&self, old: &StoredSession) -> Result<CasOutcome<()>>;

    /// List every currently stored session.
    async fn list_sessions(&self) -> Result<Vec<StoredSession>>;
}
