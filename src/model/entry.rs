//! `StoredEntry`: an immutable snapshot of a single node in the hierarchical
//! name tree.
//!
//! Every mutation to an entry is expressed as a pure function
//! `snapshot -> snapshot'`; the backing store is the only thing that decides
//! whether a given `snapshot'` is accepted (see [`crate::store`]).

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::path::Path;
use crate::model::session::SessionId;

/// Creation mode requested by [`crate::coordination::CoordinationService::create`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CreateMode {
    /// A regular entry, unaffected by any session's lifetime.
    Default,
    /// An entry owned by the creating session; removed when that session ends.
    Ephemeral,
}

/// An immutable snapshot of a single entry in the name tree.
///
/// # Invariants
///
/// 1. `write_lock.is_some()` implies `read_locks.is_empty()`.
/// 2. `version` increases on every accepted value mutation; `storage_version`
///    increases on every accepted mutation, including lock-only changes.
/// 3. If this entry has a non-root path, its name is listed in the parent's
///    `children` (enforced by [`crate::coordination::CoordinationService`],
///    not by this type itself).
/// 4. If `ephemeral_owner` is `Some(s)`, the entry must not outlive session
///    `s` (enforced by [`crate::gc::GarbageCollector`]).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredEntry {
    pub path: Path,
    pub value: Vec<u8>,
    pub version: u64,
    pub storage_version: u64,
    pub read_locks: BTreeSet<SessionId>,
    pub write_lock: Option<SessionId>,
    pub creation_time: DateTime<Utc>,
    pub last_write_time: DateTime<Utc>,
    pub children: BTreeSet<String>,
    pub ephemeral_owner: Option<SessionId>,
}

impl StoredEntry {
    /// Construct the first snapshot of a freshly created entry (version 1).
    #[must_use]
    pub fn new(path: Path, value: Vec<u8>, ephemeral_owner: Option<SessionId>, now: DateTime<Utc>) -> Self {
        Self {
            path,
            value,
            version: 1,
            storage_version: 1,
            read_locks: BTreeSet::new(),
            write_lock: None,
            creation_time: now,
            last_write_time: now,
            children: BTreeSet::new(),
            ephemeral_owner,
        }
    }

    /// `true` if invariant 1 holds for this snapshot.
    #[must_use]
    pub fn locks_are_consistent(&self) -> bool {
        self.write_lock.is_none() || self.read_locks.is_empty()
    }

    /// Clone this snapshot with `storage_version` advanced by one, used by
    /// every lock-state or child-set mutation that does not touch `value`.
    #[must_use]
    pub fn with_bumped_storage_version(&self) -> Self {
        let mut next = self.clone();
        next.storage_version += 1;
        next
    }

    /// Clone this snapshot with a new value, advancing both version counters
    /// and `last_write_time`.
    #[must_use]
    pub fn with_value(&self, value: Vec<u8>, now: DateTime<Utc>) -> Self {
        let mut next = self.clone();
        next.value = value;
        next.version += 1;
        next.storage_version += 1;
        next.last_write_time = now;
        next
    }

    /// Clone this snapshot with `write_lock` set to `session`.
    #[must_use]
    pub fn with_write_lock(&self, session: SessionId) -> Self {
        let mut next = self.with_bumped_storage_version();
        next.write_lock = Some(session);
        next.read_locks.clear();
        next
    }

    /// Clone this snapshot with `write_lock` cleared.
    #[must_use]
    pub fn without_write_lock(&self) -> Self {
        let mut next = self.with_bumped_storage_version();
        next.write_lock = None;
        next
    }

    /// Clone this snapshot with `session` added to `read_locks`.
    #[must_use]
    pub fn with_read_lock(&self, session: SessionId) -> Self {
        let mut next = self.with_bumped_storage_version();
        next.read_locks.insert(session);
        next
    }

    /// Clone this snapshot with `session` removed from `read_locks` (and from
    /// `write_lock`, if it happened to hold it — used by the dead-holder
    /// eviction rule in §4.7).
    #[must_use]
    pub fn without_lock_holder(&self, session: SessionId) -> Self {
        let mut next = self.with_bumped_storage_version();
        next.read_locks.remove(&session);
        if next.write_lock == Some(session) {
            next.write_lock = None;
        }
        next
    }

    /// Clone this snapshot with `name` added to `children`.
    #[must_use]
    pub fn with_child(&self, name: impl Into<String>) -> Self {
        let mut next = self.with_bumped_storage_version();
        next.children.insert(name.into());
        next
    }

    /// Clone this snapshot with `name` removed from `children`.
    #[must_use]
    pub fn without_child(&self, name: &str) -> Self {
        let mut next = self.with_bumped_storage_version();
        next.children.remove(name);
        next
    }
}
