//! `StoredSession`: the persisted record backing a client's lease.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::path::Path;

/// Globally unique identifier for a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Generate a fresh, random session id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID, e.g. one recovered from the backing store.
    #[must_use]
    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    /// The canonical string form used as the backing store key.
    #[must_use]
    pub fn as_key(&self) -> String {
        self.0.to_string()
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// An immutable snapshot of a session's lease record.
///
/// # Invariants
///
/// 5. Once a session observes `ended()`, no later snapshot accepted by the
///    store may report `ended() == false`; [`StoredSession::ended`] only
///    ever observes the clock moving forward, so this holds as long as
///    [`StoredSession::explicitly_ended`] is monotonic (never reset by this
///    type) and `lease_end` never regresses once termination is observed.
/// 6. `lease_end` may only move forward for sessions that have not ended
///    (enforced by [`crate::session::SessionManager::renew`], not by this
///    type itself).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredSession {
    pub key: SessionId,
    pub lease_end: DateTime<Utc>,
    pub storage_version: u64,
    pub explicitly_ended: bool,
    pub entries: BTreeSet<Path>,
}

impl StoredSession {
    /// Construct the first snapshot of a freshly allocated session.
    #[must_use]
    pub fn new(key: SessionId, lease_end: DateTime<Utc>) -> Self {
        Self {
            key,
            lease_end,
            storage_version: 1,
            explicitly_ended: false,
            entries: BTreeSet::new(),
        }
    }

    /// Derived liveness: ended if explicitly terminated or the lease has
    /// expired against `now`.
    #[must_use]
    pub fn ended(&self, now: DateTime<Utc>) -> bool {
        self.explicitly_ended || now >= self.lease_end
    }

    /// Clone this snapshot with `lease_end` extended, bumping
    /// `storage_version`. Callers must not invoke this once `ended(now)` is
    /// true (invariant 6); see [`crate::session::SessionManager::renew`].
    #[must_use]
    pub fn with_renewed_lease(&self, new_lease_end: DateTime<Utc>) -> Self {
        let mut next = self.clone();
        next.lease_end = new_lease_end;
        next.storage_version += 1;
        next
    }

    /// Clone this snapshot marked as explicitly ended.
    #[must_use]
    pub fn with_ended(&self) -> Self {
        let mut next = self.clone();
        next.explicitly_ended = true;
        next.storage_version += 1;
        next
    }

    /// Clone this snapshot with `path` added to the ephemeral-entry set.
    #[must_use]
    pub fn with_entry(&self, path: Path) -> Self {
        let mut next = self.clone();
        next.entries.insert(path);
        next.storage_version += 1;
        next
    }

    /// Clone this snapshot with `path` removed from the ephemeral-entry set.
    #[must_use]
    pub fn without_entry(&self, path: &Path) -> Self {
        let mut next = self.clone();
        next.entries.remove(path);
        next.storage_version += 1;
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn ended_follows_lease_expiry() {
        let now = Utc::now();
        let session = StoredSession::new(SessionId::new(), now + Duration::minutes(10));
        assert!(!session.ended(now));
        assert!(session.ended(now + Duration::minutes(11)));
    }

    #[test]
    fn explicit_end_is_immediate() {
        let now = Utc::now();
        let session = StoredSession::new(SessionId::new(), now + Duration::minutes(10)).with_ended();
        assert!(session.ended(now));
    }

    #[test]
    fn session_id_round_trips_through_string() {
        let id = SessionId::new();
        let parsed: SessionId = id.as_key().parse().unwrap();
        assert_eq!(id, parsed);
    }
}
