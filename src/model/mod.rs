//! The data model: paths, stored entries, and stored sessions.
//!
//! Everything here is an immutable snapshot type. Mutation is always
//! expressed as a pure `snapshot -> snapshot'` function; only
//! [`crate::store::BackingStore`] decides whether a given `snapshot'` is
//! accepted, via compare-and-swap on `storage_version`.

pub mod entry;
pub mod path;
pub mod session;

pub use entry::{CreateMode, StoredEntry};
pub use path::{Path, PathError, PathSegment};
pub use session::{SessionId, StoredSession};
