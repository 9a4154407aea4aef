//! Error types returned by the coordination core.
//!
//! Every public operation returns a typed [`Result`] rather than panicking.
//! Transient store and transport failures are retried internally up to a
//! bounded budget (see [`crate::config::CoordinationConfig`]); once that
//! budget is exhausted the error surfaces here and any locks the caller's
//! operation held are released before it returns.

use thiserror::Error;

#[cfg(feature = "diagnostics")]
use miette::Diagnostic;

use crate::model::path::Path;

/// Errors produced by the coordination core.
#[derive(Debug, Error)]
#[cfg_attr(feature = "diagnostics", derive(Diagnostic))]
pub enum CoordinationError {
    /// `create` of a path that already exists.
    #[error("entry already exists: {path}")]
    #[cfg_attr(
        feature = "diagnostics",
        diagnostic(
            code(pathkeeper::duplicate_entry),
            help("choose a different path, or delete the existing entry first")
        )
    )]
    DuplicateEntry { path: Path },

    /// `get` / `set_value` / `delete` of a path that does not exist.
    #[error("entry not found: {path}")]
    #[cfg_attr(
        feature = "diagnostics",
        diagnostic(code(pathkeeper::entry_not_found), help("verify the path was created and has not been deleted or expired"))
    )]
    EntryNotFound { path: Path },

    /// `create` beneath a parent that does not exist (root is exempt).
    #[error("parent not found for: {path}")]
    #[cfg_attr(
        feature = "diagnostics",
        diagnostic(code(pathkeeper::parent_not_found), help("create the parent path first"))
    )]
    ParentNotFound { path: Path },

    /// `set_value` supplied an `expected_version` that did not match the
    /// stored version.
    #[error("version conflict on {path}: expected {expected}, found {actual}")]
    #[cfg_attr(
        feature = "diagnostics",
        diagnostic(code(pathkeeper::version_conflict), help("re-read the entry and retry with its current version"))
    )]
    VersionConflict {
        path: Path,
        expected: u64,
        actual: u64,
    },

    /// The local session used to drive an operation is no longer live.
    #[error("session has ended")]
    #[cfg_attr(
        feature = "diagnostics",
        diagnostic(code(pathkeeper::session_ended), help("allocate a new session via SessionManager::create_session"))
    )]
    SessionEnded,

    /// The operation's cancellation token fired before it completed.
    #[error("operation cancelled")]
    #[cfg_attr(feature = "diagnostics", diagnostic(code(pathkeeper::cancelled)))]
    Cancelled,

    /// The transport could not deliver a message within the retry budget.
    #[error("transport failure: {message}")]
    #[cfg_attr(
        feature = "diagnostics",
        diagnostic(code(pathkeeper::transport_failure), help("check peer connectivity; this was retried {attempts} times before surfacing"))
    )]
    TransportFailure { message: String, attempts: u32 },

    /// The backing store could not be read or written within the retry
    /// budget.
    #[error("store failure: {message}")]
    #[cfg_attr(
        feature = "diagnostics",
        diagnostic(code(pathkeeper::store_failure), help("check backing store connectivity and permissions; this was retried {attempts} times before surfacing"))
    )]
    StoreFailure { message: String, attempts: u32 },
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, CoordinationError>;
