//! Human-readable rendering of coordination lifecycle events.
//!
//! Every state transition in [`crate::lock`], [`crate::session`], and
//! [`crate::gc`] is also emitted as a `tracing` event at an appropriate
//! level; this module additionally renders a [`LifecycleEvent`] into plain
//! text for callers that want a readable log line without configuring a
//! `tracing` subscriber (e.g. a `MemorySink`-style test harness).

use std::fmt;

use crate::model::path::Path;
use crate::model::session::SessionId;

/// A notable transition in the life of an entry, a lock, or a session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LifecycleEvent {
    WriteLockAcquired { path: Path, session: SessionId },
    WriteLockReleased { path: Path, session: SessionId },
    ReadLockAcquired { path: Path, session: SessionId },
    ReadLockReleased { path: Path, session: SessionId },
    CacheInvalidated { path: Path, session: SessionId },
    SessionCreated { session: SessionId },
    SessionRenewed { session: SessionId },
    SessionEnded { session: SessionId },
    GcSweepCompleted { ended_sessions: usize, reaped_entries: usize },
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleEvent::WriteLockAcquired { path, session } => {
                write!(f, "write-lock acquired on {path} by {session}")
            }
            LifecycleEvent::WriteLockReleased { path, session } => {
                write!(f, "write-lock released on {path} by {session}")
            }
            LifecycleEvent::ReadLockAcquired { path, session } => {
                write!(f, "read-lock acquired on {path} by {session}")
            }
            LifecycleEvent::ReadLockReleased { path, session } => {
                write!(f, "read-lock released on {path} by {session}")
            }
            LifecycleEvent::CacheInvalidated { path, session } => {
                write!(f, "cache invalidated for {path} (requested for {session})")
            }
            LifecycleEvent::SessionCreated { session } => write!(f, "session {session} created"),
            LifecycleEvent::SessionRenewed { session } => write!(f, "session {session} renewed"),
            LifecycleEvent::SessionEnded { session } => write!(f, "session {session} ended"),
            LifecycleEvent::GcSweepCompleted {
                ended_sessions,
                reaped_entries,
            } => write!(
                f,
                "gc sweep: {ended_sessions} session(s) reaped, {reaped_entries} ephemeral entr(y/ies) removed"
            ),
        }
    }
}

/// Rendered output for a lifecycle event, ready for a plain sink.
#[derive(Clone, Debug, Default)]
pub struct EventRender {
    pub scope: Option<String>,
    pub line: String,
}

/// Strategy for rendering a [`LifecycleEvent`] into text.
pub trait TelemetryFormatter: Send + Sync {
    fn render(&self, event: &LifecycleEvent) -> EventRender;
}

/// A formatter with no color codes, suitable for log files and CI output.
#[derive(Clone, Copy, Debug, Default)]
pub struct PlainFormatter;

impl TelemetryFormatter for PlainFormatter {
    fn render(&self, event: &LifecycleEvent) -> EventRender {
        EventRender {
            scope: Some(scope_label(event).to_string()),
            line: format!("{event}\n"),
        }
    }
}

fn scope_label(event: &LifecycleEvent) -> &'static str {
    match event {
        LifecycleEvent::WriteLockAcquired { .. }
        | LifecycleEvent::WriteLockReleased { .. }
        | LifecycleEvent::ReadLockAcquired { .. }
        | LifecycleEvent::ReadLockReleased { .. }
        | LifecycleEvent::CacheInvalidated { .. } => "lock",
        LifecycleEvent::SessionCreated { .. }
        | LifecycleEvent::SessionRenewed { .. }
        | LifecycleEvent::SessionEnded { .. } => "session",
        LifecycleEvent::GcSweepCompleted { .. } => "gc",
    }
}

/// Emit a [`LifecycleEvent`] as a structured `tracing` event at an
/// appropriate level, tagged with the `pathkeeper::lifecycle` target.
pub fn trace_lifecycle_event(event: &LifecycleEvent) {
    match event {
        LifecycleEvent::GcSweepCompleted { .. } | LifecycleEvent::SessionEnded { .. } => {
            tracing::info!(target: "pathkeeper::lifecycle", %event, "lifecycle event");
        }
        _ => {
            tracing::debug!(target: "pathkeeper::lifecycle", %event, "lifecycle event");
        }
    }
}
