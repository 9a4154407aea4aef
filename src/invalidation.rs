//! Invalidation callback directory: local subscribers notified when a cached
//! path is written elsewhere (spec §4.5).
//!
//! The registry shape follows `event_bus::sink`'s `EventSink` trait-object
//! registry; fan-out on `invoke` follows `event_bus::hub::EventStream`'s use
//! of `futures_util` combinators rather than a hand-rolled loop.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::join_all;
use parking_lot::RwLock;

use crate::model::path::Path;

/// A subscriber notified when its registered path is invalidated.
#[async_trait]
pub trait InvalidationCallback: Send + Sync {
    async fn invoke(&self, path: &Path) -> Result<(), CallbackError>;
}

/// Error returned by an [`InvalidationCallback`]. Reported but never
/// prevents sibling callbacks from running.
#[derive(Debug)]
pub struct CallbackError(pub String);

impl fmt::Display for CallbackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalidation callback failed: {}", self.0)
    }
}

impl std::error::Error for CallbackError {}

/// Opaque handle returned by [`InvalidationDirectory::register`], used to
/// idempotently unregister the same subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CallbackHandle(u64);

struct Registration {
    handle: CallbackHandle,
    callback: Arc<dyn InvalidationCallback>,
}

/// Registry of local cache-invalidation subscribers, keyed by path.
#[derive(Default)]
pub struct InvalidationDirectory {
    subscribers: RwLock<HashMap<Path, Vec<Registration>>>,
    next_id: AtomicU64,
}

impl InvalidationDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe `callback` to invalidations of `path`. Idempotent: each
    /// call returns a distinct handle that can be unregistered independently.
    pub fn register(&self, path: Path, callback: Arc<dyn InvalidationCallback>) -> CallbackHandle {
        let handle = CallbackHandle(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers
            .write()
            .entry(path)
            .or_default()
            .push(Registration { handle, callback });
        handle
    }

    /// Remove a previously registered subscription. A no-op if `handle` is
    /// unknown or already unregistered.
    pub fn unregister(&self, path: &Path, handle: CallbackHandle) {
        let mut subscribers = self.subscribers.write();
        if let Some(registrations) = subscribers.get_mut(path) {
            registrations.retain(|r| r.handle != handle);
            if registrations.is_empty() {
                subscribers.remove(path);
            }
        }
    }

    /// Invoke every subscriber registered for `path` concurrently. The
    /// aggregate completes when every callback completes or fails;
    /// individual failures are logged but do not block the rest.
    pub async fn invoke(&self, path: &Path) {
        let callbacks: Vec<Arc<dyn InvalidationCallback>> = self
            .subscribers
            .read()
            .get(path)
            .map(|regs| regs.iter().map(|r| Arc::clone(&r.callback)).collect())
            .unwrap_or_default();

        if callbacks.is_empty() {
            return;
        }

        let results = join_all(callbacks.iter().map(|cb| cb.invoke(path))).await;
        for result in results {
            if let Err(err) = result {
                tracing::warn!(target: "pathkeeper::invalidation", %path, error = %err, "invalidation callback failed");
            }
        }
    }
}
