//! Session allocation, lease renewal, and termination tracking.
//!
//! Mirrors this codebase's `AppRunner`: an `Arc`-shared manager whose async
//! methods are `#[instrument]`-annotated and whose background lease-renewal
//! loop is an owned `tokio::task::JoinHandle`, the same shape as the
//! checkpoint-flush tasks `AppRunner` spawns around long steps.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::instrument;

use crate::clock::Clock;
use crate::config::CoordinationConfig;
use crate::error::{CoordinationError, Result};
use crate::model::path::Path;
use crate::model::session::{SessionId, StoredSession};
use crate::store::{BackingStore, CasOutcome};
use crate::telemetry::{trace_lifecycle_event, LifecycleEvent};

/// Allocates sessions, renews the local session's lease, and tracks
/// termination (spec §4.3).
pub struct SessionManager {
    store: Arc<dyn BackingStore>,
    clock: Arc<dyn Clock>,
    config: CoordinationConfig,
}

/// A handle to a session owned by this process: its id, a live-updated
/// termination signal, and the background renewal task keeping its lease
/// alive.
pub struct OwnedSession {
    pub id: SessionId,
    ended: watch::Receiver<bool>,
    renewal_task: JoinHandle<()>,
}

impl OwnedSession {
    /// `true` once this session has observed termination (remote end, lease
    /// expiry, or local shutdown).
    #[must_use]
    pub fn is_ended(&self) -> bool {
        *self.ended.borrow()
    }

    /// Resolves once the session has ended.
    pub async fn wait_for_termination(&mut self) {
        let _ = self.ended.wait_for(|ended| *ended).await;
    }
}

impl Drop for OwnedSession {
    fn drop(&mut self) {
        self.renewal_task.abort();
    }
}

impl SessionManager {
    #[must_use]
    pub fn new(store: Arc<dyn BackingStore>, clock: Arc<dyn Clock>, config: CoordinationConfig) -> Self {
        Self { store, clock, config }
    }

    /// Allocate a new session and start its background renewal loop.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinationError::StoreFailure`] if creation does not
    /// succeed within `config.max_retry_attempts`.
    #[instrument(skip(self), err)]
    pub async fn allocate(self: &Arc<Self>) -> Result<OwnedSession> {
        let id = SessionId::new();
        let now = self.clock.now();
        let session = StoredSession::new(id, now + self.config.session_lease_duration);

        for attempt in 0..self.config.max_retry_attempts {
            match self
                .store
                .try_create_session(session.clone())
                .await
                .map_err(|e| CoordinationError::StoreFailure {
                    message: e.to_string(),
                    attempts: attempt + 1,
                })? {
                CasOutcome::Applied(_) => {
                    trace_lifecycle_event(&LifecycleEvent::SessionCreated { session: id });
                    let (tx, rx) = watch::channel(false);
                    let renewal_task = self.clone().spawn_renewal_loop(id, tx);
                    return Ok(OwnedSession {
                        id,
                        ended: rx,
                        renewal_task,
                    });
                }
                CasOutcome::Conflict(_) => continue,
            }
        }
        Err(CoordinationError::StoreFailure {
            message: "exhausted retries allocating session id".into(),
            attempts: self.config.max_retry_attempts,
        })
    }

    /// `true` if the session is still alive: not explicitly ended and not
    /// past its lease, or unknown to the store (treated as not alive).
    #[instrument(skip(self), err)]
    pub async fn is_alive(&self, id: SessionId) -> Result<bool> {
        let stored = self
            .store
            .get_session(id)
            .await
            .map_err(|e| CoordinationError::StoreFailure {
                message: e.to_string(),
                attempts: 1,
            })?;
        Ok(stored.is_some_and(|s| !s.ended(self.clock.now())))
    }

    /// Extend `id`'s lease, retrying against fresh state on CAS conflict.
    ///
    /// Returns `Ok(false)` without error if the session has already ended;
    /// callers should treat this as terminal rather than retry.
    #[instrument(skip(self), err)]
    pub async fn renew(&self, id: SessionId) -> Result<bool> {
        let now = self.clock.now();
        for attempt in 0..self.config.max_retry_attempts {
            let current = self
                .store
                .get_session(id)
                .await
                .map_err(|e| CoordinationError::StoreFailure {
                    message: e.to_string(),
                    attempts: attempt + 1,
                })?;
            let Some(current) = current else { return Ok(false) };
            if current.ended(now) {
                return Ok(false);
            }
            let renewed = current.with_renewed_lease(now + self.config.session_lease_duration);
            match self
                .store
                .try_update_session(&current, renewed)
                .await
                .map_err(|e| CoordinationError::StoreFailure {
                    message: e.to_string(),
                    attempts: attempt + 1,
                })? {
                CasOutcome::Applied(_) => {
                    trace_lifecycle_event(&LifecycleEvent::SessionRenewed { session: id });
                    return Ok(true);
                }
                CasOutcome::Conflict(None) => return Ok(false),
                CasOutcome::Conflict(Some(_)) => continue,
            }
        }
        Err(CoordinationError::StoreFailure {
            message: "exhausted retries renewing session".into(),
            attempts: self.config.max_retry_attempts,
        })
    }

    /// Mark `id` as explicitly ended, retrying on CAS conflict.
    #[instrument(skip(self), err)]
    pub async fn end(&self, id: SessionId) -> Result<()> {
        for attempt in 0..self.config.max_retry_attempts {
            let Some(current) = self
                .store
                .get_session(id)
                .await
                .map_err(|e| CoordinationError::StoreFailure {
                    message: e.to_string(),
                    attempts: attempt + 1,
                })?
            else {
                return Ok(());
            };
            if current.explicitly_ended {
                return Ok(());
            }
            match self
                .store
                .try_update_session(&current, current.with_ended())
                .await
                .map_err(|e| CoordinationError::StoreFailure {
                    message: e.to_string(),
                    attempts: attempt + 1,
                })? {
                CasOutcome::Applied(_) => {
                    trace_lifecycle_event(&LifecycleEvent::SessionEnded { session: id });
                    return Ok(());
                }
                CasOutcome::Conflict(None) => return Ok(()),
                CasOutcome::Conflict(Some(_)) => continue,
            }
        }
        Err(CoordinationError::StoreFailure {
            message: "exhausted retries ending session".into(),
            attempts: self.config.max_retry_attempts,
        })
    }

    /// Add `path` to `id`'s ephemeral-entry set, retrying on CAS conflict.
    /// Used by [`crate::coordination::CoordinationService::create`] when
    /// creating an ephemeral entry.
    #[instrument(skip(self), err)]
    pub async fn link_entry(&self, id: SessionId, path: Path) -> Result<()> {
        self.mutate_entries(id, |s| s.with_entry(path.clone())).await
    }

    /// Remove `path` from `id`'s ephemeral-entry set, retrying on CAS
    /// conflict. Used by
    /// [`crate::coordination::CoordinationService::delete`] when an
    /// ephemeral entry is removed before its owning session ends.
    #[instrument(skip(self), err)]
    pub async fn unlink_entry(&self, id: SessionId, path: &Path) -> Result<()> {
        self.mutate_entries(id, |s| s.without_entry(path)).await
    }

    async fn mutate_entries(&self, id: SessionId, mutate: impl Fn(&StoredSession) -> StoredSession) -> Result<()> {
        for attempt in 0..self.config.max_retry_attempts {
            let Some(current) = self
                .store
                .get_session(id)
                .await
                .map_err(|e| CoordinationError::StoreFailure {
                    message: e.to_string(),
                    attempts: attempt + 1,
                })?
            else {
                return Ok(());
            };
            match self
                .store
                .try_update_session(&current, mutate(&current))
                .await
                .map_err(|e| CoordinationError::StoreFailure {
                    message: e.to_string(),
                    attempts: attempt + 1,
                })? {
                CasOutcome::Applied(_) => return Ok(()),
                CasOutcome::Conflict(None) => return Ok(()),
                CasOutcome::Conflict(Some(_)) => continue,
            }
        }
        Err(CoordinationError::StoreFailure {
            message: "exhausted retries updating session entry set".into(),
            attempts: self.config.max_retry_attempts,
        })
    }

    fn spawn_renewal_loop(self: Arc<Self>, id: SessionId, ended_tx: watch::Sender<bool>) -> JoinHandle<()> {
        let interval = self.config.session_renew_interval;
        let safety_margin = self.config.session_renew_safety_margin;
        tokio::spawn(async move {
            let mut backoff = self.config.reconnect_backoff_initial;
            loop {
                tokio::time::sleep(interval).await;
                match self.renew(id).await {
                    Ok(true) => {
                        backoff = self.config.reconnect_backoff_initial;
                    }
                    Ok(false) => {
                        let _ = ended_tx.send(true);
                        return;
                    }
                    Err(_) => {
                        let Ok(Some(stored)) = self.store.get_session(id).await else {
                            let _ = ended_tx.send(true);
                            return;
                        };
                        let deadline = stored.lease_end - chrono::Duration::from_std(safety_margin).unwrap_or_default();
                        if self.clock.now() >= deadline {
                            let _ = ended_tx.send(true);
                            return;
                        }
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(self.config.reconnect_backoff_max);
                    }
                }
            }
        })
    }
}
