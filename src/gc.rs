//! Garbage collector: background reaping of ephemeral entries and session
//! records after the owning session has ended (spec §4.10).
//!
//! Shaped like this codebase's runner background tasks: a single
//! `tokio::task::JoinHandle` sleeping until the next scheduled wakeup,
//! computed as the sooner of the nearest live session's lease expiry or a
//! bounded maximum.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::clock::Clock;
use crate::config::CoordinationConfig;
use crate::error::{CoordinationError, Result};
use crate::lock::LockManager;
use crate::model::session::SessionId;
use crate::session::SessionManager;
use crate::store::{BackingStore, CasOutcome};
use crate::telemetry::{trace_lifecycle_event, LifecycleEvent};

/// Periodically reaps ephemeral entries of sessions observed as ended, then
/// deletes their session records (spec §4.10).
pub struct GarbageCollector {
    store: Arc<dyn BackingStore>,
    clock: Arc<dyn Clock>,
    session_manager: Arc<SessionManager>,
    lock_manager: Arc<LockManager>,
    config: CoordinationConfig,
}

impl GarbageCollector {
    #[must_use]
    pub fn new(
        store: Arc<dyn BackingStore>,
        clock: Arc<dyn Clock>,
        session_manager: Arc<SessionManager>,
        lock_manager: Arc<LockManager>,
        config: CoordinationConfig,
    ) -> Self {
        Self {
            store,
            clock,
            session_manager,
            lock_manager,
            config,
        }
    }

    /// Run one sweep over every stored session. `gc_identity` is the session
    /// this node's GC uses to acquire write-locks while reaping; it must be
    /// alive for the duration of the sweep.
    ///
    /// Returns `(sessions_reaped, entries_reaped)`.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinationError::StoreFailure`] if the backing store
    /// cannot be read.
    #[instrument(skip(self), err)]
    pub async fn sweep_once(&self, gc_identity: SessionId) -> Result<(usize, usize)> {
        let sessions = self
            .store
            .list_sessions()
            .await
            .map_err(|e| CoordinationError::StoreFailure {
                message: e.to_string(),
                attempts: 1,
            })?;

        let mut sessions_reaped = 0;
        let mut entries_reaped = 0;
        let cancellation = CancellationToken::new();

        for session in sessions {
            if self.session_manager.is_alive(session.key).await? {
                continue;
            }

            for path in &session.entries {
                let Some(entry) = self.store.get_entry(path).await.map_err(|e| CoordinationError::StoreFailure {
                    message: e.to_string(),
                    attempts: 1,
                })?
                else {
                    continue;
                };
                if entry.ephemeral_owner != Some(session.key) {
                    continue;
                }
                let acquired = self
                    .lock_manager
                    .acquire_write_lock(path, gc_identity, &cancellation)
                    .await?;
                self.delete_reaped_entry(acquired).await?;
                entries_reaped += 1;
            }

            if self.delete_session_record(session.key).await? {
                sessions_reaped += 1;
            }
        }

        trace_lifecycle_event(&LifecycleEvent::GcSweepCompleted {
            ended_sessions: sessions_reaped,
            reaped_entries: entries_reaped,
        });
        Ok((sessions_reaped, entries_reaped))
    }

    async fn delete_reaped_entry(&self, entry: crate::model::entry::StoredEntry) -> Result<()> {
        let path = entry.path.clone();
        let parent = path.parent();
        match self.store.delete_entry(&entry).await.map_err(|e| CoordinationError::StoreFailure {
            message: e.to_string(),
            attempts: 1,
        })? {
            CasOutcome::Applied(()) => {}
            // Already gone, or raced by another deleter; either way there is
            // nothing left here for this sweep to reap.
            CasOutcome::Conflict(_) => return Ok(()),
        }
        if path.is_root() {
            return Ok(());
        }
        let Some(name) = path.name() else { return Ok(()) };
        let name = name.to_string();

        for _ in 0..self.config.max_retry_attempts {
            let Some(current) = self.store.get_entry(&parent).await.map_err(|e| CoordinationError::StoreFailure {
                message: e.to_string(),
                attempts: 1,
            })?
            else {
                return Ok(());
            };
            match self
                .store
                .try_update_entry(&current, current.without_child(&name))
                .await
                .map_err(|e| CoordinationError::StoreFailure {
                    message: e.to_string(),
                    attempts: 1,
                })? {
                CasOutcome::Applied(_) => return Ok(()),
                CasOutcome::Conflict(None) => return Ok(()),
                CasOutcome::Conflict(Some(_)) => continue,
            }
        }
        Ok(())
    }

    async fn delete_session_record(&self, id: SessionId) -> Result<bool> {
        for _ in 0..self.config.max_retry_attempts {
            let Some(current) = self.store.get_session(id).await.map_err(|e| CoordinationError::StoreFailure {
                message: e.to_string(),
                attempts: 1,
            })?
            else {
                return Ok(false);
            };
            match self.store.delete_session(&current).await.map_err(|e| CoordinationError::StoreFailure {
                message: e.to_string(),
                attempts: 1,
            })? {
                CasOutcome::Applied(()) => return Ok(true),
                CasOutcome::Conflict(None) => return Ok(false),
                CasOutcome::Conflict(Some(_)) => continue,
            }
        }
        Ok(false)
    }

    /// Spawn the periodic sweep loop. Runs until `cancellation` fires.
    pub fn spawn_sweep_loop(self: Arc<Self>, gc_identity: SessionId, cancellation: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                if cancellation.is_cancelled() {
                    return;
                }
                if let Err(err) = self.sweep_once(gc_identity).await {
                    tracing::warn!(target: "pathkeeper::gc", %err, "gc sweep failed");
                }
                let delay = self.next_sweep_delay().await;
                tokio::select! {
                    () = cancellation.cancelled() => return,
                    () = tokio::time::sleep(delay) => {}
                }
            }
        })
    }

    async fn next_sweep_delay(&self) -> std::time::Duration {
        let cap = self.config.gc_max_sweep_interval;
        let Ok(sessions) = self.store.list_sessions().await else {
            return cap;
        };
        let now = self.clock.now();
        let nearest = sessions
            .iter()
            .filter(|s| !s.explicitly_ended && s.lease_end > now)
            .map(|s| s.lease_end - now)
            .min();
        match nearest.and_then(|d| d.to_std().ok()) {
            Some(d) if d < cap => d,
            _ => cap,
        }
    }
}
