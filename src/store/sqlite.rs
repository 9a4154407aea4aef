//! Durable [`BackingStore`] backed by SQLite.
//!
//! Grounded on this codebase's `SQLiteCheckpointer`: a shared `SqlitePool`,
//! embedded migrations run on connect, and `#[instrument(..., err)]`
//! annotated async methods. Compare-and-swap is implemented as an
//! `UPDATE ... WHERE storage_version = ?` whose affected-row count decides
//! `Applied` vs. `Conflict`, wrapped in an explicit transaction so the
//! post-conflict re-read observes a consistent snapshot.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::instrument;

use crate::model::entry::StoredEntry;
use crate::model::path::Path;
use crate::model::session::{SessionId, StoredSession};

use super::{BackingStore, CasOutcome, Result, StoreError};

/// SQLite-backed [`BackingStore`].
///
/// Durable across restarts; suitable for a single coordination node. Nothing
/// in this type handles replication across nodes (spec §1 Non-goals).
pub struct SqliteStore {
    pool: Arc<SqlitePool>,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").finish()
    }
}

impl SqliteStore {
    /// Connect (or create) a SQLite database at `database_url`, e.g.
    /// `"sqlite://pathkeeper.db"`, running embedded migrations.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Backend`] if the connection or migration fails.
    #[instrument(skip(database_url))]
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = SqlitePool::connect(database_url)
            .await
            .map_err(|e| StoreError::Backend(format!("connect error: {e}")))?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| StoreError::Backend(format!("migration failure: {e}")))?;
        Ok(Self { pool: Arc::new(pool) })
    }
}

fn entry_from_row(row: &SqliteRow) -> std::result::Result<StoredEntry, StoreError> {
    let path_str: String = row.try_get("path").map_err(sqlx_err)?;
    let read_locks_json: String = row.try_get("read_locks_json").map_err(sqlx_err)?;
    let write_lock_str: Option<String> = row.try_get("write_lock").map_err(sqlx_err)?;
    let children_json: String = row.try_get("children_json").map_err(sqlx_err)?;
    let ephemeral_owner_str: Option<String> = row.try_get("ephemeral_owner").map_err(sqlx_err)?;

    Ok(StoredEntry {
        path: Path::parse(&path_str).map_err(|e| StoreError::Backend(format!("corrupt path: {e}")))?,
        value: row.try_get("value").map_err(sqlx_err)?,
        version: row.try_get::<i64, _>("version").map_err(sqlx_err)? as u64,
        storage_version: row.try_get::<i64, _>("storage_version").map_err(sqlx_err)? as u64,
        read_locks: parse_session_set(&read_locks_json)?,
        write_lock: write_lock_str.map(|s| parse_session_id(&s)).transpose()?,
        creation_time: row.try_get("creation_time").map_err(sqlx_err)?,
        last_write_time: row.try_get("last_write_time").map_err(sqlx_err)?,
        children: serde_json::from_str(&children_json)
            .map_err(|e| StoreError::Backend(format!("corrupt children: {e}")))?,
        ephemeral_owner: ephemeral_owner_str.map(|s| parse_session_id(&s)).transpose()?,
    })
}

fn session_from_row(row: &SqliteRow) -> std::result::Result<StoredSession, StoreError> {
    let key_str: String = row.try_get("key").map_err(sqlx_err)?;
    let entries_json: String = row.try_get("entries_json").map_err(sqlx_err)?;
    let entries: Vec<String> =
        serde_json::from_str(&entries_json).map_err(|e| StoreError::Backend(format!("corrupt entries: {e}")))?;
    let mut parsed_entries = BTreeSet::new();
    for raw in entries {
        parsed_entries.insert(Path::parse(&raw).map_err(|e| StoreError::Backend(format!("corrupt path: {e}")))?);
    }

    Ok(StoredSession {
        key: parse_session_id(&key_str)?,
        lease_end: row.try_get("lease_end").map_err(sqlx_err)?,
        storage_version: row.try_get::<i64, _>("storage_version").map_err(sqlx_err)? as u64,
        explicitly_ended: row.try_get::<i64, _>("explicitly_ended").map_err(sqlx_err)? != 0,
        entries: parsed_entries,
    })
}

fn parse_session_id(s: &str) -> std::result::Result<SessionId, StoreError> {
    s.parse().map_err(|e| StoreError::Backend(format!("corrupt session id: {e}")))
}

fn parse_session_set(json: &str) -> std::result::Result<BTreeSet<SessionId>, StoreError> {
    let raw: Vec<String> = serde_json::from_str(json).map_err(|e| StoreError::Backend(format!("corrupt read_locks: {e}")))?;
    raw.iter().map(|s| parse_session_id(s)).collect()
}

fn sqlx_err(e: sqlx::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

fn children_json(children: &BTreeSet<String>) -> std::result::Result<String, StoreError> {
    serde_json::to_string(children).map_err(|e| StoreError::Backend(e.to_string()))
}

fn read_locks_json(locks: &BTreeSet<SessionId>) -> std::result::Result<String, StoreError> {
    let raw: Vec<String> = locks.iter().map(SessionId::as_key).collect();
    serde_json::to_string(&raw).map_err(|e| StoreError::Backend(e.to_string()))
}

fn entries_json(entries: &BTreeSet<Path>) -> std::result::Result<String, StoreError> {
    let raw: Vec<String> = entries.iter().map(Path::format).collect();
    serde_json::to_string(&raw).map_err(|e| StoreError::Backend(e.to_string()))
}

#[async_trait]
impl BackingStore for SqliteStore {
    #[instrument(skip(self), err)]
    async fn get_entry(&self, path: &Path) -> Result<Option<StoredEntry>> {
        let row = sqlx::query("SELECT * FROM entries WHERE path = ?")
            .bind(path.format())
            .fetch_optional(&*self.pool)
            .await
            .map_err(sqlx_err)?;
        row.as_ref().map(entry_from_row).transpose()
    }

    #[instrument(skip(self), err)]
    async fn get_session(&self, id: SessionId) -> Result<Option<StoredSession>> {
        let row = sqlx::query("SELECT * FROM sessions WHERE key = ?")
            .bind(id.as_key())
            .fetch_optional(&*self.pool)
            .await
            .map_err(sqlx_err)?;
        row.as_ref().map(session_from_row).transpose()
    }

    #[instrument(skip(self, entry), err)]
    async fn try_create_entry(&self, entry: StoredEntry) -> Result<CasOutcome<StoredEntry>> {
        let mut tx = self.pool.begin().await.map_err(sqlx_err)?;
        let existing = sqlx::query("SELECT * FROM entries WHERE path = ?")
            .bind(entry.path.format())
            .fetch_optional(&mut *tx)
            .await
            .map_err(sqlx_err)?;
        if let Some(row) = existing {
            let current = entry_from_row(&row)?;
            tx.commit().await.map_err(sqlx_err)?;
            return Ok(CasOutcome::Conflict(Some(current)));
        }

        sqlx::query(
            "INSERT INTO entries (path, value, version, storage_version, read_locks_json, \
             write_lock, creation_time, last_write_time, children_json, ephemeral_owner) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(entry.path.format())
        .bind(&entry.value)
        .bind(entry.version as i64)
        .bind(entry.storage_version as i64)
        .bind(read_locks_json(&entry.read_locks)?)
        .bind(entry.write_lock.map(|s| s.as_key()))
        .bind(entry.creation_time)
        .bind(entry.last_write_time)
        .bind(children_json(&entry.children)?)
        .bind(entry.ephemeral_owner.map(|s| s.as_key()))
        .execute(&mut *tx)
        .await
        .map_err(sqlx_err)?;
        tx.commit().await.map_err(sqlx_err)?;
        Ok(CasOutcome::Applied(entry))
    }

    #[instrument(skip(self, old, new), err)]
    async fn try_update_entry(&self, old: &StoredEntry, new: StoredEntry) -> Result<CasOutcome<StoredEntry>> {
        let mut tx = self.pool.begin().await.map_err(sqlx_err)?;
        let result = sqlx::query(
            "UPDATE entries SET value = ?, version = ?, storage_version = ?, read_locks_json = ?, \
             write_lock = ?, last_write_time = ?, children_json = ?, ephemeral_owner = ? \
             WHERE path = ? AND storage_version = ?",
        )
        .bind(&new.value)
        .bind(new.version as i64)
        .bind(new.storage_version as i64)
        .bind(read_locks_json(&new.read_locks)?)
        .bind(new.write_lock.map(|s| s.as_key()))
        .bind(new.last_write_time)
        .bind(children_json(&new.children)?)
        .bind(new.ephemeral_owner.map(|s| s.as_key()))
        .bind(old.path.format())
        .bind(old.storage_version as i64)
        .execute(&mut *tx)
        .await
        .map_err(sqlx_err)?;

        if result.rows_affected() == 1 {
            tx.commit().await.map_err(sqlx_err)?;
            return Ok(CasOutcome::Applied(new));
        }

        let current = sqlx::query("SELECT * FROM entries WHERE path = ?")
            .bind(old.path.format())
            .fetch_optional(&mut *tx)
            .await
            .map_err(sqlx_err)?
            .as_ref()
            .map(entry_from_row)
            .transpose()?;
        tx.commit().await.map_err(sqlx_err)?;
        Ok(CasOutcome::Conflict(current))
    }

    #[instrument(skip(self, old), err)]
    async fn delete_entry(&self, old: &StoredEntry) -> Result<CasOutcome<()>> {
        let mut tx = self.pool.begin().await.map_err(sqlx_err)?;
        let result = sqlx::query("DELETE FROM entries WHERE path = ? AND storage_version = ?")
            .bind(old.path.format())
            .bind(old.storage_version as i64)
            .execute(&mut *tx)
            .await
            .map_err(sqlx_err)?;

        if result.rows_affected() == 1 {
            tx.commit().await.map_err(sqlx_err)?;
            return Ok(CasOutcome::Applied(()));
        }

        let still_exists = sqlx::query("SELECT 1 FROM entries WHERE path = ?")
            .bind(old.path.format())
            .fetch_optional(&mut *tx)
            .await
            .map_err(sqlx_err)?
            .is_some();
        tx.commit().await.map_err(sqlx_err)?;
        Ok(CasOutcome::Conflict(if still_exists { Some(()) } else { None }))
    }

    #[instrument(skip(self, session), err)]
    async fn try_create_session(&self, session: StoredSession) -> Result<CasOutcome<StoredSession>> {
        let mut tx = self.pool.begin().await.map_err(sqlx_err)?;
        let existing = sqlx::query("SELECT * FROM sessions WHERE key = ?")
            .bind(session.key.as_key())
            .fetch_optional(&mut *tx)
            .await
            .map_err(sqlx_err)?;
        if let Some(row) = existing {
            let current = session_from_row(&row)?;
            tx.commit().await.map_err(sqlx_err)?;
            return Ok(CasOutcome::Conflict(Some(current)));
        }

        sqlx::query(
            "INSERT INTO sessions (key, lease_end, storage_version, explicitly_ended, entries_json) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(session.key.as_key())
        .bind(session.lease_end)
        .bind(session.storage_version as i64)
        .bind(i64::from(session.explicitly_ended))
        .bind(entries_json(&session.entries)?)
        .execute(&mut *tx)
        .await
        .map_err(sqlx_err)?;
        tx.commit().await.map_err(sqlx_err)?;
        Ok(CasOutcome::Applied(session))
    }

    #[instrument(skip(self, old, new), err)]
    async fn try_update_session(&self, old: &StoredSession, new: StoredSession) -> Result<CasOutcome<StoredSession>> {
        let mut tx = self.pool.begin().await.map_err(sqlx_err)?;
        let result = sqlx::query(
            "UPDATE sessions SET lease_end = ?, storage_version = ?, explicitly_ended = ?, entries_json = ? \
             WHERE key = ? AND storage_version = ?",
        )
        .bind(new.lease_end)
        .bind(new.storage_version as i64)
        .bind(i64::from(new.explicitly_ended))
        .bind(entries_json(&new.entries)?)
        .bind(old.key.as_key())
        .bind(old.storage_version as i64)
        .execute(&mut *tx)
        .await
        .map_err(sqlx_err)?;

        if result.rows_affected() == 1 {
            tx.commit().await.map_err(sqlx_err)?;
            return Ok(CasOutcome::Applied(new));
        }

        let current = sqlx::query("SELECT * FROM sessions WHERE key = ?")
            .bind(old.key.as_key())
            .fetch_optional(&mut *tx)
            .await
            .map_err(sqlx_err)?
            .as_ref()
            .map(session_from_row)
            .transpose()?;
        tx.commit().await.map_err(sqlx_err)?;
        Ok(CasOutcome::Conflict(current))
    }

    #[instrument(skip(self, old), err)]
    async fn delete_session(&self, old: &StoredSession) -> Result<CasOutcome<()>> {
        let mut tx = self.pool.begin().await.map_err(sqlx_err)?;
        let result = sqlx::query("DELETE FROM sessions WHERE key = ? AND storage_version = ?")
            .bind(old.key.as_key())
            .bind(old.storage_version as i64)
            .execute(&mut *tx)
            .await
            .map_err(sqlx_err)?;

        if result.rows_affected() == 1 {
            tx.commit().await.map_err(sqlx_err)?;
            return Ok(CasOutcome::Applied(()));
        }

        let still_exists = sqlx::query("SELECT 1 FROM sessions WHERE key = ?")
            .bind(old.key.as_key())
            .fetch_optional(&mut *tx)
            .await
            .map_err(sqlx_err)?
            .is_some();
        tx.commit().await.map_err(sqlx_err)?;
        Ok(CasOutcome::Conflict(if still_exists { Some(()) } else { None }))
    }

    #[instrument(skip(self), err)]
    async fn list_sessions(&self) -> Result<Vec<StoredSession>> {
        let rows = sqlx::query("SELECT * FROM sessions")
            .fetch_all(&*self.pool)
            .await
            .map_err(sqlx_err)?;
        rows.iter().map(session_from_row).collect()
    }
}
