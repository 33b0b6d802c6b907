//! Tree Lock
//!
//! Lease-based mutual exclusion over path prefixes. A lock covers its path and
//! every path beneath it; two live locks may never overlap. Locks expire on
//! their own after the lease elapses without renewal, so a crashed holder
//! cannot wedge the tree.
//!
//! Locks are not reentrant: a holder asking again for an overlapping path is
//! refused like anybody else.

use crate::db::database::{begin_immediate, finish, from_millis, to_millis, DatabaseService};
use crate::db::error::{DataError, DatabaseError};
use crate::models::{normalize_path, paths_overlap, TreeLock};
use chrono::{Duration, Utc};
use libsql::{params, Connection};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct TreeLockStore {
    db: Arc<DatabaseService>,
}

impl TreeLockStore {
    pub fn new(db: Arc<DatabaseService>) -> Self {
        Self { db }
    }

    /// Lock every path in one atomic step; returns the shared token
    ///
    /// Fails with `LockedByOther` when any path overlaps a live lock.
    pub async fn acquire(&self, paths: &[&str], timeout: Duration) -> Result<String, DataError> {
        if paths.is_empty() {
            return Err(DataError::invalid_operation("No path to lock"));
        }
        let paths: Vec<String> = paths.iter().map(|p| normalize_path(p)).collect();
        let token = Uuid::new_v4().to_string();

        let conn = self.db.connect_with_timeout().await?;
        begin_immediate(&conn).await?;
        let result = acquire_in_tx(&conn, &token, &paths, timeout).await;
        finish(&conn, result).await?;

        tracing::info!("Tree lock {} acquired on {:?}", token, paths);
        Ok(token)
    }

    /// Delete the records of a token; returns whether anything was held
    pub async fn release(&self, token: &str) -> Result<bool, DataError> {
        let conn = self.db.connect_with_timeout().await?;
        let affected = conn
            .execute("DELETE FROM tree_locks WHERE token = ?", [token])
            .await
            .map_err(|e| {
                DatabaseError::sql_execution(format!(
                    "Failed to release tree lock {}: {}",
                    token, e
                ))
            })?;
        tracing::info!("Tree lock {} released ({} paths)", token, affected);
        Ok(affected > 0)
    }

    /// Release without failing the caller; used after structural operations
    pub(crate) async fn release_quietly(&self, token: &str) {
        if let Err(e) = self.release(token).await {
            tracing::warn!(
                "Failed to release tree lock {}, it will expire on its own: {}",
                token,
                e
            );
        }
    }

    /// Extend a live lock's lease by `timeout` from now
    ///
    /// An expired or released token cannot be renewed (`NotFound`).
    pub async fn refresh(&self, token: &str, timeout: Duration) -> Result<(), DataError> {
        let now = Utc::now();
        let conn = self.db.connect_with_timeout().await?;
        let affected = conn
            .execute(
                "UPDATE tree_locks SET expires_at = ? WHERE token = ? AND expires_at > ?",
                params![to_millis(&(now + timeout)), token, to_millis(&now)],
            )
            .await
            .map_err(|e| {
                DatabaseError::sql_execution(format!(
                    "Failed to refresh tree lock {}: {}",
                    token, e
                ))
            })?;
        if affected == 0 {
            return Err(DataError::not_found(format!("Tree lock {}", token)));
        }
        tracing::debug!("Tree lock {} refreshed", token);
        Ok(())
    }

    /// Every live lock, ordered by id
    pub async fn load_all(&self) -> Result<Vec<TreeLock>, DataError> {
        let conn = self.db.connect_with_timeout().await?;
        load_live_in(&conn).await
    }

    /// Whether a live lock overlaps `path`
    pub async fn is_locked(&self, path: &str) -> Result<bool, DataError> {
        let path = normalize_path(path);
        Ok(self
            .load_all()
            .await?
            .iter()
            .any(|lock| paths_overlap(&lock.path, &path)))
    }
}

async fn acquire_in_tx(
    conn: &Connection,
    token: &str,
    paths: &[String],
    timeout: Duration,
) -> Result<(), DataError> {
    let now = Utc::now();
    let purged = conn
        .execute(
            "DELETE FROM tree_locks WHERE expires_at <= ?",
            [to_millis(&now)],
        )
        .await
        .map_err(|e| {
            DatabaseError::sql_execution(format!("Failed to purge expired tree locks: {}", e))
        })?;
    if purged > 0 {
        tracing::debug!("Purged {} expired tree lock records", purged);
    }

    for held in load_live_in(conn).await? {
        if let Some(path) = paths.iter().find(|p| paths_overlap(p, &held.path)) {
            return Err(DataError::locked_by_other(path.clone(), held.path));
        }
    }

    let expires_at = now + timeout;
    for path in paths {
        conn.execute(
            "INSERT INTO tree_locks (token, path, locked_at, expires_at) VALUES (?, ?, ?, ?)",
            params![token, path.as_str(), to_millis(&now), to_millis(&expires_at)],
        )
        .await
        .map_err(|e| {
            DatabaseError::sql_execution(format!("Failed to lock {}: {}", path, e))
        })?;
    }
    Ok(())
}

async fn load_live_in(conn: &Connection) -> Result<Vec<TreeLock>, DataError> {
    let mut rows = conn
        .query(
            "SELECT tree_lock_id, token, path, locked_at, expires_at FROM tree_locks
             WHERE expires_at > ? ORDER BY tree_lock_id",
            [to_millis(&Utc::now())],
        )
        .await
        .map_err(|e| DatabaseError::sql_execution(format!("Failed to load tree locks: {}", e)))?;
    let mut locks = Vec::new();
    while let Some(row) = rows.next().await? {
        locks.push(TreeLock {
            lock_id: row.get(0)?,
            token: row.get(1)?,
            path: row.get(2)?,
            locked_at: from_millis(row.get(3)?),
            expires_at: from_millis(row.get(4)?),
        });
    }
    Ok(locks)
}
