//! Indexing Activity Queue
//!
//! Append-only log of pending search-index updates. Producers append inside
//! the transaction of the mutation that caused the activity, so activity ids
//! follow commit order. `indexing_activities` uses AUTOINCREMENT, so an id is
//! never issued twice, not even after its row is deleted.
//!
//! Consumers coordinate through the running state and lock time: an activity
//! marked Running must have its lock time refreshed, otherwise another
//! consumer may take it over once `running_timeout` has passed.

use crate::db::database::{
    begin_immediate, finish, format_timestamp, from_millis, parse_timestamp, to_millis,
    DatabaseService,
};
use crate::db::error::{DataError, DatabaseError};
use crate::db::versions::placeholders;
use crate::models::{
    select_executable, ExecutableActivities, IndexingActivity, IndexingActivityRunningState,
    IndexingActivityType,
};
use chrono::{Duration, Utc};
use libsql::{params, Connection, Row};
use std::collections::HashSet;
use std::sync::Arc;

const ACTIVITY_COLUMNS: &str = "indexing_activity_id, activity_type, creation_date, \
     running_state, lock_time, node_id, version_id, path, version_timestamp, extension";

#[derive(Debug, Clone)]
pub struct IndexingActivityQueue {
    db: Arc<DatabaseService>,
}

impl IndexingActivityQueue {
    pub fn new(db: Arc<DatabaseService>) -> Self {
        Self { db }
    }

    /// Append an activity in its own transaction; assigns `activity_id`
    pub async fn append(&self, activity: &mut IndexingActivity) -> Result<(), DataError> {
        let conn = self.db.connect_with_timeout().await?;
        begin_immediate(&conn).await?;
        let result = append_in_tx(&conn, activity).await;
        let activity_id = finish(&conn, result).await?;
        activity.activity_id = activity_id;
        Ok(())
    }

    /// Last id ever issued (0 when none), unaffected by deletions
    pub async fn get_last_activity_id(&self) -> Result<i64, DataError> {
        let conn = self.db.connect_with_timeout().await?;
        let mut rows = conn
            .query(
                "SELECT seq FROM sqlite_sequence WHERE name = 'indexing_activities'",
                (),
            )
            .await
            .map_err(|e| {
                DatabaseError::sql_execution(format!("Failed to read last activity id: {}", e))
            })?;
        match rows.next().await? {
            Some(row) => Ok(row.get(0)?),
            None => Ok(0),
        }
    }

    /// Activities with `from_id <= id <= to_id`, ascending, at most `count`
    pub async fn load_page(
        &self,
        from_id: i64,
        to_id: i64,
        count: usize,
    ) -> Result<Vec<IndexingActivity>, DataError> {
        self.load_range(from_id, to_id, count, false).await
    }

    /// Same as `load_page` restricted to activities that are not Done
    pub async fn load_unprocessed_page(
        &self,
        from_id: i64,
        to_id: i64,
        count: usize,
    ) -> Result<Vec<IndexingActivity>, DataError> {
        self.load_range(from_id, to_id, count, true).await
    }

    async fn load_range(
        &self,
        from_id: i64,
        to_id: i64,
        count: usize,
        unprocessed_only: bool,
    ) -> Result<Vec<IndexingActivity>, DataError> {
        let conn = self.db.connect_with_timeout().await?;
        let sql = format!(
            "SELECT {} FROM indexing_activities
             WHERE indexing_activity_id >= ? AND indexing_activity_id <= ? {}
             ORDER BY indexing_activity_id LIMIT ?",
            ACTIVITY_COLUMNS,
            if unprocessed_only {
                "AND running_state != 2"
            } else {
                ""
            }
        );
        let mut rows = conn
            .query(&sql, [from_id, to_id, count as i64])
            .await
            .map_err(|e| {
                DatabaseError::sql_execution(format!("Failed to load activity page: {}", e))
            })?;
        collect(&mut rows).await
    }

    /// Activities with the given ids, ascending; ids not yet committed are absent
    pub async fn load_gaps(
        &self,
        gaps: &[i64],
        unprocessed_only: bool,
    ) -> Result<Vec<IndexingActivity>, DataError> {
        if gaps.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.db.connect_with_timeout().await?;
        let sql = format!(
            "SELECT {} FROM indexing_activities WHERE indexing_activity_id IN ({}) {}
             ORDER BY indexing_activity_id",
            ACTIVITY_COLUMNS,
            placeholders(gaps.len()),
            if unprocessed_only {
                "AND running_state != 2"
            } else {
                ""
            }
        );
        let values: Vec<libsql::Value> = gaps.iter().map(|id| (*id).into()).collect();
        let mut rows = conn.query(&sql, values).await.map_err(|e| {
            DatabaseError::sql_execution(format!("Failed to load activity gaps: {}", e))
        })?;
        collect(&mut rows).await
    }

    /// Set the running state of one activity; Running also stamps the lock time
    pub async fn update_running_state(
        &self,
        activity_id: i64,
        state: IndexingActivityRunningState,
    ) -> Result<(), DataError> {
        let conn = self.db.connect_with_timeout().await?;
        let lock_time = (state == IndexingActivityRunningState::Running)
            .then(|| to_millis(&Utc::now()));
        let affected = conn
            .execute(
                "UPDATE indexing_activities SET running_state = ?, lock_time = COALESCE(?, lock_time)
                 WHERE indexing_activity_id = ?",
                params![state.code(), lock_time, activity_id],
            )
            .await
            .map_err(|e| {
                DatabaseError::sql_execution(format!(
                    "Failed to update activity {}: {}",
                    activity_id, e
                ))
            })?;
        if affected == 0 {
            return Err(DataError::not_found(format!("Indexing activity {}", activity_id)));
        }
        Ok(())
    }

    /// Mark activities Running with a fresh lock time
    pub async fn mark_running(&self, activity_ids: &[i64]) -> Result<(), DataError> {
        self.set_running_with_lock_time(activity_ids, false).await
    }

    /// Renew the lock time of activities the caller is still working on
    pub async fn refresh_lock_time(&self, activity_ids: &[i64]) -> Result<(), DataError> {
        self.set_running_with_lock_time(activity_ids, true).await
    }

    async fn set_running_with_lock_time(
        &self,
        activity_ids: &[i64],
        running_only: bool,
    ) -> Result<(), DataError> {
        if activity_ids.is_empty() {
            return Ok(());
        }
        let conn = self.db.connect_with_timeout().await?;
        let sql = format!(
            "UPDATE indexing_activities SET running_state = 1, lock_time = ?
             WHERE indexing_activity_id IN ({}) {}",
            placeholders(activity_ids.len()),
            if running_only {
                "AND running_state = 1"
            } else {
                "AND running_state != 2"
            }
        );
        let mut values: Vec<libsql::Value> = vec![to_millis(&Utc::now()).into()];
        values.extend(activity_ids.iter().map(|id| libsql::Value::from(*id)));
        conn.execute(&sql, values).await.map_err(|e| {
            DatabaseError::sql_execution(format!("Failed to lock activities: {}", e))
        })?;
        Ok(())
    }

    /// Start the next batch of activities that may run now
    ///
    /// Selection, marking and the finished-id report happen in one transaction,
    /// so two consumers never receive the same activity.
    pub async fn load_executable_activities(
        &self,
        max_count: usize,
        running_timeout: Duration,
        waiting_activity_ids: &[i64],
    ) -> Result<ExecutableActivities, DataError> {
        let conn = self.db.connect_with_timeout().await?;
        begin_immediate(&conn).await?;
        let result =
            load_executable_in_tx(&conn, max_count, running_timeout, waiting_activity_ids).await;
        finish(&conn, result).await
    }

    /// Delete every Done activity; returns the number removed
    pub async fn delete_finished(&self) -> Result<u64, DataError> {
        let conn = self.db.connect_with_timeout().await?;
        let deleted = conn
            .execute("DELETE FROM indexing_activities WHERE running_state = 2", ())
            .await
            .map_err(|e| {
                DatabaseError::sql_execution(format!("Failed to delete finished activities: {}", e))
            })?;
        tracing::debug!("Deleted {} finished indexing activities", deleted);
        Ok(deleted)
    }

    /// Delete every activity; ids keep increasing afterwards
    pub async fn delete_all(&self) -> Result<u64, DataError> {
        let conn = self.db.connect_with_timeout().await?;
        let deleted = conn
            .execute("DELETE FROM indexing_activities", ())
            .await
            .map_err(|e| {
                DatabaseError::sql_execution(format!("Failed to delete activities: {}", e))
            })?;
        Ok(deleted)
    }
}

/// Append inside the caller's transaction; returns the new id
pub(crate) async fn append_in_tx(
    conn: &Connection,
    activity: &IndexingActivity,
) -> Result<i64, DataError> {
    conn.execute(
        "INSERT INTO indexing_activities (activity_type, creation_date, running_state,
            lock_time, node_id, version_id, path, version_timestamp, extension)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            activity.activity_type.code(),
            format_timestamp(&activity.creation_date),
            activity.running_state.code(),
            activity.lock_time.as_ref().map(to_millis),
            activity.node_id,
            activity.version_id,
            activity.path.as_str(),
            activity.version_timestamp,
            activity.extension.clone(),
        ],
    )
    .await
    .map_err(|e| {
        DatabaseError::sql_execution(format!(
            "Failed to append {} activity for node {}: {}",
            activity.activity_type, activity.node_id, e
        ))
    })?;
    let activity_id = conn.last_insert_rowid();
    tracing::debug!(
        "Queued indexing activity {} ({} node {} at {})",
        activity_id,
        activity.activity_type,
        activity.node_id,
        activity.path
    );
    Ok(activity_id)
}

/// Build and append an activity inside the caller's transaction
pub(crate) async fn enqueue_in_tx(
    conn: &Connection,
    activity_type: IndexingActivityType,
    node_id: i64,
    version_id: i64,
    path: &str,
    version_timestamp: Option<i64>,
) -> Result<i64, DataError> {
    let mut activity = IndexingActivity::new(activity_type, node_id, version_id, path);
    activity.version_timestamp = version_timestamp;
    append_in_tx(conn, &activity).await
}

async fn load_executable_in_tx(
    conn: &Connection,
    max_count: usize,
    running_timeout: Duration,
    waiting_activity_ids: &[i64],
) -> Result<ExecutableActivities, DataError> {
    let sql = format!(
        "SELECT {} FROM indexing_activities WHERE running_state != 2
         ORDER BY indexing_activity_id",
        ACTIVITY_COLUMNS
    );
    let mut rows = conn.query(&sql, ()).await.map_err(|e| {
        DatabaseError::sql_execution(format!("Failed to load unfinished activities: {}", e))
    })?;
    let unfinished = collect(&mut rows).await?;

    let now = Utc::now();
    let selected: HashSet<i64> = select_executable(&unfinished, max_count, now, running_timeout)
        .into_iter()
        .collect();

    let mut activities = Vec::with_capacity(selected.len());
    for mut activity in unfinished.iter().cloned() {
        if !selected.contains(&activity.activity_id) {
            continue;
        }
        if activity.running_state == IndexingActivityRunningState::Running {
            tracing::warn!(
                "Taking over indexing activity {}: lock expired",
                activity.activity_id
            );
        }
        conn.execute(
            "UPDATE indexing_activities SET running_state = 1, lock_time = ?
             WHERE indexing_activity_id = ?",
            [to_millis(&now), activity.activity_id],
        )
        .await
        .map_err(|e| {
            DatabaseError::sql_execution(format!(
                "Failed to start activity {}: {}",
                activity.activity_id, e
            ))
        })?;
        activity.running_state = IndexingActivityRunningState::Running;
        activity.lock_time = Some(now);
        activities.push(activity);
    }

    let unfinished_ids: HashSet<i64> = unfinished.iter().map(|a| a.activity_id).collect();
    let finished_activity_ids = waiting_activity_ids
        .iter()
        .copied()
        .filter(|id| !unfinished_ids.contains(id))
        .collect();

    Ok(ExecutableActivities {
        activities,
        finished_activity_ids,
    })
}

async fn collect(rows: &mut libsql::Rows) -> Result<Vec<IndexingActivity>, DataError> {
    let mut activities = Vec::new();
    while let Some(row) = rows.next().await? {
        activities.push(row_to_activity(&row)?);
    }
    Ok(activities)
}

fn row_to_activity(row: &Row) -> Result<IndexingActivity, DataError> {
    let type_code: i64 = row.get(1)?;
    let activity_type = IndexingActivityType::from_code(type_code).ok_or_else(|| {
        DatabaseError::sql_execution(format!("Unknown activity type code {}", type_code))
    })?;
    let state_code: i64 = row.get(3)?;
    let running_state = IndexingActivityRunningState::from_code(state_code).ok_or_else(|| {
        DatabaseError::sql_execution(format!("Unknown running state code {}", state_code))
    })?;
    let creation_date: String = row.get(2)?;
    let lock_time: Option<i64> = row.get(4)?;

    Ok(IndexingActivity {
        activity_id: row.get(0)?,
        activity_type,
        creation_date: parse_timestamp(&creation_date)?,
        running_state,
        lock_time: lock_time.map(from_millis),
        node_id: row.get(5)?,
        version_id: row.get(6)?,
        path: row.get(7)?,
        version_timestamp: row.get(8)?,
        extension: row.get(9)?,
    })
}
