//! Optimistic Concurrency Tokens
//!
//! Every node and version row carries a `timestamp` token. Writers include the
//! token they last observed in the `WHERE` clause and set a freshly issued one.
//! Zero affected rows means the compare-and-swap failed; [`diagnose_node_write`]
//! and [`diagnose_version_write`] turn that into the precise error.
//!
//! Tokens come from the single-row `timestamp_sequence` table and are issued
//! inside the writer's transaction, so two connections can never receive the
//! same value.

use crate::db::error::{DataError, DatabaseError};
use libsql::Connection;

/// Issue the next token; must run inside a write transaction
pub async fn next_timestamp(conn: &Connection) -> Result<i64, DataError> {
    conn.execute(
        "UPDATE timestamp_sequence SET value = value + 1 WHERE id = 1",
        (),
    )
    .await
    .map_err(|e| DatabaseError::sql_execution(format!("Failed to advance timestamp: {}", e)))?;

    let mut rows = conn
        .query("SELECT value FROM timestamp_sequence WHERE id = 1", ())
        .await
        .map_err(|e| DatabaseError::sql_execution(format!("Failed to read timestamp: {}", e)))?;
    match rows.next().await? {
        Some(row) => Ok(row.get(0)?),
        None => Err(DatabaseError::sql_execution("timestamp_sequence is not seeded").into()),
    }
}

/// Explain why a CAS write on a node row affected nothing
pub async fn diagnose_node_write(conn: &Connection, node_id: i64, expected: i64) -> DataError {
    let mut rows = match conn
        .query(
            "SELECT timestamp, is_deleted FROM nodes WHERE node_id = ?",
            [node_id],
        )
        .await
    {
        Ok(rows) => rows,
        Err(e) => return e.into(),
    };
    match rows.next().await {
        Ok(Some(row)) => {
            let actual: i64 = match row.get(0) {
                Ok(v) => v,
                Err(e) => return e.into(),
            };
            let is_deleted: bool = row.get(1).unwrap_or(false);
            if is_deleted {
                DataError::NodeIsDeleted { node_id }
            } else {
                DataError::node_out_of_date(node_id, expected, actual)
            }
        }
        Ok(None) => DataError::not_found(format!("Node {}", node_id)),
        Err(e) => e.into(),
    }
}

/// Explain why a CAS write on a version row affected nothing
pub async fn diagnose_version_write(
    conn: &Connection,
    version_id: i64,
    expected: i64,
) -> DataError {
    let mut rows = match conn
        .query(
            "SELECT timestamp FROM versions WHERE version_id = ?",
            [version_id],
        )
        .await
    {
        Ok(rows) => rows,
        Err(e) => return e.into(),
    };
    match rows.next().await {
        Ok(Some(row)) => match row.get::<i64>(0) {
            Ok(actual) => DataError::version_out_of_date(version_id, expected, actual),
            Err(e) => e.into(),
        },
        Ok(None) => DataError::not_found(format!("Version {}", version_id)),
        Err(e) => e.into(),
    }
}
