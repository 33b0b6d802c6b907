//! Version Store
//!
//! CRUD over `versions` rows. Writes are exposed as `*_in_tx` functions that
//! run on a connection already inside a transaction; the node store composes
//! them with node head and property writes into one atomic unit.

use crate::db::concurrency::{diagnose_version_write, next_timestamp};
use crate::db::database::{
    begin_immediate, finish, format_timestamp, parse_timestamp, DatabaseService,
};
use crate::db::error::{DataError, DatabaseError};
use crate::models::{
    last_version_ids, IndexDocumentData, NodeVersion, VersionData, VersionNumber, VersionStatus,
};
use libsql::{params, Connection, Row};
use std::sync::Arc;

pub(crate) const VERSION_COLUMNS: &str = "version_id, node_id, major_number, minor_number, \
     status, creation_date, created_by_id, modification_date, modified_by_id, changed_data, \
     timestamp";

/// Read access to versions plus the transactional building blocks
#[derive(Debug, Clone)]
pub struct VersionStore {
    db: Arc<DatabaseService>,
}

impl VersionStore {
    pub fn new(db: Arc<DatabaseService>) -> Self {
        Self { db }
    }

    /// Load a version by id
    pub async fn load_version(&self, version_id: i64) -> Result<Option<VersionData>, DataError> {
        let conn = self.db.connect_with_timeout().await?;
        load_version_in(&conn, version_id).await
    }

    /// Version ids and numbers of a node, ascending by number
    pub async fn get_version_numbers(&self, node_id: i64) -> Result<Vec<NodeVersion>, DataError> {
        let conn = self.db.connect_with_timeout().await?;
        version_numbers_in(&conn, node_id).await
    }

    /// Same as `get_version_numbers`, addressing the node by path
    pub async fn get_version_numbers_by_path(
        &self,
        path: &str,
    ) -> Result<Vec<NodeVersion>, DataError> {
        let conn = self.db.connect_with_timeout().await?;
        let mut rows = conn
            .query(
                "SELECT v.version_id, v.major_number, v.minor_number, v.status
                 FROM versions v JOIN nodes n ON n.node_id = v.node_id
                 WHERE n.path = ? AND n.is_deleted = 0
                 ORDER BY v.major_number, v.minor_number",
                [path],
            )
            .await
            .map_err(|e| {
                DatabaseError::sql_execution(format!(
                    "Failed to load version numbers of {}: {}",
                    path, e
                ))
            })?;
        let mut versions = Vec::new();
        while let Some(row) = rows.next().await? {
            versions.push(row_to_node_version(&row)?);
        }
        Ok(versions)
    }

    /// Store the indexer's document on a version; returns the new version token
    pub async fn save_index_document(
        &self,
        version_id: i64,
        document: &str,
    ) -> Result<i64, DataError> {
        let conn = self.db.connect_with_timeout().await?;
        begin_immediate(&conn).await?;
        let result = async {
            let timestamp = next_timestamp(&conn).await?;
            let affected = conn
                .execute(
                    "UPDATE versions SET index_document = ?, timestamp = ? WHERE version_id = ?",
                    params![document, timestamp, version_id],
                )
                .await
                .map_err(|e| {
                    DatabaseError::sql_execution(format!(
                        "Failed to save index document of version {}: {}",
                        version_id, e
                    ))
                })?;
            if affected == 0 {
                return Err(DataError::not_found(format!("Version {}", version_id)));
            }
            Ok(timestamp)
        }
        .await;
        let timestamp = finish(&conn, result).await?;
        tracing::debug!(
            "Saved index document of version {} (timestamp {})",
            version_id,
            timestamp
        );
        Ok(timestamp)
    }

    /// Stored index documents of the given versions; missing ids are skipped
    pub async fn load_index_documents(
        &self,
        version_ids: &[i64],
    ) -> Result<Vec<IndexDocumentData>, DataError> {
        if version_ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.db.connect_with_timeout().await?;
        let sql = format!(
            "SELECT n.node_id, v.version_id, n.path, v.timestamp, v.index_document
             FROM versions v JOIN nodes n ON n.node_id = v.node_id
             WHERE v.version_id IN ({})
             ORDER BY v.version_id",
            placeholders(version_ids.len())
        );
        let values: Vec<libsql::Value> = version_ids.iter().map(|id| (*id).into()).collect();
        let mut rows = conn.query(&sql, values).await.map_err(|e| {
            DatabaseError::sql_execution(format!("Failed to load index documents: {}", e))
        })?;
        let mut documents = Vec::new();
        while let Some(row) = rows.next().await? {
            documents.push(IndexDocumentData {
                node_id: row.get(0)?,
                version_id: row.get(1)?,
                path: row.get(2)?,
                version_timestamp: row.get(3)?,
                index_document: row.get(4)?,
            });
        }
        Ok(documents)
    }
}

/// `?, ?, ?` for an IN clause
pub(crate) fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

pub(crate) fn row_to_version(row: &Row) -> Result<VersionData, DataError> {
    let status_code: i64 = row.get(4)?;
    let status = VersionStatus::from_code(status_code).ok_or_else(|| {
        DatabaseError::sql_execution(format!("Unknown version status code {}", status_code))
    })?;
    let creation_date: String = row.get(5)?;
    let modification_date: String = row.get(7)?;
    let changed_data: String = row.get(9)?;

    Ok(VersionData {
        version_id: row.get(0)?,
        node_id: row.get(1)?,
        version: VersionNumber::new(row.get::<i64>(2)? as i16, row.get::<i64>(3)? as i16, status),
        creation_date: parse_timestamp(&creation_date)?,
        created_by_id: row.get(6)?,
        modification_date: parse_timestamp(&modification_date)?,
        modified_by_id: row.get(8)?,
        changed_data: serde_json::from_str(&changed_data)?,
        timestamp: row.get(10)?,
    })
}

fn row_to_node_version(row: &Row) -> Result<NodeVersion, DataError> {
    let status_code: i64 = row.get(3)?;
    let status = VersionStatus::from_code(status_code).ok_or_else(|| {
        DatabaseError::sql_execution(format!("Unknown version status code {}", status_code))
    })?;
    Ok(NodeVersion {
        version_id: row.get(0)?,
        version: VersionNumber::new(row.get::<i64>(1)? as i16, row.get::<i64>(2)? as i16, status),
    })
}

pub(crate) async fn load_version_in(
    conn: &Connection,
    version_id: i64,
) -> Result<Option<VersionData>, DataError> {
    let sql = format!(
        "SELECT {} FROM versions WHERE version_id = ?",
        VERSION_COLUMNS
    );
    let mut rows = conn.query(&sql, [version_id]).await.map_err(|e| {
        DatabaseError::sql_execution(format!("Failed to load version {}: {}", version_id, e))
    })?;
    match rows.next().await? {
        Some(row) => Ok(Some(row_to_version(&row)?)),
        None => Ok(None),
    }
}

pub(crate) async fn version_numbers_in(
    conn: &Connection,
    node_id: i64,
) -> Result<Vec<NodeVersion>, DataError> {
    let mut rows = conn
        .query(
            "SELECT version_id, major_number, minor_number, status FROM versions
             WHERE node_id = ? ORDER BY major_number, minor_number",
            [node_id],
        )
        .await
        .map_err(|e| {
            DatabaseError::sql_execution(format!(
                "Failed to load version numbers of node {}: {}",
                node_id, e
            ))
        })?;
    let mut versions = Vec::new();
    while let Some(row) = rows.next().await? {
        versions.push(row_to_node_version(&row)?);
    }
    Ok(versions)
}

/// Insert a version row for `node_id`; returns `(version_id, timestamp)`
pub(crate) async fn insert_version_in_tx(
    conn: &Connection,
    node_id: i64,
    version: &VersionData,
) -> Result<(i64, i64), DataError> {
    if version_number_taken(conn, node_id, &version.version, None).await? {
        return Err(DataError::invalid_operation(format!(
            "Node {} already has a version {}",
            node_id, version.version
        )));
    }
    let timestamp = next_timestamp(conn).await?;
    conn.execute(
        "INSERT INTO versions (node_id, major_number, minor_number, status, creation_date,
            created_by_id, modification_date, modified_by_id, changed_data, timestamp)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            node_id,
            version.version.major as i64,
            version.version.minor as i64,
            version.version.status.code(),
            format_timestamp(&version.creation_date),
            version.created_by_id,
            format_timestamp(&version.modification_date),
            version.modified_by_id,
            serde_json::to_string(&version.changed_data)?,
            timestamp,
        ],
    )
    .await
    .map_err(|e| {
        DatabaseError::sql_execution(format!(
            "Failed to insert version {} of node {}: {}",
            version.version, node_id, e
        ))
    })?;
    Ok((conn.last_insert_rowid(), timestamp))
}

/// CAS-update a version row's own columns; returns the new timestamp
///
/// The stored row must belong to `node_id`. An Approved version keeps its
/// number and status.
pub(crate) async fn update_version_in_tx(
    conn: &Connection,
    node_id: i64,
    version: &VersionData,
) -> Result<i64, DataError> {
    let stored = load_version_in(conn, version.version_id)
        .await?
        .filter(|v| v.node_id == node_id)
        .ok_or_else(|| {
            DataError::not_found(format!("Version {} of node {}", version.version_id, node_id))
        })?;
    if stored.version.status == VersionStatus::Approved && stored.version != version.version {
        return Err(DataError::invalid_operation(format!(
            "Approved version {} of node {} cannot be changed to {}",
            stored.version, node_id, version.version
        )));
    }
    if version_number_taken(conn, node_id, &version.version, Some(version.version_id)).await? {
        return Err(DataError::invalid_operation(format!(
            "Node {} already has a version {}",
            node_id, version.version
        )));
    }

    let timestamp = next_timestamp(conn).await?;
    let affected = conn
        .execute(
            "UPDATE versions SET major_number = ?, minor_number = ?, status = ?,
                modification_date = ?, modified_by_id = ?, changed_data = ?, timestamp = ?
             WHERE version_id = ? AND timestamp = ?",
            params![
                version.version.major as i64,
                version.version.minor as i64,
                version.version.status.code(),
                format_timestamp(&version.modification_date),
                version.modified_by_id,
                serde_json::to_string(&version.changed_data)?,
                timestamp,
                version.version_id,
                version.timestamp,
            ],
        )
        .await
        .map_err(|e| {
            DatabaseError::sql_execution(format!(
                "Failed to update version {}: {}",
                version.version_id, e
            ))
        })?;
    if affected == 0 {
        return Err(diagnose_version_write(conn, version.version_id, version.timestamp).await);
    }
    Ok(timestamp)
}

/// Overwrite an existing version row without a CAS check (copy target)
pub(crate) async fn overwrite_version_in_tx(
    conn: &Connection,
    node_id: i64,
    target_version_id: i64,
    version: &VersionData,
) -> Result<i64, DataError> {
    if version_number_taken(conn, node_id, &version.version, Some(target_version_id)).await? {
        return Err(DataError::invalid_operation(format!(
            "Node {} already has a version {}",
            node_id, version.version
        )));
    }
    let timestamp = next_timestamp(conn).await?;
    let affected = conn
        .execute(
            "UPDATE versions SET major_number = ?, minor_number = ?, status = ?,
                modification_date = ?, modified_by_id = ?, changed_data = ?, timestamp = ?,
                dynamic_properties = '{}', index_document = NULL
             WHERE version_id = ? AND node_id = ?",
            params![
                version.version.major as i64,
                version.version.minor as i64,
                version.version.status.code(),
                format_timestamp(&version.modification_date),
                version.modified_by_id,
                serde_json::to_string(&version.changed_data)?,
                timestamp,
                target_version_id,
                node_id,
            ],
        )
        .await
        .map_err(|e| {
            DatabaseError::sql_execution(format!(
                "Failed to overwrite version {}: {}",
                target_version_id, e
            ))
        })?;
    if affected == 0 {
        return Err(DataError::not_found(format!(
            "Version {} of node {}",
            target_version_id, node_id
        )));
    }
    Ok(timestamp)
}

async fn version_number_taken(
    conn: &Connection,
    node_id: i64,
    number: &VersionNumber,
    except_version_id: Option<i64>,
) -> Result<bool, DataError> {
    let mut rows = conn
        .query(
            "SELECT version_id FROM versions
             WHERE node_id = ? AND major_number = ? AND minor_number = ? AND version_id != ?",
            params![
                node_id,
                number.major as i64,
                number.minor as i64,
                except_version_id.unwrap_or(0),
            ],
        )
        .await?;
    Ok(rows.next().await?.is_some())
}

/// Delete versions of a node; cascades to their property rows
///
/// Ids that do not belong to the node are ignored. Returns the number deleted.
pub(crate) async fn delete_versions_in_tx(
    conn: &Connection,
    node_id: i64,
    version_ids: &[i64],
) -> Result<u64, DataError> {
    let mut deleted = 0;
    for version_id in version_ids {
        deleted += conn
            .execute(
                "DELETE FROM versions WHERE version_id = ? AND node_id = ?",
                [*version_id, node_id],
            )
            .await
            .map_err(|e| {
                DatabaseError::sql_execution(format!(
                    "Failed to delete version {}: {}",
                    version_id, e
                ))
            })?;
    }
    Ok(deleted)
}

/// Recompute and store LastMinor/LastMajorVersionId of a node
pub(crate) async fn refresh_last_versions_in_tx(
    conn: &Connection,
    node_id: i64,
) -> Result<(Option<i64>, Option<i64>), DataError> {
    let versions = version_numbers_in(conn, node_id).await?;
    let (last_minor, last_major) = last_version_ids(&versions);
    conn.execute(
        "UPDATE nodes SET last_minor_version_id = ?, last_major_version_id = ? WHERE node_id = ?",
        params![last_minor, last_major, node_id],
    )
    .await
    .map_err(|e| {
        DatabaseError::sql_execution(format!(
            "Failed to update last versions of node {}: {}",
            node_id, e
        ))
    })?;
    Ok((last_minor, last_major))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placeholders() {
        assert_eq!(placeholders(1), "?");
        assert_eq!(placeholders(3), "?, ?, ?");
    }
}
