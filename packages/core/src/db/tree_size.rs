//! Tree Size Aggregator
//!
//! Sums the sizes of the committed files owned by live nodes, either for a
//! single node or for a whole subtree. Read-only and lock-free: the result
//! reflects whatever committed state the read sees.

use crate::db::database::DatabaseService;
use crate::db::error::{DataError, DatabaseError};
use crate::models::{normalize_path, PATH_SEPARATOR};
use libsql::params;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct TreeSizeAggregator {
    db: Arc<DatabaseService>,
}

impl TreeSizeAggregator {
    pub fn new(db: Arc<DatabaseService>) -> Self {
        Self { db }
    }

    /// Total bytes under `path`
    ///
    /// `recursive = false` counts only the node at `path`. Each file is counted
    /// once per node even when several versions share it; a file shared by
    /// two nodes counts for both, so a subtree total is the sum of its nodes.
    /// Staging files and soft-deleted nodes are excluded.
    pub async fn get_tree_size(&self, path: &str, recursive: bool) -> Result<i64, DataError> {
        let path = normalize_path(path);
        let prefix = subtree_prefix(&path);
        let conn = self.db.connect_with_timeout().await?;

        let mut rows = conn
            .query(
                "SELECT COALESCE(SUM(size), 0) FROM (
                     SELECT DISTINCT n.node_id, f.file_id, f.size
                     FROM files f
                     JOIN binary_properties b ON b.file_id = f.file_id
                     JOIN versions v ON v.version_id = b.version_id
                     JOIN nodes n ON n.node_id = v.node_id
                     WHERE f.staging = 0
                       AND n.is_deleted = 0
                       AND (n.path = ?1
                            OR (?2 = 1 AND lower(substr(n.path, 1, ?3)) = lower(?4))))",
                params![
                    path.as_str(),
                    recursive as i64,
                    prefix.chars().count() as i64,
                    prefix.as_str()
                ],
            )
            .await
            .map_err(|e| {
                DatabaseError::sql_execution(format!(
                    "Failed to compute tree size of {}: {}",
                    path, e
                ))
            })?;

        match rows.next().await? {
            Some(row) => Ok(row.get(0)?),
            None => Ok(0),
        }
    }
}

/// `path + "/"`, or `"/"` for the root
fn subtree_prefix(path: &str) -> String {
    if path == "/" {
        PATH_SEPARATOR.to_string()
    } else {
        format!("{}{}", path, PATH_SEPARATOR)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subtree_prefix() {
        assert_eq!(subtree_prefix("/"), "/");
        assert_eq!(subtree_prefix("/Root/A"), "/Root/A/");
    }
}
