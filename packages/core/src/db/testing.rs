//! Testing extension for `SqlDataProvider`
//!
//! Raw access used by integration tests and maintenance tooling: rows the
//! public API hides (soft-deleted nodes, versions without their node), row
//! counts of the physical property tables, and direct writes that bypass the
//! concurrency tokens.

use crate::db::dynamic_properties::{load_packed_in, store_packed_in_tx};
use crate::db::error::{DataError, DatabaseError};
use crate::db::node_store::load_node_heads_in;
use crate::db::sql_provider::SqlDataProvider;
use crate::db::versions::{row_to_version, VERSION_COLUMNS};
use crate::models::{NodeHeadData, ScalarValue, VersionData};
use async_trait::async_trait;
use libsql::Connection;

#[async_trait]
pub trait TestingDataProviderExtension: Send + Sync {
    /// Node rows by id in any state, ordered by id
    async fn load_node_heads_raw(&self, node_ids: &[i64]) -> Result<Vec<NodeHeadData>, DataError>;

    /// Every version row of a node, ordered by id
    async fn load_versions_raw(&self, node_id: i64) -> Result<Vec<VersionData>, DataError>;

    /// `binary_properties` rows, of one version or of all
    async fn get_binary_property_count(&self, version_id: Option<i64>) -> Result<i64, DataError>;

    async fn get_file_count(&self) -> Result<i64, DataError>;

    /// `long_text_properties` rows, of one version or of all
    async fn get_long_text_count(&self, version_id: Option<i64>) -> Result<i64, DataError>;

    /// Highest node id ever issued (0 on an empty store)
    async fn get_last_node_id(&self) -> Result<i64, DataError>;

    /// Write one scalar into the packed blob without touching the version token
    async fn update_dynamic_property(
        &self,
        version_id: i64,
        name: &str,
        value: ScalarValue,
    ) -> Result<(), DataError>;

    /// Delete every indexing activity
    async fn clear_activities(&self) -> Result<u64, DataError>;
}

#[async_trait]
impl TestingDataProviderExtension for SqlDataProvider {
    async fn load_node_heads_raw(&self, node_ids: &[i64]) -> Result<Vec<NodeHeadData>, DataError> {
        let conn = self.database().connect_with_timeout().await?;
        load_node_heads_in(&conn, node_ids).await
    }

    async fn load_versions_raw(&self, node_id: i64) -> Result<Vec<VersionData>, DataError> {
        let conn = self.database().connect_with_timeout().await?;
        let sql = format!(
            "SELECT {} FROM versions WHERE node_id = ? ORDER BY version_id",
            VERSION_COLUMNS
        );
        let mut rows = conn.query(&sql, [node_id]).await?;
        let mut versions = Vec::new();
        while let Some(row) = rows.next().await? {
            versions.push(row_to_version(&row)?);
        }
        Ok(versions)
    }

    async fn get_binary_property_count(&self, version_id: Option<i64>) -> Result<i64, DataError> {
        let conn = self.database().connect_with_timeout().await?;
        count_rows(&conn, "binary_properties", version_id).await
    }

    async fn get_file_count(&self) -> Result<i64, DataError> {
        let conn = self.database().connect_with_timeout().await?;
        count_rows(&conn, "files", None).await
    }

    async fn get_long_text_count(&self, version_id: Option<i64>) -> Result<i64, DataError> {
        let conn = self.database().connect_with_timeout().await?;
        count_rows(&conn, "long_text_properties", version_id).await
    }

    async fn get_last_node_id(&self) -> Result<i64, DataError> {
        let conn = self.database().connect_with_timeout().await?;
        let mut rows = conn
            .query("SELECT seq FROM sqlite_sequence WHERE name = 'nodes'", ())
            .await?;
        match rows.next().await? {
            Some(row) => Ok(row.get(0)?),
            None => Ok(0),
        }
    }

    async fn update_dynamic_property(
        &self,
        version_id: i64,
        name: &str,
        value: ScalarValue,
    ) -> Result<(), DataError> {
        let conn = self.database().connect_with_timeout().await?;
        let mut packed = load_packed_in(&conn, version_id).await?;
        packed.insert(name.to_string(), value);
        store_packed_in_tx(&conn, version_id, &packed).await
    }

    async fn clear_activities(&self) -> Result<u64, DataError> {
        self.database()
            .connect_with_timeout()
            .await?
            .execute("DELETE FROM indexing_activities", ())
            .await
            .map_err(|e| {
                DatabaseError::sql_execution(format!("Failed to clear activities: {}", e)).into()
            })
    }
}

async fn count_rows(
    conn: &Connection,
    table: &str,
    version_id: Option<i64>,
) -> Result<i64, DataError> {
    let mut rows = match version_id {
        Some(id) => {
            conn.query(
                &format!("SELECT COUNT(*) FROM {} WHERE version_id = ?", table),
                [id],
            )
            .await?
        }
        None => {
            conn.query(&format!("SELECT COUNT(*) FROM {}", table), ())
                .await?
        }
    };
    match rows.next().await? {
        Some(row) => Ok(row.get(0)?),
        None => Ok(0),
    }
}
