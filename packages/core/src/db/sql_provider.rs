//! SqlDataProvider - libsql implementation of `DataProvider`
//!
//! Thin wrapper that owns one `DatabaseService` and the component stores
//! built on it, and routes every trait method to the store responsible for
//! it. All stores share the same database handle, configuration and schema
//! snapshot.

use crate::config::StoreConfig;
use crate::db::data_provider::DataProvider;
use crate::db::database::DatabaseService;
use crate::db::dynamic_properties::PropertyStore;
use crate::db::error::DataError;
use crate::db::indexing::IndexingActivityQueue;
use crate::db::node_store::NodeStore;
use crate::db::tree_lock::TreeLockStore;
use crate::db::tree_size::TreeSizeAggregator;
use crate::db::versions::VersionStore;
use crate::models::{
    BinaryDataValue, DynamicData, EntityTreeNodeData, ExecutableActivities, IndexDocumentData,
    IndexingActivity, IndexingActivityRunningState, NodeData, NodeHeadData, NodeVersion,
    PropertyValue, TreeLock, VersionData,
};
use crate::schema::SchemaRegistry;
use async_trait::async_trait;
use chrono::Duration;
use std::collections::BTreeMap;
use std::sync::Arc;

/// `DataProvider` over a local libsql database
#[derive(Debug, Clone)]
pub struct SqlDataProvider {
    db: Arc<DatabaseService>,
    config: Arc<StoreConfig>,
    nodes: NodeStore,
    versions: VersionStore,
    properties: PropertyStore,
    tree_locks: TreeLockStore,
    tree_size: TreeSizeAggregator,
    activities: IndexingActivityQueue,
}

impl SqlDataProvider {
    /// Open (or create) the database described by `config`
    pub async fn new(config: StoreConfig, schema: Arc<SchemaRegistry>) -> Result<Self, DataError> {
        config.validate().map_err(DataError::Configuration)?;
        let db = Arc::new(DatabaseService::with_config(&config).await?);
        Ok(Self::with_database(db, Arc::new(config), schema))
    }

    /// Build the provider over an already opened database
    pub fn with_database(
        db: Arc<DatabaseService>,
        config: Arc<StoreConfig>,
        schema: Arc<SchemaRegistry>,
    ) -> Self {
        let properties = PropertyStore::new(db.clone(), schema);
        let tree_locks = TreeLockStore::new(db.clone());
        Self {
            nodes: NodeStore::new(
                db.clone(),
                properties.clone(),
                tree_locks.clone(),
                config.clone(),
            ),
            versions: VersionStore::new(db.clone()),
            tree_size: TreeSizeAggregator::new(db.clone()),
            activities: IndexingActivityQueue::new(db.clone()),
            properties,
            tree_locks,
            config,
            db,
        }
    }

    pub fn database(&self) -> &Arc<DatabaseService> {
        &self.db
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn schema(&self) -> &Arc<SchemaRegistry> {
        self.properties.schema()
    }

    /// Running timeout for activities as configured
    pub fn activity_running_timeout(&self) -> Duration {
        Duration::seconds(self.config.activity_running_timeout_secs as i64)
    }
}

#[async_trait]
impl DataProvider for SqlDataProvider {
    async fn insert_node(
        &self,
        head: &mut NodeHeadData,
        version: &mut VersionData,
        dynamic_data: &mut DynamicData,
    ) -> Result<(), DataError> {
        self.nodes.insert_node(head, version, dynamic_data).await
    }

    async fn update_node(
        &self,
        head: &mut NodeHeadData,
        version: &mut VersionData,
        dynamic_data: &mut DynamicData,
        version_ids_to_delete: &[i64],
    ) -> Result<(), DataError> {
        self.nodes
            .update_node(head, version, dynamic_data, version_ids_to_delete)
            .await
    }

    async fn copy_and_update_node(
        &self,
        head: &mut NodeHeadData,
        version: &mut VersionData,
        dynamic_data: &mut DynamicData,
        version_ids_to_delete: &[i64],
        expected_version_id: Option<i64>,
    ) -> Result<(), DataError> {
        self.nodes
            .copy_and_update_node(
                head,
                version,
                dynamic_data,
                version_ids_to_delete,
                expected_version_id,
            )
            .await
    }

    async fn update_node_head(
        &self,
        head: &mut NodeHeadData,
        version_ids_to_delete: &[i64],
    ) -> Result<(), DataError> {
        self.nodes.update_node_head(head, version_ids_to_delete).await
    }

    async fn move_node(
        &self,
        source_path: &str,
        target_path: &str,
        source_timestamp: i64,
    ) -> Result<i64, DataError> {
        self.nodes
            .move_node(source_path, target_path, source_timestamp)
            .await
    }

    async fn delete_node(
        &self,
        node_id: i64,
        timestamp: i64,
        recursive: bool,
    ) -> Result<(), DataError> {
        self.nodes.delete_node(node_id, timestamp, recursive).await
    }

    async fn load_node_head(&self, node_id: i64) -> Result<Option<NodeHeadData>, DataError> {
        self.nodes.load_node_head(node_id).await
    }

    async fn load_node_head_by_path(&self, path: &str) -> Result<Option<NodeHeadData>, DataError> {
        self.nodes.load_node_head_by_path(path).await
    }

    async fn load_node_head_by_version_id(
        &self,
        version_id: i64,
    ) -> Result<Option<NodeHeadData>, DataError> {
        self.nodes.load_node_head_by_version_id(version_id).await
    }

    async fn load_child_node_heads(
        &self,
        parent_node_id: i64,
    ) -> Result<Vec<NodeHeadData>, DataError> {
        self.nodes.load_child_node_heads(parent_node_id).await
    }

    async fn load_version(&self, version_id: i64) -> Result<Option<VersionData>, DataError> {
        self.versions.load_version(version_id).await
    }

    async fn get_version_numbers(&self, node_id: i64) -> Result<Vec<NodeVersion>, DataError> {
        self.versions.get_version_numbers(node_id).await
    }

    async fn get_version_numbers_by_path(
        &self,
        path: &str,
    ) -> Result<Vec<NodeVersion>, DataError> {
        self.versions.get_version_numbers_by_path(path).await
    }

    async fn load_node(&self, version_id: i64) -> Result<Option<NodeData>, DataError> {
        self.nodes.load_node(version_id).await
    }

    async fn load_nodes(&self, version_ids: &[i64]) -> Result<Vec<NodeData>, DataError> {
        self.nodes.load_nodes(version_ids).await
    }

    async fn load_entity_tree(&self) -> Result<Vec<EntityTreeNodeData>, DataError> {
        self.nodes.load_entity_tree().await
    }

    async fn get_property_value(
        &self,
        version_id: i64,
        name: &str,
    ) -> Result<Option<PropertyValue>, DataError> {
        self.properties.get_property_value(version_id, name).await
    }

    async fn set_property_value(
        &self,
        version_id: i64,
        name: &str,
        value: PropertyValue,
    ) -> Result<(), DataError> {
        self.properties
            .set_property_value(version_id, name, value)
            .await
    }

    async fn load_binary_property_value(
        &self,
        version_id: i64,
        name: &str,
    ) -> Result<Option<BinaryDataValue>, DataError> {
        self.properties
            .load_binary_property_value(version_id, name)
            .await
    }

    async fn load_binary_stream(&self, file_id: i64) -> Result<Option<Vec<u8>>, DataError> {
        self.properties.load_binary_stream(file_id).await
    }

    async fn load_text_properties(
        &self,
        version_id: i64,
        names: &[&str],
    ) -> Result<BTreeMap<String, String>, DataError> {
        self.properties.load_text_properties(version_id, names).await
    }

    async fn set_file_staging(&self, file_id: i64, staging: bool) -> Result<(), DataError> {
        self.properties.set_file_staging(file_id, staging).await
    }

    async fn delete_file(&self, file_id: i64) -> Result<bool, DataError> {
        self.properties.delete_file(file_id).await
    }

    async fn get_tree_size(&self, path: &str, recursive: bool) -> Result<i64, DataError> {
        self.tree_size.get_tree_size(path, recursive).await
    }

    async fn acquire_tree_lock(
        &self,
        paths: &[&str],
        timeout: Duration,
    ) -> Result<String, DataError> {
        self.tree_locks.acquire(paths, timeout).await
    }

    async fn refresh_tree_lock(&self, token: &str, timeout: Duration) -> Result<(), DataError> {
        self.tree_locks.refresh(token, timeout).await
    }

    async fn release_tree_lock(&self, token: &str) -> Result<bool, DataError> {
        self.tree_locks.release(token).await
    }

    async fn is_tree_locked(&self, path: &str) -> Result<bool, DataError> {
        self.tree_locks.is_locked(path).await
    }

    async fn load_all_tree_locks(&self) -> Result<Vec<TreeLock>, DataError> {
        self.tree_locks.load_all().await
    }

    async fn save_index_document(
        &self,
        version_id: i64,
        document: &str,
    ) -> Result<i64, DataError> {
        self.versions.save_index_document(version_id, document).await
    }

    async fn load_index_documents(
        &self,
        version_ids: &[i64],
    ) -> Result<Vec<IndexDocumentData>, DataError> {
        self.versions.load_index_documents(version_ids).await
    }

    async fn append_indexing_activity(
        &self,
        activity: &mut IndexingActivity,
    ) -> Result<(), DataError> {
        self.activities.append(activity).await
    }

    async fn get_last_activity_id(&self) -> Result<i64, DataError> {
        self.activities.get_last_activity_id().await
    }

    async fn load_activity_page(
        &self,
        from_id: i64,
        to_id: i64,
        count: usize,
    ) -> Result<Vec<IndexingActivity>, DataError> {
        self.activities.load_page(from_id, to_id, count).await
    }

    async fn load_unprocessed_activity_page(
        &self,
        from_id: i64,
        to_id: i64,
        count: usize,
    ) -> Result<Vec<IndexingActivity>, DataError> {
        self.activities
            .load_unprocessed_page(from_id, to_id, count)
            .await
    }

    async fn load_activity_gaps(
        &self,
        gap_ids: &[i64],
        unprocessed_only: bool,
    ) -> Result<Vec<IndexingActivity>, DataError> {
        self.activities.load_gaps(gap_ids, unprocessed_only).await
    }

    async fn load_executable_activities(
        &self,
        max_count: usize,
        running_timeout: Duration,
        waiting_ids: &[i64],
    ) -> Result<ExecutableActivities, DataError> {
        self.activities
            .load_executable_activities(max_count, running_timeout, waiting_ids)
            .await
    }

    async fn update_activity_running_state(
        &self,
        activity_id: i64,
        state: IndexingActivityRunningState,
    ) -> Result<(), DataError> {
        self.activities
            .update_running_state(activity_id, state)
            .await
    }

    async fn mark_activities_running(&self, activity_ids: &[i64]) -> Result<(), DataError> {
        self.activities.mark_running(activity_ids).await
    }

    async fn refresh_activity_lock_time(&self, activity_ids: &[i64]) -> Result<(), DataError> {
        self.activities.refresh_lock_time(activity_ids).await
    }

    async fn delete_finished_activities(&self) -> Result<u64, DataError> {
        self.activities.delete_finished().await
    }

    async fn delete_all_activities(&self) -> Result<u64, DataError> {
        self.activities.delete_all().await
    }
}
