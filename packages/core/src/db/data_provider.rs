//! DataProvider Trait - Content Store Abstraction Layer
//!
//! This module defines the `DataProvider` trait, the single seam between the
//! business layer and the persistence core. Every operation a caller may use
//! (node lifecycle, dynamic properties, tree size, tree locks and the indexing
//! activity queue) goes through it.
//!
//! # Design Decisions
//!
//! 1. **Async-First**: All methods are async; any of them may suspend on store I/O
//! 2. **Write-Back**: Mutations take `&mut` models and fill in generated ids,
//!    computed paths and new concurrency tokens after the commit
//! 3. **Typed Errors**: Every method returns `DataError`, whose variants carry
//!    the ids and paths involved so callers can decide to reload, retry or abort
//! 4. **No Internal Retries**: `OutOfDate` and `LockedByOther` are surfaced,
//!    never retried by the provider
//!
//! # Examples
//!
//! ```rust,no_run
//! use contentstore_core::config::StoreConfig;
//! use contentstore_core::db::{DataProvider, SqlDataProvider};
//! use contentstore_core::models::{DynamicData, NodeHeadData, VersionData, VersionNumber};
//! use contentstore_core::schema::SchemaRegistry;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = StoreConfig::for_path("./data/content.db");
//!     let schema = SchemaRegistry::new(Vec::new())?.into_shared();
//!     let provider = SqlDataProvider::new(config, schema).await?;
//!
//!     let mut head = NodeHeadData::new(1, None, "Root");
//!     let mut version = VersionData::new(VersionNumber::default());
//!     let mut data = DynamicData::new();
//!     provider.insert_node(&mut head, &mut version, &mut data).await?;
//!     println!("Inserted {} as node {}", head.path, head.node_id);
//!
//!     Ok(())
//! }
//! ```

use crate::db::error::DataError;
use crate::models::{
    BinaryDataValue, DynamicData, EntityTreeNodeData, ExecutableActivities, IndexDocumentData,
    IndexingActivity, IndexingActivityRunningState, NodeData, NodeHeadData, NodeVersion,
    PropertyValue, TreeLock, VersionData,
};
use async_trait::async_trait;
use chrono::Duration;
use std::collections::BTreeMap;

/// Persistence operations of the content store
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`; a single provider is shared by
/// every task of the process.
///
/// # Method Categories
///
/// - **Node lifecycle**: insert, update, copy-and-update, head update, move, delete
/// - **Reads**: node heads, versions, full nodes, entity tree
/// - **Dynamic properties**: kind-dispatched get/set, binaries, lazy texts, files
/// - **Tree**: size aggregation and tree locks
/// - **Indexing**: activity queue and index documents
#[async_trait]
pub trait DataProvider: Send + Sync {
    //
    // NODE LIFECYCLE
    //

    /// Insert a node with its first version and dynamic data
    ///
    /// # Errors
    ///
    /// - `AlreadyExists` if the computed path denotes a live node
    /// - `NotFound` / `NodeIsDeleted` for a missing or deleted parent
    /// - `InvalidOperation` for an invalid name
    async fn insert_node(
        &self,
        head: &mut NodeHeadData,
        version: &mut VersionData,
        dynamic_data: &mut DynamicData,
    ) -> Result<(), DataError>;

    /// Update a node head and one of its versions in place
    ///
    /// # Errors
    ///
    /// - `OutOfDate` when either token does not match the stored one
    /// - `NodeIsDeleted` for a soft-deleted node
    /// - `LockedByOther` when a rename meets a held tree lock
    async fn update_node(
        &self,
        head: &mut NodeHeadData,
        version: &mut VersionData,
        dynamic_data: &mut DynamicData,
        version_ids_to_delete: &[i64],
    ) -> Result<(), DataError>;

    /// Update a node head and write the content into a new (or the expected) version
    async fn copy_and_update_node(
        &self,
        head: &mut NodeHeadData,
        version: &mut VersionData,
        dynamic_data: &mut DynamicData,
        version_ids_to_delete: &[i64],
        expected_version_id: Option<i64>,
    ) -> Result<(), DataError>;

    /// Update head metadata only; setting `is_deleted` soft-deletes the subtree
    async fn update_node_head(
        &self,
        head: &mut NodeHeadData,
        version_ids_to_delete: &[i64],
    ) -> Result<(), DataError>;

    /// Move a node under a new parent; returns the moved node's new token
    async fn move_node(
        &self,
        source_path: &str,
        target_path: &str,
        source_timestamp: i64,
    ) -> Result<i64, DataError>;

    /// Hard-delete a node (and with `recursive` its subtree)
    async fn delete_node(&self, node_id: i64, timestamp: i64, recursive: bool)
        -> Result<(), DataError>;

    //
    // READS
    //

    async fn load_node_head(&self, node_id: i64) -> Result<Option<NodeHeadData>, DataError>;

    async fn load_node_head_by_path(&self, path: &str) -> Result<Option<NodeHeadData>, DataError>;

    async fn load_node_head_by_version_id(
        &self,
        version_id: i64,
    ) -> Result<Option<NodeHeadData>, DataError>;

    async fn load_child_node_heads(&self, parent_node_id: i64)
        -> Result<Vec<NodeHeadData>, DataError>;

    async fn load_version(&self, version_id: i64) -> Result<Option<VersionData>, DataError>;

    async fn get_version_numbers(&self, node_id: i64) -> Result<Vec<NodeVersion>, DataError>;

    async fn get_version_numbers_by_path(&self, path: &str)
        -> Result<Vec<NodeVersion>, DataError>;

    async fn load_node(&self, version_id: i64) -> Result<Option<NodeData>, DataError>;

    async fn load_nodes(&self, version_ids: &[i64]) -> Result<Vec<NodeData>, DataError>;

    /// Full hierarchy snapshot, capped at the configured limit
    async fn load_entity_tree(&self) -> Result<Vec<EntityTreeNodeData>, DataError>;

    //
    // DYNAMIC PROPERTIES
    //

    /// Read one property; `None` when the version has no value for it
    async fn get_property_value(
        &self,
        version_id: i64,
        name: &str,
    ) -> Result<Option<PropertyValue>, DataError>;

    /// Write one Text or Reference property
    ///
    /// Binary and non-Text scalar writes fail with `NotSupported`.
    async fn set_property_value(
        &self,
        version_id: i64,
        name: &str,
        value: PropertyValue,
    ) -> Result<(), DataError>;

    async fn load_binary_property_value(
        &self,
        version_id: i64,
        name: &str,
    ) -> Result<Option<BinaryDataValue>, DataError>;

    async fn load_binary_stream(&self, file_id: i64) -> Result<Option<Vec<u8>>, DataError>;

    /// Long texts by name, including the lazily skipped ones
    async fn load_text_properties(
        &self,
        version_id: i64,
        names: &[&str],
    ) -> Result<BTreeMap<String, String>, DataError>;

    async fn set_file_staging(&self, file_id: i64, staging: bool) -> Result<(), DataError>;

    async fn delete_file(&self, file_id: i64) -> Result<bool, DataError>;

    //
    // TREE
    //

    /// Bytes of committed files under `path`
    async fn get_tree_size(&self, path: &str, recursive: bool) -> Result<i64, DataError>;

    /// Lock every path atomically; returns the token
    async fn acquire_tree_lock(&self, paths: &[&str], timeout: Duration)
        -> Result<String, DataError>;

    async fn refresh_tree_lock(&self, token: &str, timeout: Duration) -> Result<(), DataError>;

    async fn release_tree_lock(&self, token: &str) -> Result<bool, DataError>;

    async fn is_tree_locked(&self, path: &str) -> Result<bool, DataError>;

    async fn load_all_tree_locks(&self) -> Result<Vec<TreeLock>, DataError>;

    //
    // INDEXING
    //

    async fn save_index_document(&self, version_id: i64, document: &str)
        -> Result<i64, DataError>;

    async fn load_index_documents(
        &self,
        version_ids: &[i64],
    ) -> Result<Vec<IndexDocumentData>, DataError>;

    /// Append an activity; its new id and creation date are written back
    async fn append_indexing_activity(&self, activity: &mut IndexingActivity)
        -> Result<(), DataError>;

    async fn get_last_activity_id(&self) -> Result<i64, DataError>;

    /// Activities with `from_id <= id <= to_id`, at most `count`
    async fn load_activity_page(
        &self,
        from_id: i64,
        to_id: i64,
        count: usize,
    ) -> Result<Vec<IndexingActivity>, DataError>;

    async fn load_unprocessed_activity_page(
        &self,
        from_id: i64,
        to_id: i64,
        count: usize,
    ) -> Result<Vec<IndexingActivity>, DataError>;

    async fn load_activity_gaps(
        &self,
        gap_ids: &[i64],
        unprocessed_only: bool,
    ) -> Result<Vec<IndexingActivity>, DataError>;

    async fn load_executable_activities(
        &self,
        max_count: usize,
        running_timeout: Duration,
        waiting_ids: &[i64],
    ) -> Result<ExecutableActivities, DataError>;

    async fn update_activity_running_state(
        &self,
        activity_id: i64,
        state: IndexingActivityRunningState,
    ) -> Result<(), DataError>;

    async fn mark_activities_running(&self, activity_ids: &[i64]) -> Result<(), DataError>;

    async fn refresh_activity_lock_time(&self, activity_ids: &[i64]) -> Result<(), DataError>;

    async fn delete_finished_activities(&self) -> Result<u64, DataError>;

    async fn delete_all_activities(&self) -> Result<u64, DataError>;
}
