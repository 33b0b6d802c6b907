//! Node Store
//!
//! Node head lifecycle on top of the version and property stores. Every
//! mutation runs as one `BEGIN IMMEDIATE` transaction that covers the node
//! row, the version row, the touched property rows and the indexing activity
//! it produces; nothing of a failed mutation is ever visible.
//!
//! # Concurrency
//!
//! Writes compare the caller's `timestamp` against the stored one and issue a
//! fresh token on success (see `concurrency`). Structural changes (move,
//! rename, soft delete, recursive delete) additionally hold a tree lock over
//! the affected subtree, taken before the transaction and released after it.
//!
//! # Write-back
//!
//! Generated ids, the new tokens, the computed path and the recomputed
//! LastMajor/LastMinorVersionId are written into the caller's structs only
//! after the transaction committed.

use crate::config::StoreConfig;
use crate::db::concurrency::{diagnose_node_write, next_timestamp};
use crate::db::database::{
    begin_immediate, finish, format_timestamp, parse_timestamp, DatabaseService,
};
use crate::db::dynamic_properties::{
    clear_properties_in_tx, copy_properties_in_tx, load_packed_in, store_packed_in_tx, PropertyStore,
};
use crate::db::error::{DataError, DatabaseError};
use crate::db::indexing::enqueue_in_tx;
use crate::db::tree_lock::TreeLockStore;
use crate::db::versions::{
    delete_versions_in_tx, insert_version_in_tx, load_version_in, overwrite_version_in_tx,
    placeholders, refresh_last_versions_in_tx, update_version_in_tx,
};
use crate::models::{
    combine_path, is_in_tree, normalize_path, validate_name, DynamicData, EntityTreeNodeData,
    IndexingActivityType, NodeData, NodeHeadData, SavingState, VersionData, PATH_SEPARATOR,
};
use chrono::Duration;
use libsql::{params, Connection, Row};
use std::sync::Arc;

pub(crate) const NODE_COLUMNS: &str = "node_id, node_type_id, content_list_type_id, \
     content_list_id, creating_in_progress, is_deleted, parent_node_id, name, display_name, \
     path, node_index, locked, locked_by_id, etag, lock_type, lock_timeout, lock_date, \
     lock_token, last_lock_update, last_minor_version_id, last_major_version_id, \
     creation_date, created_by_id, modification_date, modified_by_id, is_system, owner_id, \
     saving_state, timestamp";

/// Committed effects of a node head write
struct HeadOutcome {
    timestamp: i64,
    old_path: String,
    path: String,
    renamed: bool,
    deleted: bool,
}

/// Committed effects of a node + version write
struct WriteOutcome {
    node_id: i64,
    node_timestamp: i64,
    path: String,
    version_id: i64,
    version_timestamp: i64,
    last_minor_version_id: Option<i64>,
    last_major_version_id: Option<i64>,
}

impl WriteOutcome {
    fn apply(&self, head: &mut NodeHeadData, version: &mut VersionData) {
        head.node_id = self.node_id;
        head.timestamp = self.node_timestamp;
        head.path = self.path.clone();
        head.last_minor_version_id = self.last_minor_version_id;
        head.last_major_version_id = self.last_major_version_id;
        version.node_id = self.node_id;
        version.version_id = self.version_id;
        version.timestamp = self.version_timestamp;
    }
}

/// Node/version lifecycle operations
#[derive(Debug, Clone)]
pub struct NodeStore {
    db: Arc<DatabaseService>,
    properties: PropertyStore,
    tree_locks: TreeLockStore,
    config: Arc<StoreConfig>,
}

impl NodeStore {
    pub fn new(
        db: Arc<DatabaseService>,
        properties: PropertyStore,
        tree_locks: TreeLockStore,
        config: Arc<StoreConfig>,
    ) -> Self {
        Self {
            db,
            properties,
            tree_locks,
            config,
        }
    }

    fn lock_timeout(&self) -> Duration {
        Duration::milliseconds(self.config.tree_lock_timeout_ms as i64)
    }

    //
    // READS
    //

    /// Node head by id, soft-deleted ones included
    pub async fn load_node_head(&self, node_id: i64) -> Result<Option<NodeHeadData>, DataError> {
        let conn = self.db.connect_with_timeout().await?;
        load_node_head_in(&conn, node_id).await
    }

    /// Live node head by path (case-insensitive)
    pub async fn load_node_head_by_path(
        &self,
        path: &str,
    ) -> Result<Option<NodeHeadData>, DataError> {
        let conn = self.db.connect_with_timeout().await?;
        load_live_by_path_in(&conn, &normalize_path(path)).await
    }

    /// Node head owning a version
    pub async fn load_node_head_by_version_id(
        &self,
        version_id: i64,
    ) -> Result<Option<NodeHeadData>, DataError> {
        let conn = self.db.connect_with_timeout().await?;
        let sql = format!(
            "SELECT {} FROM nodes WHERE node_id = (SELECT node_id FROM versions WHERE version_id = ?)",
            NODE_COLUMNS
        );
        let mut rows = conn.query(&sql, [version_id]).await.map_err(|e| {
            DatabaseError::sql_execution(format!(
                "Failed to load node of version {}: {}",
                version_id, e
            ))
        })?;
        match rows.next().await? {
            Some(row) => Ok(Some(row_to_node_head(&row)?)),
            None => Ok(None),
        }
    }

    /// Live children ordered by Index, then Name
    pub async fn load_child_node_heads(
        &self,
        parent_node_id: i64,
    ) -> Result<Vec<NodeHeadData>, DataError> {
        let conn = self.db.connect_with_timeout().await?;
        let sql = format!(
            "SELECT {} FROM nodes WHERE parent_node_id = ? AND is_deleted = 0
             ORDER BY node_index, name",
            NODE_COLUMNS
        );
        let mut rows = conn.query(&sql, [parent_node_id]).await.map_err(|e| {
            DatabaseError::sql_execution(format!(
                "Failed to load children of node {}: {}",
                parent_node_id, e
            ))
        })?;
        let mut heads = Vec::new();
        while let Some(row) = rows.next().await? {
            heads.push(row_to_node_head(&row)?);
        }
        Ok(heads)
    }

    /// Head, version and properties of one version
    pub async fn load_node(&self, version_id: i64) -> Result<Option<NodeData>, DataError> {
        let conn = self.db.connect_with_timeout().await?;
        self.load_node_in(&conn, version_id).await
    }

    /// `load_node` for several versions; missing ids are skipped
    pub async fn load_nodes(&self, version_ids: &[i64]) -> Result<Vec<NodeData>, DataError> {
        let conn = self.db.connect_with_timeout().await?;
        let mut nodes = Vec::with_capacity(version_ids.len());
        for version_id in version_ids {
            if let Some(node) = self.load_node_in(&conn, *version_id).await? {
                nodes.push(node);
            }
        }
        Ok(nodes)
    }

    async fn load_node_in(
        &self,
        conn: &Connection,
        version_id: i64,
    ) -> Result<Option<NodeData>, DataError> {
        let Some(version) = load_version_in(conn, version_id).await? else {
            return Ok(None);
        };
        let Some(head) = load_node_head_in(conn, version.node_id).await? else {
            return Ok(None);
        };
        let dynamic_data = self
            .properties
            .load_in(conn, version_id, self.config.text_lazy_load_threshold)
            .await?;
        Ok(Some(NodeData {
            head,
            version,
            dynamic_data,
        }))
    }

    /// (NodeId, ParentNodeId, OwnerId) of every node, ordered by NodeId
    ///
    /// Fails with `ResourceLimitExceeded` instead of returning more than
    /// `entity_tree_limit` rows.
    pub async fn load_entity_tree(&self) -> Result<Vec<EntityTreeNodeData>, DataError> {
        let limit = self.config.entity_tree_limit;
        let conn = self.db.connect_with_timeout().await?;
        let mut rows = conn
            .query(
                "SELECT node_id, parent_node_id, owner_id FROM nodes ORDER BY node_id LIMIT ?",
                [limit as i64 + 1],
            )
            .await
            .map_err(|e| {
                DatabaseError::sql_execution(format!("Failed to load entity tree: {}", e))
            })?;
        let mut entities = Vec::new();
        while let Some(row) = rows.next().await? {
            if entities.len() == limit {
                return Err(DataError::resource_limit_exceeded("nodes in the entity tree", limit));
            }
            entities.push(EntityTreeNodeData {
                node_id: row.get(0)?,
                parent_node_id: row.get(1)?,
                owner_id: row.get(2)?,
            });
        }
        Ok(entities)
    }

    //
    // INSERT
    //

    /// Insert a node with its first version and properties
    ///
    /// The path is computed from the parent. On success `node_id`, `path`,
    /// `timestamp` and the last version ids are set on `head`, `version_id`,
    /// `node_id` and `timestamp` on `version`, and binary ids on `dynamic_data`.
    pub async fn insert_node(
        &self,
        head: &mut NodeHeadData,
        version: &mut VersionData,
        dynamic_data: &mut DynamicData,
    ) -> Result<(), DataError> {
        validate_name(&head.name).map_err(DataError::invalid_operation)?;
        self.properties.validate(dynamic_data)?;
        let mut saved = dynamic_data.clone();

        let conn = self.db.connect_with_timeout().await?;
        begin_immediate(&conn).await?;
        let result = self.insert_in_tx(&conn, head, version, &mut saved).await;
        let outcome = finish(&conn, result).await?;

        outcome.apply(head, version);
        *dynamic_data = saved;
        tracing::debug!(
            "Inserted node {} at {} (version {}, timestamp {})",
            outcome.node_id,
            outcome.path,
            outcome.version_id,
            outcome.node_timestamp
        );
        Ok(())
    }

    async fn insert_in_tx(
        &self,
        conn: &Connection,
        head: &NodeHeadData,
        version: &VersionData,
        dynamic_data: &mut DynamicData,
    ) -> Result<WriteOutcome, DataError> {
        let path = match head.parent_node_id {
            Some(parent_id) => {
                let parent = load_node_head_in(conn, parent_id)
                    .await?
                    .ok_or_else(|| DataError::not_found(format!("Parent node {}", parent_id)))?;
                if parent.is_deleted {
                    return Err(DataError::NodeIsDeleted { node_id: parent_id });
                }
                combine_path(&parent.path, &head.name)
            }
            None => combine_path("", &head.name),
        };
        if live_path_exists_in(conn, &path, None).await? {
            return Err(DataError::already_exists(path));
        }

        let node_timestamp = next_timestamp(conn).await?;
        conn.execute(
            "INSERT INTO nodes (node_type_id, content_list_type_id, content_list_id,
                creating_in_progress, is_deleted, parent_node_id, name, display_name, path,
                node_index, locked, locked_by_id, etag, lock_type, lock_timeout, lock_date,
                lock_token, last_lock_update, creation_date, created_by_id, modification_date,
                modified_by_id, is_system, owner_id, saving_state, timestamp)
             VALUES (?, ?, ?, ?, 0, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                head.node_type_id,
                head.content_list_type_id,
                head.content_list_id,
                head.creating_in_progress as i64,
                head.parent_node_id,
                head.name.as_str(),
                head.display_name.clone(),
                path.as_str(),
                head.index as i64,
                head.locked as i64,
                head.locked_by_id,
                head.etag.as_str(),
                head.lock_type as i64,
                head.lock_timeout as i64,
                format_timestamp(&head.lock_date),
                head.lock_token.as_str(),
                format_timestamp(&head.last_lock_update),
                format_timestamp(&head.creation_date),
                head.created_by_id,
                format_timestamp(&head.modification_date),
                head.modified_by_id,
                head.is_system as i64,
                head.owner_id,
                head.saving_state.code(),
                node_timestamp,
            ],
        )
        .await
        .map_err(|e| {
            DatabaseError::sql_execution(format!("Failed to insert node {}: {}", path, e))
        })?;
        let node_id = conn.last_insert_rowid();

        let (version_id, version_timestamp) = insert_version_in_tx(conn, node_id, version).await?;
        self.properties
            .save_in_tx(conn, version_id, dynamic_data)
            .await?;
        let (last_minor_version_id, last_major_version_id) =
            refresh_last_versions_in_tx(conn, node_id).await?;

        enqueue_in_tx(
            conn,
            IndexingActivityType::AddDocument,
            node_id,
            version_id,
            &path,
            Some(version_timestamp),
        )
        .await?;

        Ok(WriteOutcome {
            node_id,
            node_timestamp,
            path,
            version_id,
            version_timestamp,
            last_minor_version_id,
            last_major_version_id,
        })
    }

    //
    // UPDATE
    //

    /// Save a node head and overwrite one of its versions in place
    ///
    /// Both `head.timestamp` and `version.timestamp` must match the stored
    /// tokens. A changed `name` renames the node and rewrites the path of its
    /// whole subtree. `version_ids_to_delete` are removed in the same
    /// transaction (they may not include the saved version).
    pub async fn update_node(
        &self,
        head: &mut NodeHeadData,
        version: &mut VersionData,
        dynamic_data: &mut DynamicData,
        version_ids_to_delete: &[i64],
    ) -> Result<(), DataError> {
        validate_name(&head.name).map_err(DataError::invalid_operation)?;
        if version_ids_to_delete.contains(&version.version_id) {
            return Err(DataError::invalid_operation(format!(
                "Version {} cannot be saved and deleted at once",
                version.version_id
            )));
        }
        self.properties.validate(dynamic_data)?;
        let mut saved = dynamic_data.clone();

        let lock = self.lock_structural_change(head, false).await?;
        let result = async {
            let conn = self.db.connect_with_timeout().await?;
            begin_immediate(&conn).await?;
            let result = self
                .update_in_tx(&conn, head, version, &mut saved, version_ids_to_delete, lock.is_some())
                .await;
            finish(&conn, result).await
        }
        .await;
        if let Some(token) = &lock {
            self.tree_locks.release_quietly(token).await;
        }
        let outcome = result?;

        outcome.apply(head, version);
        *dynamic_data = saved;
        tracing::debug!(
            "Updated node {} version {} (timestamps {}/{})",
            outcome.node_id,
            outcome.version_id,
            outcome.node_timestamp,
            outcome.version_timestamp
        );
        Ok(())
    }

    async fn update_in_tx(
        &self,
        conn: &Connection,
        head: &NodeHeadData,
        version: &VersionData,
        dynamic_data: &mut DynamicData,
        version_ids_to_delete: &[i64],
        locked: bool,
    ) -> Result<WriteOutcome, DataError> {
        let node = self.write_head_in_tx(conn, head, false, locked).await?;
        let version_timestamp = update_version_in_tx(conn, head.node_id, version).await?;
        self.properties
            .save_in_tx(conn, version.version_id, dynamic_data)
            .await?;
        delete_versions_in_tx(conn, head.node_id, version_ids_to_delete).await?;
        let (last_minor_version_id, last_major_version_id) =
            refresh_last_versions_in_tx(conn, head.node_id).await?;

        self.enqueue_head_change(conn, head.node_id, version.version_id, &node, || {
            (IndexingActivityType::UpdateDocument, Some(version_timestamp))
        })
        .await?;

        Ok(WriteOutcome {
            node_id: head.node_id,
            node_timestamp: node.timestamp,
            path: node.path,
            version_id: version.version_id,
            version_timestamp,
            last_minor_version_id,
            last_major_version_id,
        })
    }

    /// Save a node head and write its content into a new or expected version
    ///
    /// `version.version_id` names the source version whose properties are
    /// copied; `version.version` is the number of the target. When
    /// `expected_version_id` is given that existing version is overwritten,
    /// otherwise a new version row is created. The caller's `dynamic_data` is
    /// applied on top of the copied properties. On success `version` describes
    /// the target version.
    pub async fn copy_and_update_node(
        &self,
        head: &mut NodeHeadData,
        version: &mut VersionData,
        dynamic_data: &mut DynamicData,
        version_ids_to_delete: &[i64],
        expected_version_id: Option<i64>,
    ) -> Result<(), DataError> {
        validate_name(&head.name).map_err(DataError::invalid_operation)?;
        if let Some(target) = expected_version_id {
            if version_ids_to_delete.contains(&target) {
                return Err(DataError::invalid_operation(format!(
                    "Version {} cannot be saved and deleted at once",
                    target
                )));
            }
        }
        self.properties.validate(dynamic_data)?;
        let mut saved = dynamic_data.clone();

        let lock = self.lock_structural_change(head, false).await?;
        let result = async {
            let conn = self.db.connect_with_timeout().await?;
            begin_immediate(&conn).await?;
            let result = self
                .copy_in_tx(
                    &conn,
                    head,
                    version,
                    &mut saved,
                    version_ids_to_delete,
                    expected_version_id,
                    lock.is_some(),
                )
                .await;
            finish(&conn, result).await
        }
        .await;
        if let Some(token) = &lock {
            self.tree_locks.release_quietly(token).await;
        }
        let outcome = result?;

        outcome.apply(head, version);
        *dynamic_data = saved;
        tracing::debug!(
            "Copied node {} into version {} (timestamp {})",
            outcome.node_id,
            outcome.version_id,
            outcome.version_timestamp
        );
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn copy_in_tx(
        &self,
        conn: &Connection,
        head: &NodeHeadData,
        version: &VersionData,
        dynamic_data: &mut DynamicData,
        version_ids_to_delete: &[i64],
        expected_version_id: Option<i64>,
        locked: bool,
    ) -> Result<WriteOutcome, DataError> {
        let node = self.write_head_in_tx(conn, head, false, locked).await?;

        let source = load_version_in(conn, version.version_id)
            .await?
            .filter(|v| v.node_id == head.node_id)
            .ok_or_else(|| {
                DataError::not_found(format!(
                    "Source version {} of node {}",
                    version.version_id, head.node_id
                ))
            })?;

        let (target_version_id, version_timestamp, created) = match expected_version_id {
            Some(target) if target == source.version_id => {
                // Overwriting resets the packed blob; keep the version's own scalars
                let packed = load_packed_in(conn, target).await?;
                let timestamp = overwrite_version_in_tx(conn, head.node_id, target, version).await?;
                store_packed_in_tx(conn, target, &packed).await?;
                (target, timestamp, false)
            }
            Some(target) => {
                let timestamp = overwrite_version_in_tx(conn, head.node_id, target, version).await?;
                clear_properties_in_tx(conn, target).await?;
                copy_properties_in_tx(conn, source.version_id, target).await?;
                (target, timestamp, false)
            }
            None => {
                let (target, timestamp) = insert_version_in_tx(conn, head.node_id, version).await?;
                copy_properties_in_tx(conn, source.version_id, target).await?;
                (target, timestamp, true)
            }
        };

        self.properties
            .save_in_tx(conn, target_version_id, dynamic_data)
            .await?;
        delete_versions_in_tx(conn, head.node_id, version_ids_to_delete).await?;
        let (last_minor_version_id, last_major_version_id) =
            refresh_last_versions_in_tx(conn, head.node_id).await?;

        self.enqueue_head_change(conn, head.node_id, target_version_id, &node, || {
            let activity_type = if created {
                IndexingActivityType::AddDocument
            } else {
                IndexingActivityType::UpdateDocument
            };
            (activity_type, Some(version_timestamp))
        })
        .await?;

        Ok(WriteOutcome {
            node_id: head.node_id,
            node_timestamp: node.timestamp,
            path: node.path,
            version_id: target_version_id,
            version_timestamp,
            last_minor_version_id,
            last_major_version_id,
        })
    }

    /// Save node head metadata only
    ///
    /// Setting `is_deleted` soft-deletes the node together with its subtree.
    /// The last version ids are recomputed after `version_ids_to_delete` are
    /// removed; the caller's values for them are ignored.
    pub async fn update_node_head(
        &self,
        head: &mut NodeHeadData,
        version_ids_to_delete: &[i64],
    ) -> Result<(), DataError> {
        validate_name(&head.name).map_err(DataError::invalid_operation)?;

        let lock = self.lock_structural_change(head, true).await?;
        let result = async {
            let conn = self.db.connect_with_timeout().await?;
            begin_immediate(&conn).await?;
            let result = self
                .update_head_in_tx(&conn, head, version_ids_to_delete, lock.is_some())
                .await;
            finish(&conn, result).await
        }
        .await;
        if let Some(token) = &lock {
            self.tree_locks.release_quietly(token).await;
        }
        let (node, last_minor, last_major) = result?;

        head.timestamp = node.timestamp;
        head.path = node.path;
        head.last_minor_version_id = last_minor;
        head.last_major_version_id = last_major;
        tracing::debug!(
            "Updated head of node {} (timestamp {}, deleted {})",
            head.node_id,
            head.timestamp,
            node.deleted
        );
        Ok(())
    }

    async fn update_head_in_tx(
        &self,
        conn: &Connection,
        head: &NodeHeadData,
        version_ids_to_delete: &[i64],
        locked: bool,
    ) -> Result<(HeadOutcome, Option<i64>, Option<i64>), DataError> {
        let node = self.write_head_in_tx(conn, head, true, locked).await?;
        delete_versions_in_tx(conn, head.node_id, version_ids_to_delete).await?;
        let (last_minor, last_major) = refresh_last_versions_in_tx(conn, head.node_id).await?;

        self.enqueue_head_change(conn, head.node_id, last_minor.unwrap_or(0), &node, || {
            (IndexingActivityType::UpdateDocument, None)
        })
        .await?;
        Ok((node, last_minor, last_major))
    }

    /// Take the tree lock a head write needs, if it is structural
    ///
    /// Renames lock the old and the new path; soft deletes lock the node's
    /// path. Returns `None` when no lock is needed or the node does not exist
    /// (the write itself then reports the problem).
    async fn lock_structural_change(
        &self,
        head: &NodeHeadData,
        allow_delete: bool,
    ) -> Result<Option<String>, DataError> {
        let Some(current) = self.load_node_head(head.node_id).await? else {
            return Ok(None);
        };
        if current.is_deleted {
            return Ok(None);
        }
        let paths = if current.name != head.name {
            vec![
                current.path.clone(),
                combine_path(parent_path(&current.path), &head.name),
            ]
        } else if allow_delete && head.is_deleted {
            vec![current.path.clone()]
        } else {
            return Ok(None);
        };
        let paths: Vec<&str> = paths.iter().map(String::as_str).collect();
        Ok(Some(self.tree_locks.acquire(&paths, self.lock_timeout()).await?))
    }

    /// CAS-write the node row; handles rename and soft-delete cascades
    async fn write_head_in_tx(
        &self,
        conn: &Connection,
        head: &NodeHeadData,
        allow_delete: bool,
        locked: bool,
    ) -> Result<HeadOutcome, DataError> {
        let current = load_node_head_in(conn, head.node_id)
            .await?
            .ok_or_else(|| DataError::not_found(format!("Node {}", head.node_id)))?;
        if current.is_deleted {
            return Err(DataError::NodeIsDeleted {
                node_id: head.node_id,
            });
        }

        let renamed = current.name != head.name;
        let deleted = allow_delete && head.is_deleted;
        if (renamed || deleted) && !locked {
            // The node changed between the lock decision and this transaction
            return Err(DataError::node_out_of_date(
                head.node_id,
                head.timestamp,
                current.timestamp,
            ));
        }
        let path = if renamed {
            let path = combine_path(parent_path(&current.path), &head.name);
            if live_path_exists_in(conn, &path, Some(head.node_id)).await? {
                return Err(DataError::already_exists(path));
            }
            path
        } else {
            current.path.clone()
        };

        let timestamp = next_timestamp(conn).await?;
        let affected = conn
            .execute(
                "UPDATE nodes SET node_type_id = ?, content_list_type_id = ?, content_list_id = ?,
                    creating_in_progress = ?, is_deleted = ?, name = ?, display_name = ?,
                    path = ?, node_index = ?, locked = ?, locked_by_id = ?, etag = ?,
                    lock_type = ?, lock_timeout = ?, lock_date = ?, lock_token = ?,
                    last_lock_update = ?, modification_date = ?, modified_by_id = ?,
                    is_system = ?, owner_id = ?, saving_state = ?, timestamp = ?
                 WHERE node_id = ? AND timestamp = ? AND is_deleted = 0",
                params![
                    head.node_type_id,
                    head.content_list_type_id,
                    head.content_list_id,
                    head.creating_in_progress as i64,
                    deleted as i64,
                    head.name.as_str(),
                    head.display_name.clone(),
                    path.as_str(),
                    head.index as i64,
                    head.locked as i64,
                    head.locked_by_id,
                    head.etag.as_str(),
                    head.lock_type as i64,
                    head.lock_timeout as i64,
                    format_timestamp(&head.lock_date),
                    head.lock_token.as_str(),
                    format_timestamp(&head.last_lock_update),
                    format_timestamp(&head.modification_date),
                    head.modified_by_id,
                    head.is_system as i64,
                    head.owner_id,
                    head.saving_state.code(),
                    timestamp,
                    head.node_id,
                    head.timestamp,
                ],
            )
            .await
            .map_err(|e| {
                DatabaseError::sql_execution(format!(
                    "Failed to update node {}: {}",
                    head.node_id, e
                ))
            })?;
        if affected == 0 {
            return Err(diagnose_node_write(conn, head.node_id, head.timestamp).await);
        }

        if renamed {
            rewrite_subtree_paths_in_tx(conn, head.node_id, &current.path, &path).await?;
        }
        if deleted {
            soft_delete_subtree_in_tx(conn, head.node_id).await?;
        }

        Ok(HeadOutcome {
            timestamp,
            old_path: current.path,
            path,
            renamed,
            deleted,
        })
    }

    /// Queue the activities of a head write
    ///
    /// Soft delete: RemoveTree. Rename: RemoveTree(old) + AddTree(new).
    /// Otherwise the activity produced by `document_activity`.
    async fn enqueue_head_change<F>(
        &self,
        conn: &Connection,
        node_id: i64,
        version_id: i64,
        node: &HeadOutcome,
        document_activity: F,
    ) -> Result<(), DataError>
    where
        F: FnOnce() -> (IndexingActivityType, Option<i64>),
    {
        if node.deleted {
            enqueue_in_tx(
                conn,
                IndexingActivityType::RemoveTree,
                node_id,
                version_id,
                &node.old_path,
                None,
            )
            .await?;
        } else if node.renamed {
            enqueue_in_tx(
                conn,
                IndexingActivityType::RemoveTree,
                node_id,
                version_id,
                &node.old_path,
                None,
            )
            .await?;
            enqueue_in_tx(
                conn,
                IndexingActivityType::AddTree,
                node_id,
                version_id,
                &node.path,
                None,
            )
            .await?;
        } else {
            let (activity_type, version_timestamp) = document_activity();
            enqueue_in_tx(
                conn,
                activity_type,
                node_id,
                version_id,
                &node.path,
                version_timestamp,
            )
            .await?;
        }
        Ok(())
    }

    //
    // MOVE / DELETE
    //

    /// Move the node at `source_path` under the node at `target_path`
    ///
    /// `source_timestamp` must match the moved node's token. Returns the new
    /// token. Moving a node to its current parent changes nothing.
    pub async fn move_node(
        &self,
        source_path: &str,
        target_path: &str,
        source_timestamp: i64,
    ) -> Result<i64, DataError> {
        let source = self
            .load_node_head_by_path(source_path)
            .await?
            .ok_or_else(|| DataError::not_found(format!("Source node {}", source_path)))?;
        let target = self
            .load_node_head_by_path(target_path)
            .await?
            .ok_or_else(|| DataError::not_found(format!("Target node {}", target_path)))?;

        if is_in_tree(&target.path, &source.path) {
            return Err(DataError::invalid_operation(format!(
                "Cannot move {} under itself ({})",
                source.path, target.path
            )));
        }
        if source.parent_node_id == Some(target.node_id) {
            if source.timestamp != source_timestamp {
                return Err(DataError::node_out_of_date(
                    source.node_id,
                    source_timestamp,
                    source.timestamp,
                ));
            }
            return Ok(source.timestamp);
        }

        let new_path = combine_path(&target.path, &source.name);
        let token = self
            .tree_locks
            .acquire(&[source.path.as_str(), new_path.as_str()], self.lock_timeout())
            .await?;
        let result = async {
            let conn = self.db.connect_with_timeout().await?;
            begin_immediate(&conn).await?;
            let result = move_in_tx(&conn, &source, &target, &new_path, source_timestamp).await;
            finish(&conn, result).await
        }
        .await;
        self.tree_locks.release_quietly(&token).await;
        let timestamp = result?;

        tracing::debug!(
            "Moved node {} from {} to {} (timestamp {})",
            source.node_id,
            source.path,
            new_path,
            timestamp
        );
        Ok(timestamp)
    }

    /// Hard-delete a node
    ///
    /// Versions and property rows cascade; references to the deleted nodes
    /// are removed. A node that no longer exists is a no-op. Without
    /// `recursive`, a node with children is refused.
    pub async fn delete_node(
        &self,
        node_id: i64,
        timestamp: i64,
        recursive: bool,
    ) -> Result<(), DataError> {
        let Some(current) = self.load_node_head(node_id).await? else {
            tracing::debug!("Delete of missing node {} ignored", node_id);
            return Ok(());
        };

        let lock = if recursive {
            Some(
                self.tree_locks
                    .acquire(&[current.path.as_str()], self.lock_timeout())
                    .await?,
            )
        } else {
            None
        };
        let result = async {
            let conn = self.db.connect_with_timeout().await?;
            begin_immediate(&conn).await?;
            let result = delete_in_tx(&conn, node_id, timestamp, recursive).await;
            finish(&conn, result).await
        }
        .await;
        if let Some(token) = &lock {
            self.tree_locks.release_quietly(token).await;
        }
        let deleted = result?;

        tracing::debug!(
            "Deleted node {} at {} ({} rows, recursive {})",
            node_id,
            current.path,
            deleted,
            recursive
        );
        Ok(())
    }
}

async fn move_in_tx(
    conn: &Connection,
    source: &NodeHeadData,
    target: &NodeHeadData,
    new_path: &str,
    source_timestamp: i64,
) -> Result<i64, DataError> {
    match load_node_head_in(conn, target.node_id).await? {
        None => return Err(DataError::not_found(format!("Target node {}", target.path))),
        Some(t) if t.is_deleted => {
            return Err(DataError::NodeIsDeleted {
                node_id: target.node_id,
            })
        }
        // `new_path` was derived from the target read before the lock
        Some(t) if t.path != target.path => {
            return Err(DataError::node_out_of_date(
                target.node_id,
                target.timestamp,
                t.timestamp,
            ))
        }
        Some(_) => {}
    }
    if live_path_exists_in(conn, new_path, Some(source.node_id)).await? {
        return Err(DataError::already_exists(new_path));
    }

    let timestamp = next_timestamp(conn).await?;
    let affected = conn
        .execute(
            "UPDATE nodes SET parent_node_id = ?, path = ?, timestamp = ?
             WHERE node_id = ? AND timestamp = ? AND is_deleted = 0",
            params![
                target.node_id,
                new_path,
                timestamp,
                source.node_id,
                source_timestamp
            ],
        )
        .await
        .map_err(|e| {
            DatabaseError::sql_execution(format!(
                "Failed to move node {}: {}",
                source.node_id, e
            ))
        })?;
    if affected == 0 {
        return Err(diagnose_node_write(conn, source.node_id, source_timestamp).await);
    }
    rewrite_subtree_paths_in_tx(conn, source.node_id, &source.path, new_path).await?;

    let version_id = source.last_minor_version_id.unwrap_or(0);
    enqueue_in_tx(
        conn,
        IndexingActivityType::RemoveTree,
        source.node_id,
        version_id,
        &source.path,
        None,
    )
    .await?;
    enqueue_in_tx(
        conn,
        IndexingActivityType::AddTree,
        source.node_id,
        version_id,
        new_path,
        None,
    )
    .await?;
    Ok(timestamp)
}

async fn delete_in_tx(
    conn: &Connection,
    node_id: i64,
    timestamp: i64,
    recursive: bool,
) -> Result<u64, DataError> {
    let Some(current) = load_node_head_in(conn, node_id).await? else {
        return Ok(0);
    };
    if current.timestamp != timestamp {
        return Err(DataError::node_out_of_date(node_id, timestamp, current.timestamp));
    }
    let subtree = load_subtree_in(conn, node_id).await?;
    if !recursive && !subtree.is_empty() {
        return Err(DataError::invalid_operation(format!(
            "Node {} has children; delete it recursively",
            current.path
        )));
    }

    let sql = format!(
        "{} DELETE FROM reference_properties
         WHERE referred_node_id IN (SELECT node_id FROM subtree)",
        SUBTREE_CTE
    );
    conn.execute(&sql, [node_id]).await.map_err(|e| {
        DatabaseError::sql_execution(format!(
            "Failed to remove references to {}: {}",
            current.path, e
        ))
    })?;

    let sql = format!(
        "{} DELETE FROM nodes
         WHERE node_id IN (SELECT node_id FROM subtree) AND node_id != ?1",
        SUBTREE_CTE
    );
    let descendants = conn
        .execute(&sql, [node_id])
        .await
        .map_err(|e| {
            DatabaseError::sql_execution(format!(
                "Failed to delete subtree of {}: {}",
                current.path, e
            ))
        })?;
    let affected = conn
        .execute(
            "DELETE FROM nodes WHERE node_id = ? AND timestamp = ?",
            [node_id, timestamp],
        )
        .await
        .map_err(|e| {
            DatabaseError::sql_execution(format!("Failed to delete node {}: {}", node_id, e))
        })?;
    if affected == 0 {
        return Err(diagnose_node_write(conn, node_id, timestamp).await);
    }

    enqueue_in_tx(
        conn,
        IndexingActivityType::RemoveTree,
        node_id,
        current.last_minor_version_id.unwrap_or(0),
        &current.path,
        None,
    )
    .await?;
    Ok(affected + descendants)
}

/// `subtree(node_id)`: the node with `?1` and every row below it by ancestry
const SUBTREE_CTE: &str = "WITH RECURSIVE subtree(node_id) AS (
         SELECT node_id FROM nodes WHERE node_id = ?1
         UNION ALL
         SELECT n.node_id FROM nodes n JOIN subtree s ON n.parent_node_id = s.node_id)";

/// Descendants of `node_id` as (node_id, path, is_deleted), the node itself excluded
///
/// Follows `parent_node_id`, so soft-deleted rows of another node that used
/// to live at the same path are never picked up.
async fn load_subtree_in(
    conn: &Connection,
    node_id: i64,
) -> Result<Vec<(i64, String, bool)>, DataError> {
    let sql = format!(
        "{} SELECT n.node_id, n.path, n.is_deleted FROM nodes n
         JOIN subtree s ON s.node_id = n.node_id
         WHERE n.node_id != ?1
         ORDER BY n.node_id",
        SUBTREE_CTE
    );
    let mut rows = conn.query(&sql, [node_id]).await.map_err(|e| {
        DatabaseError::sql_execution(format!(
            "Failed to load subtree of node {}: {}",
            node_id, e
        ))
    })?;
    let mut subtree = Vec::new();
    while let Some(row) = rows.next().await? {
        subtree.push((row.get(0)?, row.get(1)?, row.get::<bool>(2)?));
    }
    Ok(subtree)
}

/// Rewrite the path of every row below `node_id`; each row gets a new token
async fn rewrite_subtree_paths_in_tx(
    conn: &Connection,
    node_id: i64,
    old_path: &str,
    new_path: &str,
) -> Result<u64, DataError> {
    let descendants = load_subtree_in(conn, node_id).await?;

    let old_len = old_path.chars().count();
    for (descendant_id, path, _) in &descendants {
        let rewritten = format!("{}{}", new_path, path.chars().skip(old_len).collect::<String>());
        let timestamp = next_timestamp(conn).await?;
        conn.execute(
            "UPDATE nodes SET path = ?, timestamp = ? WHERE node_id = ?",
            params![rewritten.as_str(), timestamp, *descendant_id],
        )
        .await
        .map_err(|e| {
            DatabaseError::sql_execution(format!(
                "Failed to rewrite path of node {}: {}",
                descendant_id, e
            ))
        })?;
    }
    Ok(descendants.len() as u64)
}

/// Mark every live row below `node_id` deleted; each row gets a new token
async fn soft_delete_subtree_in_tx(conn: &Connection, node_id: i64) -> Result<u64, DataError> {
    let live: Vec<i64> = load_subtree_in(conn, node_id)
        .await?
        .into_iter()
        .filter(|(_, _, is_deleted)| !is_deleted)
        .map(|(id, _, _)| id)
        .collect();
    for descendant_id in &live {
        let timestamp = next_timestamp(conn).await?;
        conn.execute(
            "UPDATE nodes SET is_deleted = 1, timestamp = ? WHERE node_id = ?",
            [timestamp, *descendant_id],
        )
        .await
        .map_err(|e| {
            DatabaseError::sql_execution(format!(
                "Failed to delete node {}: {}",
                descendant_id, e
            ))
        })?;
    }
    Ok(live.len() as u64)
}

/// Path of the parent encoded in a node path (`""` for a root-level node)
fn parent_path(path: &str) -> &str {
    match path.rfind(PATH_SEPARATOR) {
        Some(i) => &path[..i],
        None => "",
    }
}

async fn live_path_exists_in(
    conn: &Connection,
    path: &str,
    except_node_id: Option<i64>,
) -> Result<bool, DataError> {
    let mut rows = conn
        .query(
            "SELECT node_id FROM nodes WHERE path = ? AND is_deleted = 0 AND node_id != ?",
            params![path, except_node_id.unwrap_or(0)],
        )
        .await?;
    Ok(rows.next().await?.is_some())
}

pub(crate) async fn load_node_head_in(
    conn: &Connection,
    node_id: i64,
) -> Result<Option<NodeHeadData>, DataError> {
    let sql = format!("SELECT {} FROM nodes WHERE node_id = ?", NODE_COLUMNS);
    let mut rows = conn.query(&sql, [node_id]).await.map_err(|e| {
        DatabaseError::sql_execution(format!("Failed to load node {}: {}", node_id, e))
    })?;
    match rows.next().await? {
        Some(row) => Ok(Some(row_to_node_head(&row)?)),
        None => Ok(None),
    }
}

async fn load_live_by_path_in(
    conn: &Connection,
    path: &str,
) -> Result<Option<NodeHeadData>, DataError> {
    let sql = format!(
        "SELECT {} FROM nodes WHERE path = ? AND is_deleted = 0",
        NODE_COLUMNS
    );
    let mut rows = conn.query(&sql, [path]).await.map_err(|e| {
        DatabaseError::sql_execution(format!("Failed to load node {}: {}", path, e))
    })?;
    match rows.next().await? {
        Some(row) => Ok(Some(row_to_node_head(&row)?)),
        None => Ok(None),
    }
}

/// Node heads by id, any state, ordered by id
pub(crate) async fn load_node_heads_in(
    conn: &Connection,
    node_ids: &[i64],
) -> Result<Vec<NodeHeadData>, DataError> {
    if node_ids.is_empty() {
        return Ok(Vec::new());
    }
    let sql = format!(
        "SELECT {} FROM nodes WHERE node_id IN ({}) ORDER BY node_id",
        NODE_COLUMNS,
        placeholders(node_ids.len())
    );
    let values: Vec<libsql::Value> = node_ids.iter().map(|id| (*id).into()).collect();
    let mut rows = conn.query(&sql, values).await?;
    let mut heads = Vec::new();
    while let Some(row) = rows.next().await? {
        heads.push(row_to_node_head(&row)?);
    }
    Ok(heads)
}

/// Convert a row selected with `NODE_COLUMNS`
pub(crate) fn row_to_node_head(row: &Row) -> Result<NodeHeadData, DataError> {
    let lock_date: String = row.get(16)?;
    let last_lock_update: String = row.get(18)?;
    let creation_date: String = row.get(21)?;
    let modification_date: String = row.get(23)?;
    let saving_state_code: i64 = row.get(27)?;
    let saving_state = SavingState::from_code(saving_state_code).ok_or_else(|| {
        DatabaseError::sql_execution(format!("Unknown saving state code {}", saving_state_code))
    })?;

    Ok(NodeHeadData {
        node_id: row.get(0)?,
        node_type_id: row.get(1)?,
        content_list_type_id: row.get(2)?,
        content_list_id: row.get(3)?,
        creating_in_progress: row.get(4)?,
        is_deleted: row.get(5)?,
        parent_node_id: row.get(6)?,
        name: row.get(7)?,
        display_name: row.get(8)?,
        path: row.get(9)?,
        index: row.get::<i64>(10)? as i32,
        locked: row.get(11)?,
        locked_by_id: row.get(12)?,
        etag: row.get(13)?,
        lock_type: row.get::<i64>(14)? as i32,
        lock_timeout: row.get::<i64>(15)? as i32,
        lock_date: parse_timestamp(&lock_date)?,
        lock_token: row.get(17)?,
        last_lock_update: parse_timestamp(&last_lock_update)?,
        last_minor_version_id: row.get(19)?,
        last_major_version_id: row.get(20)?,
        creation_date: parse_timestamp(&creation_date)?,
        created_by_id: row.get(22)?,
        modification_date: parse_timestamp(&modification_date)?,
        modified_by_id: row.get(24)?,
        is_system: row.get(25)?,
        owner_id: row.get(26)?,
        saving_state,
        timestamp: row.get(28)?,
    })
}
