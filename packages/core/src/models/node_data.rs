//! Composite Read Models

use crate::models::dynamic_data::DynamicData;
use crate::models::node_head::NodeHeadData;
use crate::models::version::VersionData;
use serde::{Deserialize, Serialize};

/// A node head with one of its versions and that version's properties
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeData {
    pub head: NodeHeadData,
    pub version: VersionData,
    pub dynamic_data: DynamicData,
}

/// Minimal hierarchy row used by permission evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityTreeNodeData {
    pub node_id: i64,
    pub parent_node_id: Option<i64>,
    pub owner_id: i64,
}

/// Stored index document of a version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexDocumentData {
    pub node_id: i64,
    pub version_id: i64,
    pub path: String,
    pub version_timestamp: i64,
    pub index_document: Option<String>,
}
