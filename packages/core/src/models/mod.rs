//! Data Models
//!
//! This module contains the core data structures of the content store:
//!
//! - `NodeHeadData` - Version-independent node row (identity, tree position, token)
//! - `VersionData` - One `(major, minor, status)` revision of a node
//! - `DynamicData` - Typed property values, bucketed by physical store
//! - `IndexingActivity` - Queued instruction for the external indexer
//! - `TreeLock` - Lease over a path prefix

pub mod dynamic_data;
pub mod indexing_activity;
pub mod node_data;
pub mod node_head;
pub mod tree_lock;
pub mod version;

pub use dynamic_data::{BinaryDataValue, DynamicData, PropertyValue, ScalarValue};
pub use indexing_activity::{
    find_gaps, select_executable, ExecutableActivities, IndexingActivity,
    IndexingActivityRunningState, IndexingActivityType, MAX_GAP_COUNT,
};
pub use node_data::{EntityTreeNodeData, IndexDocumentData, NodeData};
pub use node_head::{
    combine_path, is_in_tree, normalize_path, paths_overlap, validate_name, NodeHeadData,
    SavingState, PATH_SEPARATOR,
};
pub use tree_lock::TreeLock;
pub use version::{last_version_ids, NodeVersion, VersionData, VersionNumber, VersionStatus};
