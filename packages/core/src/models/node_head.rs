//! Node Head Data Structures
//!
//! A `NodeHeadData` is the version-independent part of a content item: its
//! identity, position in the tree, editor lock, pointers to the latest
//! versions and the concurrency token guarding the row.
//!
//! # Path Invariant
//!
//! `path` is denormalized for query speed and always equals
//! `parent.path + "/" + name` (or `"/" + name` for a root). The store
//! computes it on insert, rename and move; callers never need to keep it in
//! sync themselves.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Path separator used by every repository path
pub const PATH_SEPARATOR: char = '/';

/// Lifecycle marker for a node that is in the middle of a save
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum SavingState {
    /// The node is fully saved
    #[default]
    Finalized,
    /// The node row exists but the first save has not completed
    Creating,
    /// A multi-step modification is in progress
    Modifying,
    /// A multi-step modification is in progress on a checked-out node
    ModifyingLocked,
}

impl SavingState {
    /// Stable integer code stored in the `nodes.saving_state` column
    pub fn code(self) -> i64 {
        match self {
            SavingState::Finalized => 0,
            SavingState::Creating => 1,
            SavingState::Modifying => 2,
            SavingState::ModifyingLocked => 3,
        }
    }

    /// Decode a stored code; unknown codes are reported as `None`
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(SavingState::Finalized),
            1 => Some(SavingState::Creating),
            2 => Some(SavingState::Modifying),
            3 => Some(SavingState::ModifyingLocked),
            _ => None,
        }
    }
}

impl fmt::Display for SavingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SavingState::Finalized => "Finalized",
            SavingState::Creating => "Creating",
            SavingState::Modifying => "Modifying",
            SavingState::ModifyingLocked => "ModifyingLocked",
        };
        f.write_str(name)
    }
}

impl FromStr for SavingState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Finalized" => Ok(SavingState::Finalized),
            "Creating" => Ok(SavingState::Creating),
            "Modifying" => Ok(SavingState::Modifying),
            "ModifyingLocked" => Ok(SavingState::ModifyingLocked),
            other => Err(format!("Unknown saving state: {}", other)),
        }
    }
}

/// Head row of a content item (one per node)
///
/// # Fields
///
/// - `node_id`: assigned by the store on insert, immutable afterwards
/// - `path`: denormalized `parent.path/name`, unique among live nodes
/// - `locked*` / `lock_*`: optimistic editor lock (checkout), unrelated to tree locks
/// - `last_major_version_id` / `last_minor_version_id`: maintained by the store
/// - `timestamp`: concurrency token, strictly increasing on every write
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeHeadData {
    pub node_id: i64,
    pub node_type_id: i64,
    pub content_list_type_id: Option<i64>,
    pub content_list_id: Option<i64>,
    pub creating_in_progress: bool,
    pub is_deleted: bool,
    pub parent_node_id: Option<i64>,
    pub name: String,
    pub display_name: Option<String>,
    pub path: String,
    pub index: i32,
    pub locked: bool,
    pub locked_by_id: Option<i64>,
    pub etag: String,
    pub lock_type: i32,
    pub lock_timeout: i32,
    pub lock_date: DateTime<Utc>,
    pub lock_token: String,
    pub last_lock_update: DateTime<Utc>,
    pub last_minor_version_id: Option<i64>,
    pub last_major_version_id: Option<i64>,
    pub creation_date: DateTime<Utc>,
    pub created_by_id: i64,
    pub modification_date: DateTime<Utc>,
    pub modified_by_id: i64,
    pub is_system: bool,
    pub owner_id: i64,
    pub saving_state: SavingState,
    pub timestamp: i64,
}

impl NodeHeadData {
    /// Create an unsaved node head under the given parent
    ///
    /// `node_id`, `path`, version pointers and `timestamp` are left at their
    /// unsaved defaults; the store fills them in on insert.
    pub fn new(node_type_id: i64, parent_node_id: Option<i64>, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            node_id: 0,
            node_type_id,
            content_list_type_id: None,
            content_list_id: None,
            creating_in_progress: false,
            is_deleted: false,
            parent_node_id,
            name: name.into(),
            display_name: None,
            path: String::new(),
            index: 0,
            locked: false,
            locked_by_id: None,
            etag: String::new(),
            lock_type: 0,
            lock_timeout: 0,
            lock_date: now,
            lock_token: String::new(),
            last_lock_update: now,
            last_minor_version_id: None,
            last_major_version_id: None,
            creation_date: now,
            created_by_id: 1,
            modification_date: now,
            modified_by_id: 1,
            is_system: false,
            owner_id: 1,
            saving_state: SavingState::Finalized,
            timestamp: 0,
        }
    }

    /// Builder-style index setter
    pub fn with_index(mut self, index: i32) -> Self {
        self.index = index;
        self
    }

    /// Whether the node has been saved at least once
    pub fn is_persisted(&self) -> bool {
        self.node_id > 0
    }
}

/// Normalize a repository path: trims whitespace and trailing separators
///
/// The root separator itself is preserved (`"/"` stays `"/"`).
pub fn normalize_path(path: &str) -> String {
    let trimmed = path.trim();
    let without_trailing = trimmed.trim_end_matches(PATH_SEPARATOR);
    if without_trailing.is_empty() && trimmed.starts_with(PATH_SEPARATOR) {
        return PATH_SEPARATOR.to_string();
    }
    without_trailing.to_string()
}

/// Combine a parent path and a child name
pub fn combine_path(parent_path: &str, name: &str) -> String {
    let parent = normalize_path(parent_path);
    if parent == "/" || parent.is_empty() {
        format!("{}{}", PATH_SEPARATOR, name)
    } else {
        format!("{}{}{}", parent, PATH_SEPARATOR, name)
    }
}

/// Case-insensitive check whether `path` is `ancestor` or lies beneath it
pub fn is_in_tree(path: &str, ancestor: &str) -> bool {
    let path = normalize_path(path).to_lowercase();
    let ancestor = normalize_path(ancestor).to_lowercase();
    if ancestor == "/" {
        return path.starts_with(PATH_SEPARATOR);
    }
    path == ancestor || path.starts_with(&format!("{}{}", ancestor, PATH_SEPARATOR))
}

/// Whether two subtrees overlap (one contains the other)
pub fn paths_overlap(a: &str, b: &str) -> bool {
    is_in_tree(a, b) || is_in_tree(b, a)
}

/// Validate a node name: non-empty, no separator, no surrounding whitespace
pub fn validate_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("Name cannot be empty".to_string());
    }
    if name.contains(PATH_SEPARATOR) {
        return Err(format!("Name '{}' cannot contain '{}'", name, PATH_SEPARATOR));
    }
    if name.trim() != name {
        return Err(format!(
            "Name '{}' cannot start or end with whitespace",
            name
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_saving_state_codes_round_trip() {
        for state in [
            SavingState::Finalized,
            SavingState::Creating,
            SavingState::Modifying,
            SavingState::ModifyingLocked,
        ] {
            assert_eq!(SavingState::from_code(state.code()), Some(state));
            assert_eq!(state.to_string().parse::<SavingState>().unwrap(), state);
        }
        assert_eq!(SavingState::from_code(42), None);
    }

    #[test]
    fn test_combine_path() {
        assert_eq!(combine_path("/Root", "File1"), "/Root/File1");
        assert_eq!(combine_path("/Root/", "File1"), "/Root/File1");
        assert_eq!(combine_path("/", "Root"), "/Root");
        assert_eq!(combine_path("", "Root"), "/Root");
    }

    #[test]
    fn test_is_in_tree_is_case_insensitive_and_separator_aware() {
        assert!(is_in_tree("/Root/A/B", "/Root/A"));
        assert!(is_in_tree("/root/a", "/Root/A"));
        assert!(is_in_tree("/Root/A", "/Root/A/"));
        assert!(!is_in_tree("/Root/AB", "/Root/A"));
        assert!(!is_in_tree("/Root", "/Root/A"));
        assert!(is_in_tree("/Root", "/"));
    }

    #[test]
    fn test_paths_overlap() {
        assert!(paths_overlap("/Root/A", "/Root/A/B"));
        assert!(paths_overlap("/Root/A/B", "/Root/A"));
        assert!(paths_overlap("/Root/A", "/ROOT/a"));
        assert!(!paths_overlap("/Root/A", "/Root/B"));
        assert!(!paths_overlap("/Root/A", "/Root/AB"));
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("File1").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("a/b").is_err());
        assert!(validate_name(" padded").is_err());
    }

    #[test]
    fn test_new_node_head_is_unsaved() {
        let head = NodeHeadData::new(5, Some(2), "File1").with_index(42);
        assert!(!head.is_persisted());
        assert_eq!(head.index, 42);
        assert_eq!(head.timestamp, 0);
        assert_eq!(head.saving_state, SavingState::Finalized);
    }
}
