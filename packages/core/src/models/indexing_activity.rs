//! Indexing Activity Records
//!
//! Every committed mutation appends an activity telling the external search
//! indexer what to re-process. Ids are issued in commit order and never reused.
//!
//! # Ordering
//!
//! An activity may only run once every older unfinished activity it depends
//! on has finished. Two activities depend on each other when they target the
//! same node, when either is a tree activity over an overlapping path, or when
//! both are document activities on the same path. See [`select_executable`].

use crate::models::node_head::paths_overlap;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// What the indexer is asked to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IndexingActivityType {
    AddDocument,
    UpdateDocument,
    RemoveDocument,
    AddTree,
    RemoveTree,
    Rebuild,
    Restore,
}

impl IndexingActivityType {
    pub fn code(self) -> i64 {
        match self {
            IndexingActivityType::AddDocument => 1,
            IndexingActivityType::UpdateDocument => 2,
            IndexingActivityType::RemoveDocument => 3,
            IndexingActivityType::AddTree => 4,
            IndexingActivityType::RemoveTree => 5,
            IndexingActivityType::Rebuild => 6,
            IndexingActivityType::Restore => 7,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(IndexingActivityType::AddDocument),
            2 => Some(IndexingActivityType::UpdateDocument),
            3 => Some(IndexingActivityType::RemoveDocument),
            4 => Some(IndexingActivityType::AddTree),
            5 => Some(IndexingActivityType::RemoveTree),
            6 => Some(IndexingActivityType::Rebuild),
            7 => Some(IndexingActivityType::Restore),
            _ => None,
        }
    }

    /// Tree activities affect a whole subtree rooted at the activity path
    pub fn is_tree(self) -> bool {
        matches!(
            self,
            IndexingActivityType::AddTree
                | IndexingActivityType::RemoveTree
                | IndexingActivityType::Rebuild
        )
    }
}

impl fmt::Display for IndexingActivityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IndexingActivityType::AddDocument => "AddDocument",
            IndexingActivityType::UpdateDocument => "UpdateDocument",
            IndexingActivityType::RemoveDocument => "RemoveDocument",
            IndexingActivityType::AddTree => "AddTree",
            IndexingActivityType::RemoveTree => "RemoveTree",
            IndexingActivityType::Rebuild => "Rebuild",
            IndexingActivityType::Restore => "Restore",
        };
        f.write_str(name)
    }
}

/// Consumer-side progress of an activity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum IndexingActivityRunningState {
    #[default]
    Waiting,
    Running,
    Done,
}

impl IndexingActivityRunningState {
    pub fn code(self) -> i64 {
        match self {
            IndexingActivityRunningState::Waiting => 0,
            IndexingActivityRunningState::Running => 1,
            IndexingActivityRunningState::Done => 2,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(IndexingActivityRunningState::Waiting),
            1 => Some(IndexingActivityRunningState::Running),
            2 => Some(IndexingActivityRunningState::Done),
            _ => None,
        }
    }
}

/// One queued instruction for the indexer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexingActivity {
    pub activity_id: i64,
    pub activity_type: IndexingActivityType,
    pub creation_date: DateTime<Utc>,
    pub running_state: IndexingActivityRunningState,
    pub lock_time: Option<DateTime<Utc>>,
    pub node_id: i64,
    pub version_id: i64,
    pub path: String,
    pub version_timestamp: Option<i64>,
    pub extension: Option<String>,
}

impl IndexingActivity {
    /// Unsaved activity; the queue assigns `activity_id` on append
    pub fn new(
        activity_type: IndexingActivityType,
        node_id: i64,
        version_id: i64,
        path: impl Into<String>,
    ) -> Self {
        Self {
            activity_id: 0,
            activity_type,
            creation_date: Utc::now(),
            running_state: IndexingActivityRunningState::Waiting,
            lock_time: None,
            node_id,
            version_id,
            path: path.into(),
            version_timestamp: None,
            extension: None,
        }
    }

    pub fn with_version_timestamp(mut self, timestamp: i64) -> Self {
        self.version_timestamp = Some(timestamp);
        self
    }

    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = Some(extension.into());
        self
    }

    /// Whether `self` must wait for the older activity `older`
    pub fn depends_on(&self, older: &IndexingActivity) -> bool {
        if self.node_id != 0 && self.node_id == older.node_id {
            return true;
        }
        if self.activity_type.is_tree() || older.activity_type.is_tree() {
            return paths_overlap(&self.path, &older.path);
        }
        self.path.eq_ignore_ascii_case(&older.path)
    }

    /// A Running activity whose lock is older than `timeout` may be taken over
    pub fn is_lock_expired(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        match self.lock_time {
            Some(lock_time) => lock_time + timeout <= now,
            None => true,
        }
    }
}

/// Result of `load_executable_activities`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutableActivities {
    /// Activities now marked Running for the caller, in id order
    pub activities: Vec<IndexingActivity>,
    /// Ids from the caller's waiting list that are Done or gone
    pub finished_activity_ids: Vec<i64>,
}

/// Choose the activities a consumer may start now
///
/// `unfinished` must hold every unfinished activity ordered by id. Returns the
/// ids of Waiting activities, and of Running ones whose lock expired, that do
/// not depend on any older unfinished activity. At most `max_count` ids.
pub fn select_executable(
    unfinished: &[IndexingActivity],
    max_count: usize,
    now: DateTime<Utc>,
    running_timeout: Duration,
) -> Vec<i64> {
    let mut selected = Vec::new();
    for (i, activity) in unfinished.iter().enumerate() {
        if selected.len() >= max_count {
            break;
        }
        let startable = match activity.running_state {
            IndexingActivityRunningState::Waiting => true,
            IndexingActivityRunningState::Running => {
                activity.is_lock_expired(now, running_timeout)
            }
            IndexingActivityRunningState::Done => false,
        };
        if !startable {
            continue;
        }
        let blocked = unfinished[..i]
            .iter()
            .any(|older| activity.depends_on(older));
        if !blocked {
            selected.push(activity.activity_id);
        }
    }
    selected
}

/// Upper bound on the ids one `find_gaps` call reports
pub const MAX_GAP_COUNT: usize = 10_000;

/// Ids greater than `last_id` and below the highest loaded id that are missing
///
/// A consumer that has processed up to `last_id` and then sees `loaded_ids`
/// uses the result to ask for activities committed late (out of id order).
/// Reports the lowest `MAX_GAP_COUNT` gaps; the rest show up on the next call.
pub fn find_gaps(last_id: i64, loaded_ids: &[i64]) -> Vec<i64> {
    let Some(&max_loaded) = loaded_ids.iter().max() else {
        return Vec::new();
    };
    let mut sorted: Vec<i64> = loaded_ids.to_vec();
    sorted.sort_unstable();
    ((last_id + 1)..max_loaded)
        .filter(|id| sorted.binary_search(id).is_err())
        .take(MAX_GAP_COUNT)
        .collect()
}
