//! Store Configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Environment variable overriding `database_path`
pub const ENV_DB_PATH: &str = "CONTENTSTORE_DB_PATH";

/// Environment variable overriding `busy_timeout_ms`
pub const ENV_BUSY_TIMEOUT_MS: &str = "CONTENTSTORE_BUSY_TIMEOUT_MS";

/// Upper bound for the busy timeout; beyond this a writer is better off failing
const MAX_BUSY_TIMEOUT_MS: u64 = 60_000;

/// Configuration for the content store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Database file (created together with its parent directory)
    pub database_path: PathBuf,

    /// How long a connection waits on a locked database before failing
    pub busy_timeout_ms: u64,

    /// Lease length of tree locks taken by structural operations
    pub tree_lock_timeout_ms: u64,

    /// A Running indexing activity whose lock is older than this may be taken over
    pub activity_running_timeout_secs: u64,

    /// Hard cap on rows returned by `load_entity_tree`
    pub entity_tree_limit: usize,

    /// Long texts longer than this are not loaded with the node
    pub text_lazy_load_threshold: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("./data/contentstore.db"),
            busy_timeout_ms: 5000,
            tree_lock_timeout_ms: 30_000,
            activity_running_timeout_secs: 120,
            entity_tree_limit: 200_000,
            text_lazy_load_threshold: 4000,
        }
    }
}

impl StoreConfig {
    /// Default configuration pointing at the given database file
    pub fn for_path(database_path: impl Into<PathBuf>) -> Self {
        Self {
            database_path: database_path.into(),
            ..Self::default()
        }
    }

    /// Parse a JSON document; missing fields keep their defaults
    pub fn from_json_str(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Apply `CONTENTSTORE_DB_PATH` and `CONTENTSTORE_BUSY_TIMEOUT_MS`
    pub fn with_env_overrides(self) -> Result<Self, String> {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    fn with_overrides_from<F>(mut self, lookup: F) -> Result<Self, String>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup(ENV_DB_PATH) {
            if !path.trim().is_empty() {
                self.database_path = PathBuf::from(path);
            }
        }
        if let Some(timeout) = lookup(ENV_BUSY_TIMEOUT_MS) {
            self.busy_timeout_ms = timeout
                .trim()
                .parse()
                .map_err(|e| format!("{} must be an integer: {}", ENV_BUSY_TIMEOUT_MS, e))?;
        }
        Ok(self)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.database_path.as_os_str().is_empty() {
            return Err("database_path cannot be empty".to_string());
        }

        if self.busy_timeout_ms > MAX_BUSY_TIMEOUT_MS {
            return Err(format!(
                "busy_timeout_ms cannot exceed {}",
                MAX_BUSY_TIMEOUT_MS
            ));
        }

        if self.tree_lock_timeout_ms == 0 {
            return Err("tree_lock_timeout_ms must be greater than 0".to_string());
        }

        if self.activity_running_timeout_secs == 0 {
            return Err("activity_running_timeout_secs must be greater than 0".to_string());
        }

        if self.entity_tree_limit == 0 {
            return Err("entity_tree_limit must be greater than 0".to_string());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = StoreConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.entity_tree_limit, 200_000);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = StoreConfig::default();
        config.tree_lock_timeout_ms = 0;
        assert!(config.validate().is_err());

        let mut config = StoreConfig::default();
        config.busy_timeout_ms = MAX_BUSY_TIMEOUT_MS + 1;
        assert!(config.validate().is_err());

        let config = StoreConfig::for_path("");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config =
            StoreConfig::from_json_str(r#"{"database_path": "/tmp/x.db", "entity_tree_limit": 10}"#)
                .unwrap();
        assert_eq!(config.database_path, PathBuf::from("/tmp/x.db"));
        assert_eq!(config.entity_tree_limit, 10);
        assert_eq!(config.busy_timeout_ms, 5000);
    }

    #[test]
    fn test_overrides() {
        let config = StoreConfig::default()
            .with_overrides_from(|key| match key {
                ENV_DB_PATH => Some("/var/lib/store.db".to_string()),
                ENV_BUSY_TIMEOUT_MS => Some("250".to_string()),
                _ => None,
            })
            .unwrap();
        assert_eq!(config.database_path, PathBuf::from("/var/lib/store.db"));
        assert_eq!(config.busy_timeout_ms, 250);

        let bad = StoreConfig::default().with_overrides_from(|key| {
            (key == ENV_BUSY_TIMEOUT_MS).then(|| "soon".to_string())
        });
        assert!(bad.is_err());
    }
}
