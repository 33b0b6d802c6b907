//! Database Connection Management
//!
//! This module provides the database connection and schema initialization
//! for the content store, using libsql (embedded, SQLite-compatible).
//!
//! # Architecture
//!
//! - **Path-agnostic**: Accepts any valid PathBuf; the parent directory is created
//! - **Idempotent schema**: `CREATE TABLE IF NOT EXISTS` on every open
//! - **WAL mode**: Write-Ahead Logging so readers never block the writer
//! - **Foreign keys**: Enabled on every connection (cascading deletes rely on it)
//!
//! # Database Connection Patterns
//!
//! Use `connect_with_timeout()` in async code. It sets the busy timeout so a
//! writer waits for a competing `BEGIN IMMEDIATE` instead of failing with
//! `SQLITE_BUSY`, and turns foreign keys on for the connection.
//!
//! # Transactions
//!
//! Every mutation runs on a single connection:
//!
//! ```no_run
//! # use contentstore_core::db::{begin_immediate, finish, DatabaseService, DataError};
//! # use std::path::PathBuf;
//! # #[tokio::main]
//! # async fn main() -> Result<(), DataError> {
//! # let db = DatabaseService::new(PathBuf::from("./data/store.db")).await?;
//! let conn = db.connect_with_timeout().await?;
//! begin_immediate(&conn).await?;
//! let result: Result<(), DataError> = async { Ok(()) }.await;
//! finish(&conn, result).await?;
//! # Ok(())
//! # }
//! ```
//!
//! Dropping the future mid-transaction drops the connection, which discards
//! the uncommitted work.

use crate::config::StoreConfig;
use crate::db::error::{DataError, DatabaseError};
use chrono::{DateTime, NaiveDateTime, Utc};
use libsql::{Builder, Connection, Database};
use std::path::PathBuf;
use std::sync::Arc;

/// Database service for managing the libsql database and schema
///
/// # Examples
///
/// ```no_run
/// use contentstore_core::db::DatabaseService;
/// use std::path::PathBuf;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let db_path = PathBuf::from("/path/to/contentstore.db");
///     let db_service = DatabaseService::new(db_path).await?;
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone)]
pub struct DatabaseService {
    /// libsql database (wrapped in Arc for sharing)
    pub db: Arc<Database>,

    /// Path to the database file
    pub db_path: PathBuf,

    busy_timeout_ms: u64,
}

impl DatabaseService {
    /// Create a new DatabaseService with the default configuration
    ///
    /// This will:
    /// 1. Ensure the parent directory exists (create if needed)
    /// 2. Open/create the database file
    /// 3. Initialize the schema (CREATE TABLE IF NOT EXISTS)
    /// 4. Enable WAL mode
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError` if:
    /// - Parent directory cannot be created
    /// - Database connection fails
    /// - Schema initialization fails
    pub async fn new(db_path: PathBuf) -> Result<Self, DatabaseError> {
        Self::with_config(&StoreConfig::for_path(db_path)).await
    }

    /// Create a new DatabaseService from a validated configuration
    pub async fn with_config(config: &StoreConfig) -> Result<Self, DatabaseError> {
        config.validate().map_err(|e| {
            DatabaseError::initialization_failed(format!("Invalid configuration: {}", e))
        })?;

        let db_path = config.database_path.clone();
        let is_new_database = !db_path.exists();

        // Ensure parent directory exists
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    if e.kind() == std::io::ErrorKind::PermissionDenied {
                        DatabaseError::permission_denied(db_path.clone())
                    } else {
                        DatabaseError::DirectoryCreationFailed(e)
                    }
                })?;
            }
        }

        let db = Builder::new_local(&db_path)
            .build()
            .await
            .map_err(|e| DatabaseError::connection_failed(db_path.clone(), e))?;

        let service = Self {
            db: Arc::new(db),
            db_path,
            busy_timeout_ms: config.busy_timeout_ms,
        };

        service.initialize_schema(is_new_database).await?;

        tracing::info!(
            "Content store database ready at {} (new: {})",
            service.db_path.display(),
            is_new_database
        );

        Ok(service)
    }

    /// Execute a PRAGMA statement
    ///
    /// PRAGMA statements return rows, so we must use query() instead of execute().
    async fn execute_pragma(&self, conn: &Connection, pragma: &str) -> Result<(), DatabaseError> {
        let mut stmt = conn.prepare(pragma).await.map_err(|e| {
            DatabaseError::sql_execution(format!("Failed to execute '{}': {}", pragma, e))
        })?;
        let _ = stmt.query(()).await.map_err(|e| {
            DatabaseError::sql_execution(format!("Failed to execute '{}': {}", pragma, e))
        })?;
        Ok(())
    }

    /// Initialize database schema and configuration
    ///
    /// # Schema
    ///
    /// - `timestamp_sequence`: single-row source of concurrency tokens
    /// - `nodes`: node heads; `path` is case-insensitive and unique among live rows
    /// - `versions`: one row per (node, major, minor), packed scalars in `dynamic_properties`
    /// - `files`, `binary_properties`, `reference_properties`, `long_text_properties`
    /// - `indexing_activities`: AUTOINCREMENT ids, never reused
    /// - `tree_locks`: path leases with integer-millisecond expiry
    async fn initialize_schema(&self, is_new_database: bool) -> Result<(), DatabaseError> {
        let conn = self.connect_with_timeout().await?;

        self.execute_pragma(&conn, "PRAGMA journal_mode = WAL").await?;

        for (table, ddl) in TABLES {
            conn.execute(ddl, ()).await.map_err(|e| {
                DatabaseError::sql_execution(format!("Failed to create {} table: {}", table, e))
            })?;
        }

        conn.execute(
            "INSERT OR IGNORE INTO timestamp_sequence (id, value) VALUES (1, 0)",
            (),
        )
        .await
        .map_err(|e| {
            DatabaseError::sql_execution(format!("Failed to seed timestamp_sequence: {}", e))
        })?;

        self.create_indexes(&conn).await?;

        // Flush the fresh schema so connections opened right away see it
        if is_new_database {
            self.execute_pragma(&conn, "PRAGMA wal_checkpoint(TRUNCATE)")
                .await?;
        }

        Ok(())
    }

    async fn create_indexes(&self, conn: &Connection) -> Result<(), DatabaseError> {
        for (name, ddl) in INDEXES {
            conn.execute(ddl, ()).await.map_err(|e| {
                DatabaseError::sql_execution(format!("Failed to create index '{}': {}", name, e))
            })?;
        }
        Ok(())
    }

    /// Get a raw connection to the database
    ///
    /// Carries no busy timeout and no foreign key enforcement; prefer
    /// `connect_with_timeout()`.
    pub fn connect(&self) -> Result<Connection, DatabaseError> {
        self.db.connect().map_err(DatabaseError::LibsqlError)
    }

    /// Get a connection with busy timeout and foreign keys configured
    pub async fn connect_with_timeout(&self) -> Result<Connection, DatabaseError> {
        let conn = self.connect()?;

        self.execute_pragma(
            &conn,
            &format!("PRAGMA busy_timeout = {}", self.busy_timeout_ms),
        )
        .await?;
        self.execute_pragma(&conn, "PRAGMA foreign_keys = ON").await?;

        Ok(conn)
    }
}

/// Start a write transaction, taking the database write lock up front
pub async fn begin_immediate(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute("BEGIN IMMEDIATE", ())
        .await
        .map_err(|e| DatabaseError::sql_execution(format!("Failed to begin transaction: {}", e)))?;
    Ok(())
}

/// Commit on success, roll back on failure
pub async fn finish<T>(conn: &Connection, result: Result<T, DataError>) -> Result<T, DataError> {
    match result {
        Ok(value) => {
            if let Err(e) = conn.execute("COMMIT", ()).await {
                if let Err(rollback) = conn.execute("ROLLBACK", ()).await {
                    tracing::warn!("Rollback after failed commit also failed: {}", rollback);
                }
                return Err(DatabaseError::sql_execution(format!(
                    "Failed to commit transaction: {}",
                    e
                ))
                .into());
            }
            Ok(value)
        }
        Err(err) => {
            if let Err(e) = conn.execute("ROLLBACK", ()).await {
                tracing::warn!("Failed to roll back transaction after '{}': {}", err, e);
            }
            Err(err)
        }
    }
}

/// Format a date for a TEXT column
pub(crate) fn format_timestamp(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

/// Parse a date column - handles both SQLite and RFC3339 formats
///
/// SQLite CURRENT_TIMESTAMP returns: "YYYY-MM-DD HH:MM:SS"
pub(crate) fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, DataError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Ok(naive.and_utc());
    }
    Err(DatabaseError::sql_execution(format!(
        "Unable to parse timestamp '{}' as SQLite or RFC3339 format",
        s
    ))
    .into())
}

/// Millisecond lease times stored in integer columns
pub(crate) fn to_millis(dt: &DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or_default()
}

const TABLES: &[(&str, &str)] = &[
    (
        "timestamp_sequence",
        "CREATE TABLE IF NOT EXISTS timestamp_sequence (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            value INTEGER NOT NULL
        )",
    ),
    (
        "nodes",
        "CREATE TABLE IF NOT EXISTS nodes (
            node_id INTEGER PRIMARY KEY AUTOINCREMENT,
            node_type_id INTEGER NOT NULL,
            content_list_type_id INTEGER,
            content_list_id INTEGER,
            creating_in_progress INTEGER NOT NULL DEFAULT 0,
            is_deleted INTEGER NOT NULL DEFAULT 0,
            -- Hard-deleting a parent removes its subtree
            parent_node_id INTEGER REFERENCES nodes(node_id) ON DELETE CASCADE,
            name TEXT NOT NULL,
            display_name TEXT,
            path TEXT NOT NULL COLLATE NOCASE,
            node_index INTEGER NOT NULL DEFAULT 0,
            locked INTEGER NOT NULL DEFAULT 0,
            locked_by_id INTEGER,
            etag TEXT NOT NULL DEFAULT '',
            lock_type INTEGER NOT NULL DEFAULT 0,
            lock_timeout INTEGER NOT NULL DEFAULT 0,
            lock_date TEXT NOT NULL,
            lock_token TEXT NOT NULL DEFAULT '',
            last_lock_update TEXT NOT NULL,
            last_minor_version_id INTEGER,
            last_major_version_id INTEGER,
            creation_date TEXT NOT NULL,
            created_by_id INTEGER NOT NULL,
            modification_date TEXT NOT NULL,
            modified_by_id INTEGER NOT NULL,
            is_system INTEGER NOT NULL DEFAULT 0,
            owner_id INTEGER NOT NULL,
            saving_state INTEGER NOT NULL DEFAULT 0,
            timestamp INTEGER NOT NULL
        )",
    ),
    (
        "versions",
        "CREATE TABLE IF NOT EXISTS versions (
            version_id INTEGER PRIMARY KEY AUTOINCREMENT,
            node_id INTEGER NOT NULL REFERENCES nodes(node_id) ON DELETE CASCADE,
            major_number INTEGER NOT NULL,
            minor_number INTEGER NOT NULL,
            status INTEGER NOT NULL,
            creation_date TEXT NOT NULL,
            created_by_id INTEGER NOT NULL,
            modification_date TEXT NOT NULL,
            modified_by_id INTEGER NOT NULL,
            changed_data TEXT NOT NULL DEFAULT '[]',
            dynamic_properties TEXT NOT NULL DEFAULT '{}',
            index_document TEXT,
            timestamp INTEGER NOT NULL,
            UNIQUE (node_id, major_number, minor_number)
        )",
    ),
    (
        "files",
        "CREATE TABLE IF NOT EXISTS files (
            file_id INTEGER PRIMARY KEY AUTOINCREMENT,
            content_type TEXT NOT NULL DEFAULT '',
            file_name TEXT NOT NULL DEFAULT '',
            size INTEGER NOT NULL DEFAULT 0,
            stream BLOB,
            staging INTEGER NOT NULL DEFAULT 0,
            creation_date TEXT NOT NULL
        )",
    ),
    (
        "binary_properties",
        "CREATE TABLE IF NOT EXISTS binary_properties (
            binary_property_id INTEGER PRIMARY KEY AUTOINCREMENT,
            version_id INTEGER NOT NULL REFERENCES versions(version_id) ON DELETE CASCADE,
            property_type_id INTEGER NOT NULL,
            -- No FK: file rows outlive their references until orphan cleanup
            file_id INTEGER NOT NULL,
            UNIQUE (version_id, property_type_id)
        )",
    ),
    (
        "reference_properties",
        "CREATE TABLE IF NOT EXISTS reference_properties (
            reference_property_id INTEGER PRIMARY KEY AUTOINCREMENT,
            version_id INTEGER NOT NULL REFERENCES versions(version_id) ON DELETE CASCADE,
            property_type_id INTEGER NOT NULL,
            referred_node_id INTEGER NOT NULL,
            UNIQUE (version_id, property_type_id, referred_node_id)
        )",
    ),
    (
        "long_text_properties",
        "CREATE TABLE IF NOT EXISTS long_text_properties (
            long_text_property_id INTEGER PRIMARY KEY AUTOINCREMENT,
            version_id INTEGER NOT NULL REFERENCES versions(version_id) ON DELETE CASCADE,
            property_type_id INTEGER NOT NULL,
            length INTEGER NOT NULL,
            value TEXT NOT NULL,
            UNIQUE (version_id, property_type_id)
        )",
    ),
    (
        "indexing_activities",
        "CREATE TABLE IF NOT EXISTS indexing_activities (
            indexing_activity_id INTEGER PRIMARY KEY AUTOINCREMENT,
            activity_type INTEGER NOT NULL,
            creation_date TEXT NOT NULL,
            running_state INTEGER NOT NULL DEFAULT 0,
            lock_time INTEGER,
            node_id INTEGER NOT NULL,
            version_id INTEGER NOT NULL,
            path TEXT NOT NULL,
            version_timestamp INTEGER,
            extension TEXT
        )",
    ),
    (
        "tree_locks",
        "CREATE TABLE IF NOT EXISTS tree_locks (
            tree_lock_id INTEGER PRIMARY KEY AUTOINCREMENT,
            token TEXT NOT NULL,
            path TEXT NOT NULL COLLATE NOCASE,
            locked_at INTEGER NOT NULL,
            expires_at INTEGER NOT NULL
        )",
    ),
];

const INDEXES: &[(&str, &str)] = &[
    (
        "idx_nodes_path_live",
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_nodes_path_live ON nodes(path) WHERE is_deleted = 0",
    ),
    (
        "idx_nodes_parent",
        "CREATE INDEX IF NOT EXISTS idx_nodes_parent ON nodes(parent_node_id)",
    ),
    (
        "idx_versions_node",
        "CREATE INDEX IF NOT EXISTS idx_versions_node ON versions(node_id)",
    ),
    (
        "idx_binary_properties_file",
        "CREATE INDEX IF NOT EXISTS idx_binary_properties_file ON binary_properties(file_id)",
    ),
    (
        "idx_reference_properties_referred",
        "CREATE INDEX IF NOT EXISTS idx_reference_properties_referred ON reference_properties(referred_node_id)",
    ),
    (
        "idx_indexing_activities_state",
        "CREATE INDEX IF NOT EXISTS idx_indexing_activities_state ON indexing_activities(running_state)",
    ),
    (
        "idx_tree_locks_token",
        "CREATE INDEX IF NOT EXISTS idx_tree_locks_token ON tree_locks(token)",
    ),
];

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_database_creation() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");

        let db_service = DatabaseService::new(db_path.clone()).await.unwrap();

        assert_eq!(db_service.db_path, db_path);
        assert!(db_path.exists());
    }

    #[tokio::test]
    async fn test_schema_initialization() {
        let temp_dir = TempDir::new().unwrap();
        let db_service = DatabaseService::new(temp_dir.path().join("test.db"))
            .await
            .unwrap();
        let conn = db_service.connect().unwrap();

        let mut rows = conn
            .query("SELECT name FROM sqlite_master WHERE type='table'", ())
            .await
            .unwrap();
        let mut tables = Vec::new();
        while let Some(row) = rows.next().await.unwrap() {
            let name: String = row.get(0).unwrap();
            tables.push(name);
        }

        for (expected, _) in TABLES {
            assert!(tables.iter().any(|t| t == expected), "missing table {}", expected);
        }
    }

    #[tokio::test]
    async fn test_indexes_created() {
        let temp_dir = TempDir::new().unwrap();
        let db_service = DatabaseService::new(temp_dir.path().join("test.db"))
            .await
            .unwrap();
        let conn = db_service.connect().unwrap();

        let mut rows = conn
            .query(
                "SELECT name FROM sqlite_master WHERE type='index' AND name LIKE 'idx_%'",
                (),
            )
            .await
            .unwrap();
        let mut index_names = Vec::new();
        while let Some(row) = rows.next().await.unwrap() {
            let name: String = row.get(0).unwrap();
            index_names.push(name);
        }

        for (expected, _) in INDEXES {
            assert!(index_names.contains(&expected.to_string()));
        }
    }

    #[tokio::test]
    async fn test_wal_mode_enabled() {
        let temp_dir = TempDir::new().unwrap();
        let db_service = DatabaseService::new(temp_dir.path().join("test.db"))
            .await
            .unwrap();
        let conn = db_service.connect().unwrap();

        let mut stmt = conn.prepare("PRAGMA journal_mode").await.unwrap();
        let mut rows = stmt.query(()).await.unwrap();
        let row = rows.next().await.unwrap().unwrap();
        let mode: String = row.get(0).unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
    }

    #[tokio::test]
    async fn test_foreign_keys_enabled_per_connection() {
        let temp_dir = TempDir::new().unwrap();
        let db_service = DatabaseService::new(temp_dir.path().join("test.db"))
            .await
            .unwrap();
        let conn = db_service.connect_with_timeout().await.unwrap();

        let mut stmt = conn.prepare("PRAGMA foreign_keys").await.unwrap();
        let mut rows = stmt.query(()).await.unwrap();
        let row = rows.next().await.unwrap().unwrap();
        let enabled: i64 = row.get(0).unwrap();
        assert_eq!(enabled, 1);
    }

    #[tokio::test]
    async fn test_parent_directory_creation() {
        let temp_dir = TempDir::new().unwrap();
        let nested_path = temp_dir.path().join("nested").join("dirs").join("test.db");

        let _db_service = DatabaseService::new(nested_path.clone()).await.unwrap();

        assert!(nested_path.exists());
    }

    #[tokio::test]
    async fn test_idempotent_initialization() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");

        let _first = DatabaseService::new(db_path.clone()).await.unwrap();
        let second = DatabaseService::new(db_path).await.unwrap();

        let conn = second.connect().unwrap();
        let mut rows = conn
            .query("SELECT COUNT(*) FROM timestamp_sequence", ())
            .await
            .unwrap();
        let row = rows.next().await.unwrap().unwrap();
        let count: i64 = row.get(0).unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let mut config = StoreConfig::default();
        config.entity_tree_limit = 0;
        let result = DatabaseService::with_config(&config).await;
        assert!(matches!(
            result,
            Err(DatabaseError::InitializationFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_rollback_discards_writes() {
        let temp_dir = TempDir::new().unwrap();
        let db_service = DatabaseService::new(temp_dir.path().join("test.db"))
            .await
            .unwrap();
        let conn = db_service.connect_with_timeout().await.unwrap();

        begin_immediate(&conn).await.unwrap();
        conn.execute("UPDATE timestamp_sequence SET value = 99 WHERE id = 1", ())
            .await
            .unwrap();
        let result: Result<(), DataError> = Err(DataError::not_found("anything"));
        assert!(finish(&conn, result).await.is_err());

        let mut rows = conn
            .query("SELECT value FROM timestamp_sequence WHERE id = 1", ())
            .await
            .unwrap();
        let value: i64 = rows.next().await.unwrap().unwrap().get(0).unwrap();
        assert_eq!(value, 0);
    }

    #[test]
    fn test_parse_timestamp_formats() {
        assert!(parse_timestamp("2024-01-02 03:04:05").is_ok());
        assert!(parse_timestamp("2024-01-02T03:04:05Z").is_ok());
        assert!(parse_timestamp("yesterday").is_err());

        let now = Utc::now();
        assert_eq!(parse_timestamp(&format_timestamp(&now)).unwrap(), now);
        assert_eq!(from_millis(to_millis(&now)).timestamp_millis(), now.timestamp_millis());
    }
}
