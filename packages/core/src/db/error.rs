//! Database Error Types
//!
//! Two layers of errors:
//!
//! - `DatabaseError` - connection, initialization and raw SQL failures
//! - `DataError` - the data provider taxonomy callers branch on (conflicts,
//!   missing rows, lock contention, capability gaps)

use crate::schema::SchemaError;
use std::path::PathBuf;
use thiserror::Error;

/// Database operation errors
///
/// Covers connection, initialization and statement execution failures.
/// Domain failures are reported through `DataError`.
#[derive(Error, Debug)]
pub enum DatabaseError {
    /// Failed to establish database connection
    #[error("Failed to connect to database at {path}: {source}")]
    ConnectionFailed {
        path: PathBuf,
        source: libsql::Error,
    },

    /// Failed to initialize database schema
    #[error("Failed to initialize database schema: {0}")]
    InitializationFailed(String),

    /// Permission denied when accessing database
    #[error("Permission denied for database path: {path}")]
    PermissionDenied { path: PathBuf },

    /// Failed to create parent directory
    #[error("Failed to create parent directory for database: {0}")]
    DirectoryCreationFailed(#[from] std::io::Error),

    /// libsql operation error
    #[error("Database operation failed: {0}")]
    LibsqlError(#[from] libsql::Error),

    /// SQL execution error with context
    #[error("SQL execution failed: {context}")]
    SqlExecutionError { context: String },
}

impl DatabaseError {
    /// Create a connection failed error
    pub fn connection_failed(path: PathBuf, source: libsql::Error) -> Self {
        Self::ConnectionFailed { path, source }
    }

    /// Create an initialization failed error
    pub fn initialization_failed(msg: impl Into<String>) -> Self {
        Self::InitializationFailed(msg.into())
    }

    /// Create a permission denied error
    pub fn permission_denied(path: PathBuf) -> Self {
        Self::PermissionDenied { path }
    }

    /// Create a SQL execution error with context
    pub fn sql_execution(context: impl Into<String>) -> Self {
        Self::SqlExecutionError {
            context: context.into(),
        }
    }
}

/// Data provider errors
///
/// Every variant carries the ids or paths involved so the caller can decide
/// whether to reload, retry or give up. Nothing is retried internally.
#[derive(Error, Debug)]
pub enum DataError {
    /// Concurrency token mismatch; reload and retry
    #[error("{entity} {id} is out of date: expected timestamp {expected}, found {actual}")]
    OutOfDate {
        entity: &'static str,
        id: i64,
        expected: i64,
        actual: i64,
    },

    /// A live node already occupies the path
    #[error("Node already exists: {path}")]
    AlreadyExists { path: String },

    /// Referenced node, version, path or file does not exist
    #[error("Not found: {what}")]
    NotFound { what: String },

    /// Mutation attempted against a soft-deleted node
    #[error("Node {node_id} is deleted")]
    NodeIsDeleted { node_id: i64 },

    /// Tree lock contention
    #[error("Cannot lock {path}: overlaps the locked path {held_path}")]
    LockedByOther { path: String, held_path: String },

    /// Property name not registered in the schema
    #[error("Unknown property: {name}")]
    UnknownProperty { name: String },

    /// Declared capability gap; retrying cannot help
    #[error("Not supported: {operation}")]
    NotSupported { operation: String },

    /// A bulk read exceeded its safety cap
    #[error("Resource limit exceeded: more than {limit} {what}")]
    ResourceLimitExceeded { what: String, limit: usize },

    /// A value was supplied for a property of a different kind
    #[error("Property {name} is declared as {expected} but a {actual} value was supplied")]
    PropertyKindMismatch {
        name: String,
        expected: String,
        actual: String,
    },

    /// Structurally invalid request (moving under itself, rewriting an approved version)
    #[error("Invalid operation: {reason}")]
    InvalidOperation { reason: String },

    /// Database failure
    #[error("Database operation failed: {0}")]
    Database(#[from] DatabaseError),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid configuration or schema definition
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl DataError {
    /// Create an out-of-date error for a node head row
    pub fn node_out_of_date(node_id: i64, expected: i64, actual: i64) -> Self {
        Self::OutOfDate {
            entity: "Node",
            id: node_id,
            expected,
            actual,
        }
    }

    /// Create an out-of-date error for a version row
    pub fn version_out_of_date(version_id: i64, expected: i64, actual: i64) -> Self {
        Self::OutOfDate {
            entity: "Version",
            id: version_id,
            expected,
            actual,
        }
    }

    /// Create an already exists error
    pub fn already_exists(path: impl Into<String>) -> Self {
        Self::AlreadyExists { path: path.into() }
    }

    /// Create a not found error
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    /// Create a locked by other error
    pub fn locked_by_other(path: impl Into<String>, held_path: impl Into<String>) -> Self {
        Self::LockedByOther {
            path: path.into(),
            held_path: held_path.into(),
        }
    }

    /// Create an unknown property error
    pub fn unknown_property(name: impl Into<String>) -> Self {
        Self::UnknownProperty { name: name.into() }
    }

    /// Create a not supported error
    pub fn not_supported(operation: impl Into<String>) -> Self {
        Self::NotSupported {
            operation: operation.into(),
        }
    }

    /// Create a resource limit exceeded error
    pub fn resource_limit_exceeded(what: impl Into<String>, limit: usize) -> Self {
        Self::ResourceLimitExceeded {
            what: what.into(),
            limit,
        }
    }

    /// Create an invalid operation error
    pub fn invalid_operation(reason: impl Into<String>) -> Self {
        Self::InvalidOperation {
            reason: reason.into(),
        }
    }

    /// Create a property kind mismatch error
    pub fn kind_mismatch(
        name: impl Into<String>,
        expected: impl ToString,
        actual: impl Into<String>,
    ) -> Self {
        Self::PropertyKindMismatch {
            name: name.into(),
            expected: expected.to_string(),
            actual: actual.into(),
        }
    }

    /// Whether reloading and retrying can succeed
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::OutOfDate { .. } | Self::LockedByOther { .. })
    }
}

impl From<libsql::Error> for DataError {
    fn from(e: libsql::Error) -> Self {
        Self::Database(DatabaseError::LibsqlError(e))
    }
}

impl From<SchemaError> for DataError {
    fn from(e: SchemaError) -> Self {
        Self::Configuration(e.to_string())
    }
}
