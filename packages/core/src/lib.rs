//! ContentStore Core Persistence Layer
//!
//! This crate provides the persistence core of a versioned, hierarchical
//! content repository: node and version lifecycle, optimistic concurrency,
//! typed dynamic properties, tree size aggregation, tree locks and the
//! indexing activity queue.
//!
//! # Architecture
//!
//! - **libsql**: Embedded SQLite-compatible database, one transaction per mutation
//! - **Compare-and-Swap**: Every node/version row carries a concurrency token
//! - **Kind-split Properties**: Binary, reference and long-text rows; small
//!   scalars packed into one JSON blob per version
//! - **Schema Snapshot**: Property types resolved through an immutable,
//!   explicitly injected `SchemaRegistry`
//!
//! # Modules
//!
//! - [`models`] - Data structures (NodeHeadData, VersionData, DynamicData, ...)
//! - [`schema`] - Property type registry
//! - [`config`] - Store configuration
//! - [`db`] - Database layer and the `DataProvider` seam

pub mod config;
pub mod db;
pub mod models;
pub mod schema;

// Re-export commonly used types
pub use config::StoreConfig;
pub use db::{DataError, DataProvider, DatabaseError, SqlDataProvider};
pub use models::*;
pub use schema::{DataType, PropertyType, SchemaRegistry, StorageKind};
