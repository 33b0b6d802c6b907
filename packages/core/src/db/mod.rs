//! Database Layer
//!
//! This module handles all persistence of the content store using libsql:
//!
//! - Database initialization and connection management (`DatabaseService`)
//! - Concurrency tokens and compare-and-swap diagnosis
//! - Node, version and dynamic property stores
//! - Tree size aggregation and lease-based tree locks
//! - The indexing activity queue
//!
//! # Architecture
//!
//! Callers talk to the `DataProvider` trait; `SqlDataProvider` implements it
//! by delegating to one store per concern. Every mutation is a single
//! `BEGIN IMMEDIATE` transaction on one connection, so concurrent writers in
//! other processes see either all of it or nothing.

mod concurrency;
mod data_provider;
mod database;
mod dynamic_properties;
mod error;
mod indexing;
mod node_store;
mod sql_provider;
mod testing;
mod tree_lock;
mod tree_size;
mod versions;

pub use concurrency::{diagnose_node_write, diagnose_version_write, next_timestamp};
pub use data_provider::DataProvider;
pub use database::{begin_immediate, finish, DatabaseService};
pub use dynamic_properties::PropertyStore;
pub use error::{DataError, DatabaseError};
pub use indexing::IndexingActivityQueue;
pub use node_store::NodeStore;
pub use sql_provider::SqlDataProvider;
pub use testing::TestingDataProviderExtension;
pub use tree_lock::TreeLockStore;
pub use tree_size::TreeSizeAggregator;
pub use versions::VersionStore;
