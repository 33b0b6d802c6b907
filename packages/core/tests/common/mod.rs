//! Shared helpers for the integration tests

#![allow(dead_code)]

use anyhow::Result;
use contentstore_core::{
    config::StoreConfig,
    db::{DataProvider, SqlDataProvider},
    models::{DynamicData, NodeHeadData, VersionData, VersionNumber},
    schema::{DataType, PropertyType, SchemaRegistry},
};
use std::sync::Arc;
use tempfile::TempDir;
use tracing_subscriber::EnvFilter;

pub const NODE_TYPE_FOLDER: i64 = 1;
pub const NODE_TYPE_FILE: i64 = 2;

/// Property types registered for every test store
pub fn test_schema() -> Arc<SchemaRegistry> {
    SchemaRegistry::new(vec![
        PropertyType::new(1, "Binary", DataType::Binary),
        PropertyType::new(2, "Description", DataType::Text),
        PropertyType::new(3, "Related", DataType::Reference),
        PropertyType::new(4, "Title", DataType::String),
        PropertyType::new(5, "Count", DataType::Int),
        PropertyType::new(6, "Price", DataType::Currency),
        PropertyType::new(7, "DueDate", DataType::DateTime),
        PropertyType::new(8, "Thumbnail", DataType::Binary),
    ])
    .expect("test schema is valid")
    .into_shared()
}

/// Route store logs to the test output; `RUST_LOG` selects the level
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Test helper: file-backed store in a fresh temp directory
pub async fn create_test_provider() -> Result<(SqlDataProvider, TempDir)> {
    create_test_provider_with(|_| {}).await
}

/// Test helper: same as `create_test_provider`, with a tweaked config
pub async fn create_test_provider_with(
    configure: impl FnOnce(&mut StoreConfig),
) -> Result<(SqlDataProvider, TempDir)> {
    init_tracing();
    let temp_dir = TempDir::new()?;
    let mut config = StoreConfig::for_path(temp_dir.path().join("test.db"));
    configure(&mut config);
    let provider = SqlDataProvider::new(config, test_schema()).await?;
    Ok((provider, temp_dir))
}

/// Insert a node with a V1.0.A version and the given properties
pub async fn insert_with(
    provider: &SqlDataProvider,
    parent: Option<&NodeHeadData>,
    name: &str,
    node_type_id: i64,
    mut data: DynamicData,
) -> Result<(NodeHeadData, VersionData, DynamicData)> {
    let mut head = NodeHeadData::new(node_type_id, parent.map(|p| p.node_id), name);
    let mut version = VersionData::new(VersionNumber::default());
    provider
        .insert_node(&mut head, &mut version, &mut data)
        .await?;
    Ok((head, version, data))
}

/// Insert a folder without properties
pub async fn insert_folder(
    provider: &SqlDataProvider,
    parent: Option<&NodeHeadData>,
    name: &str,
) -> Result<NodeHeadData> {
    let (head, _, _) = insert_with(provider, parent, name, NODE_TYPE_FOLDER, DynamicData::new()).await?;
    Ok(head)
}
