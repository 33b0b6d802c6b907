//! Integration tests for optimistic concurrency
//!
//! Tests cover:
//! - Racing updates against one pre-read token
//! - Strictly increasing tokens across rows
//! - Rollback of a failed mutation

mod common;

use anyhow::Result;
use common::{create_test_provider, insert_folder, insert_with, NODE_TYPE_FILE};
use contentstore_core::{
    db::{DataError, DataProvider, TestingDataProviderExtension},
    models::{DynamicData, ScalarValue, VersionNumber, VersionStatus},
};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_updates_exactly_one_wins() -> Result<()> {
    let (provider, _temp_dir) = create_test_provider().await?;
    let (head, version, _) =
        insert_with(&provider, None, "Contended", NODE_TYPE_FILE, DynamicData::new()).await?;

    let mut handles = Vec::new();
    for index in [1, 2] {
        let provider = provider.clone();
        let mut head = head.clone();
        let mut version = version.clone();
        handles.push(tokio::spawn(async move {
            head.index = index;
            let mut data =
                DynamicData::new().with_scalar("Count", ScalarValue::Int(index as i64));
            provider
                .update_node(&mut head, &mut version, &mut data, &[])
                .await
                .map(|_| index)
        }));
    }

    let mut winners = Vec::new();
    let mut conflicts = 0;
    for handle in handles {
        match handle.await? {
            Ok(index) => winners.push(index),
            Err(DataError::OutOfDate { .. }) => conflicts += 1,
            Err(other) => panic!("unexpected error: {}", other),
        }
    }
    assert_eq!(winners.len(), 1);
    assert_eq!(conflicts, 1);

    let stored = provider.load_node(version.version_id).await?.expect("exists");
    assert_eq!(stored.head.index, winners[0]);
    assert_eq!(
        stored.dynamic_data.dynamic_properties["Count"],
        ScalarValue::Int(winners[0] as i64)
    );

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_inserts_of_same_path() -> Result<()> {
    let (provider, _temp_dir) = create_test_provider().await?;
    let root = insert_folder(&provider, None, "Root").await?;

    let mut handles = Vec::new();
    for _ in 0..4 {
        let provider = provider.clone();
        let root = root.clone();
        handles.push(tokio::spawn(async move {
            insert_folder(&provider, Some(&root), "Same").await.is_ok()
        }));
    }
    let mut inserted = 0;
    for handle in handles {
        if handle.await? {
            inserted += 1;
        }
    }
    assert_eq!(inserted, 1);
    assert_eq!(provider.load_child_node_heads(root.node_id).await?.len(), 1);

    Ok(())
}

#[tokio::test]
async fn test_tokens_strictly_increase_across_rows() -> Result<()> {
    let (provider, _temp_dir) = create_test_provider().await?;
    let a = insert_folder(&provider, None, "A").await?;
    let b = insert_folder(&provider, None, "B").await?;
    assert!(b.timestamp > a.timestamp);

    let mut a = a;
    provider.update_node_head(&mut a, &[]).await?;
    assert!(a.timestamp > b.timestamp);

    Ok(())
}

#[tokio::test]
async fn test_version_token_checked_independently() -> Result<()> {
    let (provider, _temp_dir) = create_test_provider().await?;
    let (mut head, mut version, _) =
        insert_with(&provider, None, "Doc", NODE_TYPE_FILE, DynamicData::new()).await?;

    let mut stale_version = version.clone();
    provider
        .update_node(&mut head, &mut version, &mut DynamicData::new(), &[])
        .await?;

    // Fresh head token, stale version token
    let err = provider
        .update_node(&mut head.clone(), &mut stale_version, &mut DynamicData::new(), &[])
        .await
        .expect_err("version token is stale");
    assert!(matches!(err, DataError::OutOfDate { entity: "Version", .. }));

    // Nothing of the failed write is visible
    let current = provider.load_node_head(head.node_id).await?.expect("exists");
    assert_eq!(current.timestamp, head.timestamp);

    Ok(())
}

#[tokio::test]
async fn test_failed_copy_leaves_no_partial_state() -> Result<()> {
    let (provider, _temp_dir) = create_test_provider().await?;
    let (mut head, mut version, _) =
        insert_with(&provider, None, "Doc", NODE_TYPE_FILE, DynamicData::new()).await?;
    let before = head.clone();

    // V1.0 is already taken by the existing version
    version.version = VersionNumber::new(1, 0, VersionStatus::Draft);
    let mut data = DynamicData::new().with_text("Description", "never stored");
    let err = provider
        .copy_and_update_node(&mut head, &mut version, &mut data, &[], None)
        .await
        .expect_err("version number is taken");
    assert!(matches!(err, DataError::InvalidOperation { .. }));

    let after = provider.load_node_head(head.node_id).await?.expect("exists");
    assert_eq!(after.timestamp, before.timestamp);
    assert_eq!(provider.load_versions_raw(head.node_id).await?.len(), 1);
    assert_eq!(provider.get_long_text_count(None).await?, 0);

    Ok(())
}
