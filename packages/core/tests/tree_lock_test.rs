//! Integration tests for tree locks
//!
//! Tests cover:
//! - Mutual exclusion over overlapping path prefixes
//! - Release, refresh and lease expiry
//! - Structural operations meeting a held lock

mod common;

use anyhow::Result;
use chrono::Duration;
use common::{create_test_provider, insert_folder};
use contentstore_core::{
    db::{DataError, DataProvider},
    models::DynamicData,
};

fn minutes(n: i64) -> Duration {
    Duration::minutes(n)
}

#[tokio::test]
async fn test_overlapping_locks_are_refused() -> Result<()> {
    let (provider, _temp_dir) = create_test_provider().await?;
    let token = provider.acquire_tree_lock(&["/Root/A"], minutes(1)).await?;
    assert!(!token.is_empty());

    for path in ["/Root/A", "/Root/A/B/C", "/Root", "/root/a"] {
        let err = provider
            .acquire_tree_lock(&[path], minutes(1))
            .await
            .expect_err("overlaps the held lock");
        assert!(matches!(err, DataError::LockedByOther { .. }), "{}", path);
        assert!(err.is_retriable());
    }

    // Siblings and prefix look-alikes do not overlap
    let sibling = provider.acquire_tree_lock(&["/Root/B"], minutes(1)).await?;
    let lookalike = provider.acquire_tree_lock(&["/Root/AB"], minutes(1)).await?;
    assert_ne!(sibling, lookalike);

    assert!(provider.is_tree_locked("/Root/A/Deep").await?);
    assert!(provider.is_tree_locked("/Root").await?);
    assert!(!provider.is_tree_locked("/Root/C").await?);
    assert_eq!(provider.load_all_tree_locks().await?.len(), 3);

    Ok(())
}

#[tokio::test]
async fn test_release_allows_reacquire() -> Result<()> {
    let (provider, _temp_dir) = create_test_provider().await?;
    let token = provider.acquire_tree_lock(&["/Root/A"], minutes(1)).await?;

    assert!(provider.release_tree_lock(&token).await?);
    assert!(!provider.release_tree_lock(&token).await?);
    provider.acquire_tree_lock(&["/Root/A"], minutes(1)).await?;

    Ok(())
}

#[tokio::test]
async fn test_multi_path_acquire_is_atomic() -> Result<()> {
    let (provider, _temp_dir) = create_test_provider().await?;
    provider.acquire_tree_lock(&["/Root/Held"], minutes(1)).await?;

    let err = provider
        .acquire_tree_lock(&["/Root/Free", "/Root/Held/Child"], minutes(1))
        .await
        .expect_err("second path is held");
    assert!(matches!(err, DataError::LockedByOther { .. }));
    assert!(!provider.is_tree_locked("/Root/Free").await?);

    let token = provider
        .acquire_tree_lock(&["/Root/Free", "/Root/Other"], minutes(1))
        .await?;
    let locks = provider.load_all_tree_locks().await?;
    assert_eq!(locks.iter().filter(|l| l.token == token).count(), 2);

    Ok(())
}

#[tokio::test]
async fn test_expired_lock_can_be_taken_over() -> Result<()> {
    let (provider, _temp_dir) = create_test_provider().await?;
    let token = provider
        .acquire_tree_lock(&["/Root"], Duration::milliseconds(50))
        .await?;
    tokio::time::sleep(std::time::Duration::from_millis(120)).await;

    assert!(!provider.is_tree_locked("/Root").await?);
    provider.acquire_tree_lock(&["/Root/A"], minutes(1)).await?;

    let err = provider
        .refresh_tree_lock(&token, minutes(1))
        .await
        .expect_err("lease is gone");
    assert!(matches!(err, DataError::NotFound { .. }));

    Ok(())
}

#[tokio::test]
async fn test_refresh_extends_lease() -> Result<()> {
    let (provider, _temp_dir) = create_test_provider().await?;
    let token = provider
        .acquire_tree_lock(&["/Root"], Duration::milliseconds(300))
        .await?;
    provider.refresh_tree_lock(&token, minutes(1)).await?;
    tokio::time::sleep(std::time::Duration::from_millis(400)).await;

    assert!(provider.is_tree_locked("/Root").await?);
    Ok(())
}

#[tokio::test]
async fn test_structural_operations_respect_held_locks() -> Result<()> {
    let (provider, _temp_dir) = create_test_provider().await?;
    let root = insert_folder(&provider, None, "Root").await?;
    let source = insert_folder(&provider, Some(&root), "Source").await?;
    insert_folder(&provider, Some(&source), "Child").await?;
    insert_folder(&provider, Some(&root), "Target").await?;

    let token = provider
        .acquire_tree_lock(&["/Root/Source/Child"], minutes(1))
        .await?;

    let err = provider
        .move_node("/Root/Source", "/Root/Target", source.timestamp)
        .await
        .expect_err("subtree is locked");
    assert!(matches!(err, DataError::LockedByOther { .. }));

    let mut renamed = source.clone();
    renamed.name = "Renamed".into();
    let mut version = provider
        .load_version(source.last_minor_version_id.expect("has version"))
        .await?
        .expect("exists");
    let err = provider
        .update_node(&mut renamed, &mut version, &mut DynamicData::new(), &[])
        .await
        .expect_err("subtree is locked");
    assert!(matches!(err, DataError::LockedByOther { .. }));

    let err = provider
        .delete_node(source.node_id, source.timestamp, true)
        .await
        .expect_err("subtree is locked");
    assert!(matches!(err, DataError::LockedByOther { .. }));

    provider.release_tree_lock(&token).await?;
    provider
        .move_node("/Root/Source", "/Root/Target", source.timestamp)
        .await?;
    assert!(provider
        .load_node_head_by_path("/Root/Target/Source/Child")
        .await?
        .is_some());

    Ok(())
}
