//! Integration tests for the indexing activity queue
//!
//! Tests cover:
//! - Activities produced by node operations
//! - Id monotonicity across deletion
//! - Paging, gaps and running-state protocol
//! - Executable selection with per-node and per-path ordering

mod common;

use anyhow::Result;
use chrono::Duration;
use common::{create_test_provider, insert_folder, insert_with, NODE_TYPE_FILE};
use contentstore_core::{
    db::{DataError, DataProvider, TestingDataProviderExtension},
    models::{
        find_gaps, DynamicData, IndexingActivity, IndexingActivityRunningState,
        IndexingActivityType,
    },
};

async fn all_activities(provider: &impl DataProvider) -> Result<Vec<IndexingActivity>> {
    let last = provider.get_last_activity_id().await?;
    Ok(provider.load_activity_page(0, last, 1000).await?)
}

#[tokio::test]
async fn test_node_operations_enqueue_activities() -> Result<()> {
    let (provider, _temp_dir) = create_test_provider().await?;
    let root = insert_folder(&provider, None, "Root").await?;
    let target = insert_folder(&provider, Some(&root), "Target").await?;
    let (mut head, mut version, _) =
        insert_with(&provider, Some(&root), "Doc", NODE_TYPE_FILE, DynamicData::new()).await?;
    provider.clear_activities().await?;

    provider
        .update_node(&mut head, &mut version, &mut DynamicData::new(), &[])
        .await?;
    let moved = provider
        .move_node("/Root/Doc", "/Root/Target", head.timestamp)
        .await?;
    provider.delete_node(head.node_id, moved, false).await?;

    let activities = all_activities(&provider).await?;
    let kinds: Vec<(IndexingActivityType, &str)> = activities
        .iter()
        .map(|a| (a.activity_type, a.path.as_str()))
        .collect();
    assert_eq!(
        kinds,
        vec![
            (IndexingActivityType::UpdateDocument, "/Root/Doc"),
            (IndexingActivityType::RemoveTree, "/Root/Doc"),
            (IndexingActivityType::AddTree, "/Root/Target/Doc"),
            (IndexingActivityType::RemoveTree, "/Root/Target/Doc"),
        ]
    );
    assert!(activities.iter().all(|a| a.node_id == head.node_id));
    assert_eq!(activities[0].version_timestamp, Some(version.timestamp));
    assert!(activities.windows(2).all(|w| w[0].activity_id < w[1].activity_id));
    assert_ne!(target.node_id, head.node_id);

    Ok(())
}

#[tokio::test]
async fn test_insert_enqueues_add_document() -> Result<()> {
    let (provider, _temp_dir) = create_test_provider().await?;
    let (head, version, _) =
        insert_with(&provider, None, "Doc", NODE_TYPE_FILE, DynamicData::new()).await?;

    let activities = all_activities(&provider).await?;
    assert_eq!(activities.len(), 1);
    let activity = &activities[0];
    assert_eq!(activity.activity_type, IndexingActivityType::AddDocument);
    assert_eq!(activity.node_id, head.node_id);
    assert_eq!(activity.version_id, version.version_id);
    assert_eq!(activity.running_state, IndexingActivityRunningState::Waiting);

    Ok(())
}

#[tokio::test]
async fn test_ids_never_reused_after_deletion() -> Result<()> {
    let (provider, _temp_dir) = create_test_provider().await?;
    let mut first = IndexingActivity::new(IndexingActivityType::Rebuild, 0, 0, "/Root");
    provider.append_indexing_activity(&mut first).await?;
    let mut second = IndexingActivity::new(IndexingActivityType::AddDocument, 5, 6, "/Root/X")
        .with_version_timestamp(77)
        .with_extension("{\"reason\":\"test\"}");
    provider.append_indexing_activity(&mut second).await?;
    assert!(second.activity_id > first.activity_id);

    assert_eq!(provider.delete_all_activities().await?, 2);
    assert_eq!(provider.get_last_activity_id().await?, second.activity_id);

    let mut third = IndexingActivity::new(IndexingActivityType::AddDocument, 5, 6, "/Root/X");
    provider.append_indexing_activity(&mut third).await?;
    assert!(third.activity_id > second.activity_id);

    Ok(())
}

#[tokio::test]
async fn test_paging_and_gaps() -> Result<()> {
    let (provider, _temp_dir) = create_test_provider().await?;
    let mut ids = Vec::new();
    for i in 0..5 {
        let mut activity =
            IndexingActivity::new(IndexingActivityType::AddDocument, i + 1, i + 1, format!("/R/{}", i));
        provider.append_indexing_activity(&mut activity).await?;
        ids.push(activity.activity_id);
    }

    let page = provider.load_activity_page(ids[1], ids[4], 2).await?;
    assert_eq!(
        page.iter().map(|a| a.activity_id).collect::<Vec<_>>(),
        vec![ids[1], ids[2]]
    );

    provider
        .update_activity_running_state(ids[2], IndexingActivityRunningState::Done)
        .await?;
    let unprocessed = provider.load_unprocessed_activity_page(ids[0], ids[4], 10).await?;
    assert_eq!(unprocessed.len(), 4);
    assert!(unprocessed.iter().all(|a| a.activity_id != ids[2]));

    // A consumer that saw ids[0] and ids[3] asks for what it missed
    let gaps = find_gaps(ids[0], &[ids[3]]);
    assert_eq!(gaps, vec![ids[1], ids[2]]);
    let loaded = provider.load_activity_gaps(&gaps, true).await?;
    assert_eq!(loaded.len(), 1);
    assert_eq!(loaded[0].activity_id, ids[1]);
    assert_eq!(provider.load_activity_gaps(&gaps, false).await?.len(), 2);

    Ok(())
}

#[tokio::test]
async fn test_running_state_protocol() -> Result<()> {
    let (provider, _temp_dir) = create_test_provider().await?;
    let mut activity = IndexingActivity::new(IndexingActivityType::AddDocument, 1, 1, "/A");
    provider.append_indexing_activity(&mut activity).await?;
    let id = activity.activity_id;

    provider.mark_activities_running(&[id]).await?;
    let running = provider.load_activity_gaps(&[id], false).await?.remove(0);
    assert_eq!(running.running_state, IndexingActivityRunningState::Running);
    let first_lock = running.lock_time.expect("running activities carry a lock time");

    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    provider.refresh_activity_lock_time(&[id]).await?;
    let refreshed = provider.load_activity_gaps(&[id], false).await?.remove(0);
    assert!(refreshed.lock_time.expect("still locked") > first_lock);

    provider
        .update_activity_running_state(id, IndexingActivityRunningState::Done)
        .await?;
    assert_eq!(provider.delete_finished_activities().await?, 1);
    assert!(provider.load_activity_gaps(&[id], false).await?.is_empty());

    let err = provider
        .update_activity_running_state(id, IndexingActivityRunningState::Done)
        .await
        .expect_err("activity is gone");
    assert!(matches!(err, DataError::NotFound { .. }));

    Ok(())
}

#[tokio::test]
async fn test_executable_activities_respect_dependencies() -> Result<()> {
    let (provider, _temp_dir) = create_test_provider().await?;
    let specs = [
        (IndexingActivityType::AddDocument, 1, "/Root/A"),
        (IndexingActivityType::UpdateDocument, 1, "/Root/A"),
        (IndexingActivityType::AddDocument, 2, "/Root/B"),
        (IndexingActivityType::RemoveTree, 3, "/Root/C"),
        (IndexingActivityType::AddDocument, 4, "/Root/C/Child"),
    ];
    let mut ids = Vec::new();
    for (activity_type, node_id, path) in specs {
        let mut activity = IndexingActivity::new(activity_type, node_id, node_id, path);
        provider.append_indexing_activity(&mut activity).await?;
        ids.push(activity.activity_id);
    }

    let batch = provider
        .load_executable_activities(10, Duration::minutes(2), &[])
        .await?;
    let started: Vec<i64> = batch.activities.iter().map(|a| a.activity_id).collect();
    assert_eq!(started, vec![ids[0], ids[2], ids[3]]);
    assert!(batch
        .activities
        .iter()
        .all(|a| a.running_state == IndexingActivityRunningState::Running));

    // Nothing new may start while the blockers run
    let batch = provider
        .load_executable_activities(10, Duration::minutes(2), &[ids[0]])
        .await?;
    assert!(batch.activities.is_empty());
    assert!(batch.finished_activity_ids.is_empty());

    provider
        .update_activity_running_state(ids[0], IndexingActivityRunningState::Done)
        .await?;
    provider
        .update_activity_running_state(ids[3], IndexingActivityRunningState::Done)
        .await?;
    let batch = provider
        .load_executable_activities(10, Duration::minutes(2), &[ids[0], ids[2], ids[3]])
        .await?;
    let started: Vec<i64> = batch.activities.iter().map(|a| a.activity_id).collect();
    assert_eq!(started, vec![ids[1], ids[4]]);
    assert_eq!(batch.finished_activity_ids, vec![ids[0], ids[3]]);

    Ok(())
}

#[tokio::test]
async fn test_expired_running_activity_is_taken_over() -> Result<()> {
    let (provider, _temp_dir) = create_test_provider().await?;
    let mut activity = IndexingActivity::new(IndexingActivityType::AddDocument, 1, 1, "/A");
    provider.append_indexing_activity(&mut activity).await?;

    let first = provider
        .load_executable_activities(5, Duration::minutes(2), &[])
        .await?;
    assert_eq!(first.activities.len(), 1);

    let fresh = provider
        .load_executable_activities(5, Duration::minutes(2), &[])
        .await?;
    assert!(fresh.activities.is_empty());

    tokio::time::sleep(std::time::Duration::from_millis(30)).await;
    let stolen = provider
        .load_executable_activities(5, Duration::milliseconds(10), &[])
        .await?;
    assert_eq!(stolen.activities.len(), 1);
    assert_eq!(stolen.activities[0].activity_id, activity.activity_id);

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_producers_get_distinct_ids() -> Result<()> {
    let (provider, _temp_dir) = create_test_provider().await?;
    let mut handles = Vec::new();
    for node_id in 1..=8 {
        let provider = provider.clone();
        handles.push(tokio::spawn(async move {
            let mut activity =
                IndexingActivity::new(IndexingActivityType::AddDocument, node_id, node_id, "/P");
            provider
                .append_indexing_activity(&mut activity)
                .await
                .map(|_| activity.activity_id)
        }));
    }
    let mut ids = Vec::new();
    for handle in handles {
        ids.push(handle.await??);
    }
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 8);

    Ok(())
}
