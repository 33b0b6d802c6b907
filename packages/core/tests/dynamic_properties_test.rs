//! Integration tests for the dynamic property dispatcher
//!
//! Tests cover:
//! - Reads per storage kind
//! - Text and reference writes
//! - Declared capability gaps (NotSupported)
//! - Kind validation and unknown names
//! - File staging and deletion

mod common;

use anyhow::Result;
use chrono::{TimeZone, Utc};
use common::{create_test_provider, insert_folder, insert_with, NODE_TYPE_FILE};
use contentstore_core::{
    db::{DataError, DataProvider, TestingDataProviderExtension},
    models::{BinaryDataValue, DynamicData, PropertyValue, ScalarValue},
};

#[tokio::test]
async fn test_get_property_value_per_kind() -> Result<()> {
    let (provider, _temp_dir) = create_test_provider().await?;
    let other = insert_folder(&provider, None, "Other").await?;
    let due = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).single().expect("valid date");
    let data = DynamicData::new()
        .with_binary(
            "Binary",
            BinaryDataValue::from_bytes("a.bin", "application/octet-stream", vec![1, 2, 3]),
        )
        .with_text("Description", "long text")
        .with_references("Related", vec![other.node_id])
        .with_scalar("Title", ScalarValue::String("Hello".into()))
        .with_scalar("Count", ScalarValue::Int(42))
        .with_scalar("DueDate", ScalarValue::DateTime(due));
    let (_, version, _) = insert_with(&provider, None, "Doc", NODE_TYPE_FILE, data).await?;
    let v = version.version_id;

    match provider.get_property_value(v, "Binary").await? {
        Some(PropertyValue::Binary(binary)) => {
            assert_eq!(binary.size, 3);
            assert_eq!(binary.file_name, "a.bin");
            assert!(binary.stream.is_none());
        }
        other => panic!("unexpected binary value: {:?}", other),
    }
    assert_eq!(
        provider.get_property_value(v, "Description").await?,
        Some(PropertyValue::Text("long text".into()))
    );
    assert_eq!(
        provider.get_property_value(v, "Related").await?,
        Some(PropertyValue::Reference(vec![other.node_id]))
    );
    assert_eq!(
        provider.get_property_value(v, "Count").await?,
        Some(PropertyValue::Scalar(ScalarValue::Int(42)))
    );
    assert_eq!(
        provider.get_property_value(v, "DueDate").await?,
        Some(PropertyValue::Scalar(ScalarValue::DateTime(due)))
    );
    assert_eq!(provider.get_property_value(v, "Price").await?, None);
    assert_eq!(provider.get_property_value(v, "Thumbnail").await?, None);

    Ok(())
}

#[tokio::test]
async fn test_empty_references_read_as_none() -> Result<()> {
    let (provider, _temp_dir) = create_test_provider().await?;
    let (_, version, _) = insert_with(
        &provider,
        None,
        "Doc",
        NODE_TYPE_FILE,
        DynamicData::new().with_references("Related", vec![]),
    )
    .await?;

    assert_eq!(
        provider.get_property_value(version.version_id, "Related").await?,
        None
    );
    Ok(())
}

#[tokio::test]
async fn test_unknown_property_name() -> Result<()> {
    let (provider, _temp_dir) = create_test_provider().await?;
    let (_, version, _) =
        insert_with(&provider, None, "Doc", NODE_TYPE_FILE, DynamicData::new()).await?;

    let err = provider
        .get_property_value(version.version_id, "Missing")
        .await
        .expect_err("not registered");
    assert!(matches!(err, DataError::UnknownProperty { ref name } if name == "Missing"));

    let err = provider
        .set_property_value(version.version_id, "Missing", PropertyValue::Text("x".into()))
        .await
        .expect_err("not registered");
    assert!(matches!(err, DataError::UnknownProperty { .. }));

    Ok(())
}

#[tokio::test]
async fn test_set_text_and_references() -> Result<()> {
    let (provider, _temp_dir) = create_test_provider().await?;
    let a = insert_folder(&provider, None, "A").await?;
    let b = insert_folder(&provider, None, "B").await?;
    let (_, version, _) = insert_with(
        &provider,
        None,
        "Doc",
        NODE_TYPE_FILE,
        DynamicData::new().with_references("Related", vec![a.node_id]),
    )
    .await?;
    let v = version.version_id;

    provider
        .set_property_value(v, "Description", PropertyValue::Text("first".into()))
        .await?;
    provider
        .set_property_value(v, "Description", PropertyValue::Text("second".into()))
        .await?;
    assert_eq!(
        provider.get_property_value(v, "Description").await?,
        Some(PropertyValue::Text("second".into()))
    );
    assert_eq!(provider.get_long_text_count(Some(v)).await?, 1);

    provider
        .set_property_value(v, "Related", PropertyValue::Reference(vec![b.node_id, a.node_id]))
        .await?;
    assert_eq!(
        provider.get_property_value(v, "Related").await?,
        Some(PropertyValue::Reference(vec![b.node_id, a.node_id]))
    );

    let err = provider
        .set_property_value(9999, "Description", PropertyValue::Text("x".into()))
        .await
        .expect_err("version missing");
    assert!(matches!(err, DataError::NotFound { .. }));

    Ok(())
}

#[tokio::test]
async fn test_unsupported_writes() -> Result<()> {
    let (provider, _temp_dir) = create_test_provider().await?;
    let (_, version, _) =
        insert_with(&provider, None, "Doc", NODE_TYPE_FILE, DynamicData::new()).await?;
    let v = version.version_id;

    let err = provider
        .set_property_value(v, "Count", PropertyValue::Scalar(ScalarValue::Int(1)))
        .await
        .expect_err("scalar writes are not supported");
    assert!(matches!(err, DataError::NotSupported { .. }));
    assert!(!err.is_retriable());

    let err = provider
        .set_property_value(
            v,
            "Binary",
            PropertyValue::Binary(BinaryDataValue::from_bytes("a", "text/plain", vec![1])),
        )
        .await
        .expect_err("binary writes are not supported");
    assert!(matches!(err, DataError::NotSupported { .. }));

    Ok(())
}

#[tokio::test]
async fn test_kind_mismatch() -> Result<()> {
    let (provider, _temp_dir) = create_test_provider().await?;
    let (_, version, _) =
        insert_with(&provider, None, "Doc", NODE_TYPE_FILE, DynamicData::new()).await?;

    let err = provider
        .set_property_value(version.version_id, "Description", PropertyValue::Reference(vec![1]))
        .await
        .expect_err("Description is Text");
    assert!(matches!(err, DataError::PropertyKindMismatch { .. }));

    let data = DynamicData::new().with_scalar("Count", ScalarValue::String("three".into()));
    let err = insert_with(&provider, None, "Bad", NODE_TYPE_FILE, data)
        .await
        .expect_err("Count is Int")
        .downcast::<DataError>()?;
    assert!(matches!(err, DataError::PropertyKindMismatch { ref name, .. } if name == "Count"));

    Ok(())
}

#[tokio::test]
async fn test_removing_binary_by_empty_value() -> Result<()> {
    let (provider, _temp_dir) = create_test_provider().await?;
    let data = DynamicData::new().with_binary(
        "Binary",
        BinaryDataValue::from_bytes("a.txt", "text/plain", b"abc".to_vec()),
    );
    let (mut head, mut version, _) = insert_with(&provider, None, "Doc", NODE_TYPE_FILE, data).await?;
    assert_eq!(provider.get_binary_property_count(Some(version.version_id)).await?, 1);

    let mut update = DynamicData::new().with_binary("Binary", BinaryDataValue::default());
    provider
        .update_node(&mut head, &mut version, &mut update, &[])
        .await?;

    assert_eq!(provider.get_binary_property_count(Some(version.version_id)).await?, 0);
    assert!(update.binary_properties.is_empty());
    // The file row itself is left for orphan cleanup
    assert_eq!(provider.get_file_count().await?, 1);

    Ok(())
}

#[tokio::test]
async fn test_file_staging_and_delete() -> Result<()> {
    let (provider, _temp_dir) = create_test_provider().await?;
    let data = DynamicData::new().with_binary(
        "Binary",
        BinaryDataValue::from_bytes("a.txt", "text/plain", b"abc".to_vec()),
    );
    let (_, version, data) = insert_with(&provider, None, "Doc", NODE_TYPE_FILE, data).await?;
    let file_id = data.binary_properties["Binary"].file_id;

    provider.set_file_staging(file_id, true).await?;
    let binary = provider
        .load_binary_property_value(version.version_id, "Binary")
        .await?
        .expect("exists");
    assert!(binary.staging);

    let err = provider
        .set_file_staging(9999, false)
        .await
        .expect_err("file missing");
    assert!(matches!(err, DataError::NotFound { .. }));

    assert!(provider.delete_file(file_id).await?);
    assert!(!provider.delete_file(file_id).await?);
    assert!(provider.load_binary_stream(file_id).await?.is_none());

    Ok(())
}

#[tokio::test]
async fn test_direct_scalar_update_bypasses_token() -> Result<()> {
    let (provider, _temp_dir) = create_test_provider().await?;
    let (_, version, _) =
        insert_with(&provider, None, "Doc", NODE_TYPE_FILE, DynamicData::new()).await?;

    provider
        .update_dynamic_property(version.version_id, "Price", ScalarValue::Currency(1.25))
        .await?;

    assert_eq!(
        provider.get_property_value(version.version_id, "Price").await?,
        Some(PropertyValue::Scalar(ScalarValue::Currency(1.25)))
    );
    let reloaded = provider.load_version(version.version_id).await?.expect("exists");
    assert_eq!(reloaded.timestamp, version.timestamp);

    Ok(())
}
