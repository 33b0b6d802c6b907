//! Dynamic Property Store
//!
//! Reads and writes typed property values against the physical store chosen
//! by the property's declared kind (see `crate::schema::StorageKind`).
//!
//! # Dispatcher
//!
//! `get_property_value` / `set_property_value` resolve the name through the
//! schema registry and match the storage kind exhaustively:
//!
//! - Binary: read returns the file reference; write is not supported here
//!   (binary values are written with their version through `save_in_tx`)
//! - Reference: read returns the referred ids or `None`; write replaces the set
//! - LongText: read returns the value or `None`; write replaces length + value
//! - Packed scalars: read looks the name up in the version blob; write is not
//!   supported

use crate::db::database::{begin_immediate, finish, format_timestamp, DatabaseService};
use crate::db::error::{DataError, DatabaseError};
use crate::db::versions::placeholders;
use crate::models::{BinaryDataValue, DynamicData, PropertyValue, ScalarValue};
use crate::schema::{DataType, PropertyType, SchemaRegistry, StorageKind};
use chrono::Utc;
use libsql::{params, Connection};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Writes the dispatcher supports
enum PropertyWrite {
    Text(String),
    References(Vec<i64>),
}

/// Property dispatcher over the kind-specific stores
#[derive(Debug, Clone)]
pub struct PropertyStore {
    db: Arc<DatabaseService>,
    schema: Arc<SchemaRegistry>,
}

impl PropertyStore {
    pub fn new(db: Arc<DatabaseService>, schema: Arc<SchemaRegistry>) -> Self {
        Self { db, schema }
    }

    pub fn schema(&self) -> &Arc<SchemaRegistry> {
        &self.schema
    }

    fn resolve(&self, name: &str) -> Result<&PropertyType, DataError> {
        self.schema
            .resolve(name)
            .ok_or_else(|| DataError::unknown_property(name))
    }

    /// Read one property of a version
    pub async fn get_property_value(
        &self,
        version_id: i64,
        name: &str,
    ) -> Result<Option<PropertyValue>, DataError> {
        let property_type = self.resolve(name)?;
        let conn = self.db.connect_with_timeout().await?;

        let value = match property_type.data_type.storage_kind() {
            StorageKind::Binary => load_binary_in(&conn, version_id, property_type.id)
                .await?
                .map(PropertyValue::Binary),
            StorageKind::Reference => {
                let ids = load_references_in(&conn, version_id, property_type.id).await?;
                (!ids.is_empty()).then_some(PropertyValue::Reference(ids))
            }
            StorageKind::LongText => load_long_text_in(&conn, version_id, property_type.id)
                .await?
                .map(PropertyValue::Text),
            StorageKind::Packed => load_packed_in(&conn, version_id)
                .await?
                .remove(name)
                .map(PropertyValue::Scalar),
        };
        Ok(value)
    }

    /// Write one property of an existing version
    pub async fn set_property_value(
        &self,
        version_id: i64,
        name: &str,
        value: PropertyValue,
    ) -> Result<(), DataError> {
        let property_type = self.resolve(name)?.clone();
        if !value.fits(property_type.data_type) {
            return Err(DataError::kind_mismatch(
                name,
                property_type.data_type,
                value_kind(&value),
            ));
        }

        let write = match (property_type.data_type.storage_kind(), value) {
            (StorageKind::LongText, PropertyValue::Text(text)) => PropertyWrite::Text(text),
            (StorageKind::Reference, PropertyValue::Reference(ids)) => {
                PropertyWrite::References(ids)
            }
            (StorageKind::Binary, _) => {
                return Err(DataError::not_supported(format!(
                    "writing binary property {} through the property dispatcher",
                    name
                )))
            }
            (StorageKind::Packed, _) | (StorageKind::LongText, _) | (StorageKind::Reference, _) => {
                return Err(DataError::not_supported(format!(
                    "writing {} property {} through the property dispatcher",
                    property_type.data_type, name
                )))
            }
        };

        let conn = self.db.connect_with_timeout().await?;
        begin_immediate(&conn).await?;
        let result = async {
            ensure_version_exists(&conn, version_id).await?;
            match &write {
                PropertyWrite::Text(text) => {
                    upsert_long_text_in_tx(&conn, version_id, property_type.id, text).await
                }
                PropertyWrite::References(ids) => {
                    replace_references_in_tx(&conn, version_id, property_type.id, ids).await
                }
            }
        }
        .await;
        finish(&conn, result).await?;

        tracing::debug!("Set property {} of version {}", name, version_id);
        Ok(())
    }

    /// Binary property metadata (no content)
    pub async fn load_binary_property_value(
        &self,
        version_id: i64,
        name: &str,
    ) -> Result<Option<BinaryDataValue>, DataError> {
        let property_type = self.resolve(name)?;
        if property_type.data_type != DataType::Binary {
            return Err(DataError::kind_mismatch(name, property_type.data_type, "Binary"));
        }
        let conn = self.db.connect_with_timeout().await?;
        load_binary_in(&conn, version_id, property_type.id).await
    }

    /// Content of a file row
    pub async fn load_binary_stream(&self, file_id: i64) -> Result<Option<Vec<u8>>, DataError> {
        let conn = self.db.connect_with_timeout().await?;
        let mut rows = conn
            .query("SELECT stream FROM files WHERE file_id = ?", [file_id])
            .await
            .map_err(|e| {
                DatabaseError::sql_execution(format!("Failed to load file {}: {}", file_id, e))
            })?;
        match rows.next().await? {
            Some(row) => {
                let stream: Option<Vec<u8>> = row.get(0)?;
                Ok(Some(stream.unwrap_or_default()))
            }
            None => Ok(None),
        }
    }

    /// Long texts of a version by name, including ones skipped by lazy loading
    pub async fn load_text_properties(
        &self,
        version_id: i64,
        names: &[&str],
    ) -> Result<BTreeMap<String, String>, DataError> {
        let mut ids = Vec::with_capacity(names.len());
        for name in names {
            let property_type = self.resolve(name)?;
            if property_type.data_type != DataType::Text {
                return Err(DataError::kind_mismatch(*name, property_type.data_type, "Text"));
            }
            ids.push(property_type.id);
        }
        if ids.is_empty() {
            return Ok(BTreeMap::new());
        }

        let conn = self.db.connect_with_timeout().await?;
        let sql = format!(
            "SELECT property_type_id, value FROM long_text_properties
             WHERE version_id = ? AND property_type_id IN ({})",
            placeholders(ids.len())
        );
        let mut values: Vec<libsql::Value> = vec![version_id.into()];
        values.extend(ids.iter().map(|id| libsql::Value::from(*id)));
        let mut rows = conn.query(&sql, values).await.map_err(|e| {
            DatabaseError::sql_execution(format!(
                "Failed to load text properties of version {}: {}",
                version_id, e
            ))
        })?;

        let mut texts = BTreeMap::new();
        while let Some(row) = rows.next().await? {
            let property_type_id: i64 = row.get(0)?;
            if let Some(property_type) = self.schema.resolve_id(property_type_id) {
                texts.insert(property_type.name.clone(), row.get(1)?);
            }
        }
        Ok(texts)
    }

    /// Flip the staging flag of a file row
    pub async fn set_file_staging(&self, file_id: i64, staging: bool) -> Result<(), DataError> {
        let conn = self.db.connect_with_timeout().await?;
        let affected = conn
            .execute(
                "UPDATE files SET staging = ? WHERE file_id = ?",
                params![staging as i64, file_id],
            )
            .await
            .map_err(|e| {
                DatabaseError::sql_execution(format!(
                    "Failed to set staging of file {}: {}",
                    file_id, e
                ))
            })?;
        if affected == 0 {
            return Err(DataError::not_found(format!("File {}", file_id)));
        }
        tracing::debug!("File {} staging = {}", file_id, staging);
        Ok(())
    }

    /// Delete a file row; returns whether it existed
    pub async fn delete_file(&self, file_id: i64) -> Result<bool, DataError> {
        let conn = self.db.connect_with_timeout().await?;
        let affected = conn
            .execute("DELETE FROM files WHERE file_id = ?", [file_id])
            .await
            .map_err(|e| {
                DatabaseError::sql_execution(format!("Failed to delete file {}: {}", file_id, e))
            })?;
        tracing::debug!("Deleted file {} (existed: {})", file_id, affected > 0);
        Ok(affected > 0)
    }

    /// Check every supplied property against its registered kind
    pub fn validate(&self, data: &DynamicData) -> Result<(), DataError> {
        for name in data.binary_properties.keys() {
            self.expect_kind(name, |t| t == DataType::Binary, "Binary")?;
        }
        for name in data.reference_properties.keys() {
            self.expect_kind(name, |t| t == DataType::Reference, "Reference")?;
        }
        for name in data.long_text_properties.keys() {
            self.expect_kind(name, |t| t == DataType::Text, "Text")?;
        }
        for (name, value) in &data.dynamic_properties {
            let expected = value.data_type();
            self.expect_kind(name, |t| t == expected, &expected.to_string())?;
        }
        Ok(())
    }

    fn expect_kind(
        &self,
        name: &str,
        accepts: impl Fn(DataType) -> bool,
        supplied: &str,
    ) -> Result<(), DataError> {
        let property_type = self.resolve(name)?;
        if accepts(property_type.data_type) {
            Ok(())
        } else {
            Err(DataError::kind_mismatch(name, property_type.data_type, supplied))
        }
    }

    /// Persist the supplied properties of a version
    ///
    /// Properties not present in `data` are left untouched. Binary values with
    /// content get a new file row; values without content keep pointing at
    /// `file_id`; a value with neither removes the property. Generated ids are
    /// written back into `data`.
    pub(crate) async fn save_in_tx(
        &self,
        conn: &Connection,
        version_id: i64,
        data: &mut DynamicData,
    ) -> Result<(), DataError> {
        self.validate(data)?;

        let mut removed_binaries = Vec::new();
        for (name, value) in data.binary_properties.iter_mut() {
            let property_type_id = self.resolve(name)?.id;
            if !save_binary_in_tx(conn, version_id, property_type_id, value).await? {
                removed_binaries.push(name.clone());
            }
        }
        for name in removed_binaries {
            data.binary_properties.remove(&name);
        }

        for (name, ids) in &data.reference_properties {
            let property_type_id = self.resolve(name)?.id;
            replace_references_in_tx(conn, version_id, property_type_id, ids).await?;
        }

        for (name, text) in &data.long_text_properties {
            let property_type_id = self.resolve(name)?.id;
            upsert_long_text_in_tx(conn, version_id, property_type_id, text).await?;
        }

        if !data.dynamic_properties.is_empty() {
            let mut packed = load_packed_in(conn, version_id).await?;
            packed.extend(
                data.dynamic_properties
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone())),
            );
            store_packed_in_tx(conn, version_id, &packed).await?;
        }
        Ok(())
    }

    /// Load every property of a version
    ///
    /// Long texts longer than `lazy_threshold` characters are skipped; fetch
    /// them with `load_text_properties`. Rows whose property type is no
    /// longer registered are ignored.
    pub(crate) async fn load_in(
        &self,
        conn: &Connection,
        version_id: i64,
        lazy_threshold: usize,
    ) -> Result<DynamicData, DataError> {
        let mut data = DynamicData {
            dynamic_properties: load_packed_in(conn, version_id).await?,
            ..DynamicData::default()
        };

        let mut rows = conn
            .query(
                "SELECT b.property_type_id, b.binary_property_id, f.file_id, f.size,
                        f.content_type, f.file_name, f.staging
                 FROM binary_properties b JOIN files f ON f.file_id = b.file_id
                 WHERE b.version_id = ?",
                [version_id],
            )
            .await?;
        while let Some(row) = rows.next().await? {
            if let Some(name) = self.name_of(row.get(0)?) {
                data.binary_properties.insert(
                    name,
                    BinaryDataValue {
                        id: row.get(1)?,
                        file_id: row.get(2)?,
                        size: row.get(3)?,
                        content_type: row.get(4)?,
                        file_name: row.get(5)?,
                        staging: row.get(6)?,
                        stream: None,
                    },
                );
            }
        }

        let mut rows = conn
            .query(
                "SELECT property_type_id, referred_node_id FROM reference_properties
                 WHERE version_id = ? ORDER BY reference_property_id",
                [version_id],
            )
            .await?;
        while let Some(row) = rows.next().await? {
            if let Some(name) = self.name_of(row.get(0)?) {
                data.reference_properties
                    .entry(name)
                    .or_default()
                    .push(row.get(1)?);
            }
        }

        let mut rows = conn
            .query(
                "SELECT property_type_id, value FROM long_text_properties
                 WHERE version_id = ? AND length <= ?",
                [version_id, lazy_threshold as i64],
            )
            .await?;
        while let Some(row) = rows.next().await? {
            if let Some(name) = self.name_of(row.get(0)?) {
                data.long_text_properties.insert(name, row.get(1)?);
            }
        }

        Ok(data)
    }

    fn name_of(&self, property_type_id: i64) -> Option<String> {
        match self.schema.resolve_id(property_type_id) {
            Some(property_type) => Some(property_type.name.clone()),
            None => {
                tracing::warn!(
                    "Skipping value of unregistered property type {}",
                    property_type_id
                );
                None
            }
        }
    }
}

fn value_kind(value: &PropertyValue) -> String {
    match value {
        PropertyValue::Binary(_) => "Binary".to_string(),
        PropertyValue::Reference(_) => "Reference".to_string(),
        PropertyValue::Text(_) => "Text".to_string(),
        PropertyValue::Scalar(scalar) => scalar.data_type().to_string(),
    }
}

async fn ensure_version_exists(conn: &Connection, version_id: i64) -> Result<(), DataError> {
    let mut rows = conn
        .query("SELECT 1 FROM versions WHERE version_id = ?", [version_id])
        .await?;
    if rows.next().await?.is_some() {
        Ok(())
    } else {
        Err(DataError::not_found(format!("Version {}", version_id)))
    }
}

async fn load_binary_in(
    conn: &Connection,
    version_id: i64,
    property_type_id: i64,
) -> Result<Option<BinaryDataValue>, DataError> {
    let mut rows = conn
        .query(
            "SELECT b.binary_property_id, f.file_id, f.size, f.content_type, f.file_name, f.staging
             FROM binary_properties b JOIN files f ON f.file_id = b.file_id
             WHERE b.version_id = ? AND b.property_type_id = ?",
            [version_id, property_type_id],
        )
        .await
        .map_err(|e| {
            DatabaseError::sql_execution(format!(
                "Failed to load binary property of version {}: {}",
                version_id, e
            ))
        })?;
    match rows.next().await? {
        Some(row) => Ok(Some(BinaryDataValue {
            id: row.get(0)?,
            file_id: row.get(1)?,
            size: row.get(2)?,
            content_type: row.get(3)?,
            file_name: row.get(4)?,
            staging: row.get(5)?,
            stream: None,
        })),
        None => Ok(None),
    }
}

async fn load_references_in(
    conn: &Connection,
    version_id: i64,
    property_type_id: i64,
) -> Result<Vec<i64>, DataError> {
    let mut rows = conn
        .query(
            "SELECT referred_node_id FROM reference_properties
             WHERE version_id = ? AND property_type_id = ? ORDER BY reference_property_id",
            [version_id, property_type_id],
        )
        .await?;
    let mut ids = Vec::new();
    while let Some(row) = rows.next().await? {
        ids.push(row.get(0)?);
    }
    Ok(ids)
}

async fn load_long_text_in(
    conn: &Connection,
    version_id: i64,
    property_type_id: i64,
) -> Result<Option<String>, DataError> {
    let mut rows = conn
        .query(
            "SELECT value FROM long_text_properties WHERE version_id = ? AND property_type_id = ?",
            [version_id, property_type_id],
        )
        .await?;
    match rows.next().await? {
        Some(row) => Ok(Some(row.get(0)?)),
        None => Ok(None),
    }
}

/// Packed scalars of a version; empty when the version does not exist
pub(crate) async fn load_packed_in(
    conn: &Connection,
    version_id: i64,
) -> Result<BTreeMap<String, ScalarValue>, DataError> {
    let mut rows = conn
        .query(
            "SELECT dynamic_properties FROM versions WHERE version_id = ?",
            [version_id],
        )
        .await?;
    match rows.next().await? {
        Some(row) => {
            let packed: String = row.get(0)?;
            Ok(serde_json::from_str(&packed)?)
        }
        None => Ok(BTreeMap::new()),
    }
}

pub(crate) async fn store_packed_in_tx(
    conn: &Connection,
    version_id: i64,
    packed: &BTreeMap<String, ScalarValue>,
) -> Result<(), DataError> {
    conn.execute(
        "UPDATE versions SET dynamic_properties = ? WHERE version_id = ?",
        params![serde_json::to_string(packed)?, version_id],
    )
    .await
    .map_err(|e| {
        DatabaseError::sql_execution(format!(
            "Failed to store scalar properties of version {}: {}",
            version_id, e
        ))
    })?;
    Ok(())
}

/// Returns false when the value carried nothing and the property was removed
async fn save_binary_in_tx(
    conn: &Connection,
    version_id: i64,
    property_type_id: i64,
    value: &mut BinaryDataValue,
) -> Result<bool, DataError> {
    conn.execute(
        "DELETE FROM binary_properties WHERE version_id = ? AND property_type_id = ?",
        [version_id, property_type_id],
    )
    .await
    .map_err(|e| {
        DatabaseError::sql_execution(format!(
            "Failed to clear binary property of version {}: {}",
            version_id, e
        ))
    })?;

    if let Some(stream) = value.stream.as_ref() {
        value.size = stream.len() as i64;
        conn.execute(
            "INSERT INTO files (content_type, file_name, size, stream, staging, creation_date)
             VALUES (?, ?, ?, ?, ?, ?)",
            params![
                value.content_type.as_str(),
                value.file_name.as_str(),
                value.size,
                stream.clone(),
                value.staging as i64,
                format_timestamp(&Utc::now()),
            ],
        )
        .await
        .map_err(|e| DatabaseError::sql_execution(format!("Failed to insert file: {}", e)))?;
        value.file_id = conn.last_insert_rowid();
    } else if value.file_id > 0 {
        let mut rows = conn
            .query("SELECT size FROM files WHERE file_id = ?", [value.file_id])
            .await?;
        match rows.next().await? {
            Some(row) => value.size = row.get(0)?,
            None => return Err(DataError::not_found(format!("File {}", value.file_id))),
        }
    } else {
        value.id = 0;
        return Ok(false);
    }

    conn.execute(
        "INSERT INTO binary_properties (version_id, property_type_id, file_id) VALUES (?, ?, ?)",
        [version_id, property_type_id, value.file_id],
    )
    .await
    .map_err(|e| {
        DatabaseError::sql_execution(format!(
            "Failed to insert binary property of version {}: {}",
            version_id, e
        ))
    })?;
    value.id = conn.last_insert_rowid();
    Ok(true)
}

async fn replace_references_in_tx(
    conn: &Connection,
    version_id: i64,
    property_type_id: i64,
    referred_node_ids: &[i64],
) -> Result<(), DataError> {
    conn.execute(
        "DELETE FROM reference_properties WHERE version_id = ? AND property_type_id = ?",
        [version_id, property_type_id],
    )
    .await
    .map_err(|e| {
        DatabaseError::sql_execution(format!(
            "Failed to clear references of version {}: {}",
            version_id, e
        ))
    })?;
    for referred in referred_node_ids {
        conn.execute(
            "INSERT OR IGNORE INTO reference_properties (version_id, property_type_id, referred_node_id)
             VALUES (?, ?, ?)",
            [version_id, property_type_id, *referred],
        )
        .await
        .map_err(|e| {
            DatabaseError::sql_execution(format!(
                "Failed to insert reference {} of version {}: {}",
                referred, version_id, e
            ))
        })?;
    }
    Ok(())
}

/// Length is always derived from the stored value
async fn upsert_long_text_in_tx(
    conn: &Connection,
    version_id: i64,
    property_type_id: i64,
    value: &str,
) -> Result<(), DataError> {
    conn.execute(
        "INSERT INTO long_text_properties (version_id, property_type_id, length, value)
         VALUES (?, ?, ?, ?)
         ON CONFLICT (version_id, property_type_id)
         DO UPDATE SET length = excluded.length, value = excluded.value",
        params![
            version_id,
            property_type_id,
            value.chars().count() as i64,
            value
        ],
    )
    .await
    .map_err(|e| {
        DatabaseError::sql_execution(format!(
            "Failed to write long text of version {}: {}",
            version_id, e
        ))
    })?;
    Ok(())
}

/// Copy every property row of `source` onto `target`
///
/// File rows are shared, not duplicated.
pub(crate) async fn copy_properties_in_tx(
    conn: &Connection,
    source_version_id: i64,
    target_version_id: i64,
) -> Result<(), DataError> {
    let statements = [
        (
            "binary properties",
            "INSERT INTO binary_properties (version_id, property_type_id, file_id)
             SELECT ?, property_type_id, file_id FROM binary_properties WHERE version_id = ?",
        ),
        (
            "references",
            "INSERT INTO reference_properties (version_id, property_type_id, referred_node_id)
             SELECT ?, property_type_id, referred_node_id FROM reference_properties
             WHERE version_id = ? ORDER BY reference_property_id",
        ),
        (
            "long texts",
            "INSERT INTO long_text_properties (version_id, property_type_id, length, value)
             SELECT ?, property_type_id, length, value FROM long_text_properties
             WHERE version_id = ?",
        ),
    ];
    for (what, sql) in statements {
        conn.execute(sql, [target_version_id, source_version_id])
            .await
            .map_err(|e| {
                DatabaseError::sql_execution(format!(
                    "Failed to copy {} from version {} to {}: {}",
                    what, source_version_id, target_version_id, e
                ))
            })?;
    }

    let packed = load_packed_in(conn, source_version_id).await?;
    store_packed_in_tx(conn, target_version_id, &packed).await
}

/// Remove every binary, reference and long-text row of a version
pub(crate) async fn clear_properties_in_tx(
    conn: &Connection,
    version_id: i64,
) -> Result<(), DataError> {
    for table in [
        "binary_properties",
        "reference_properties",
        "long_text_properties",
    ] {
        conn.execute(
            &format!("DELETE FROM {} WHERE version_id = ?", table),
            [version_id],
        )
        .await
        .map_err(|e| {
            DatabaseError::sql_execution(format!(
                "Failed to clear {} of version {}: {}",
                table, version_id, e
            ))
        })?;
    }
    Ok(())
}
