//! Schema Registry
//!
//! Resolves property names to typed descriptors. The registry is an immutable
//! snapshot: it is built once (usually from JSON) and shared as
//! `Arc<SchemaRegistry>` by every component that needs property metadata, so a
//! running operation never observes schema drift.
//!
//! # JSON Format
//!
//! ```json
//! [
//!   { "id": 1, "name": "Binary", "dataType": "Binary" },
//!   { "id": 2, "name": "Description", "dataType": "Text" },
//!   { "id": 3, "name": "Keywords", "dataType": "String" }
//! ]
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Declared data type of a dynamic property
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    String,
    Text,
    Int,
    Currency,
    DateTime,
    Binary,
    Reference,
}

/// Physical store a data type is persisted in
///
/// Exactly one store per data type, so a property of a version is never split
/// across two stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageKind {
    /// `files` + `binary_properties` rows
    Binary,
    /// One `reference_properties` row per referred node
    Reference,
    /// One `long_text_properties` row
    LongText,
    /// Packed into the version's `dynamic_properties` blob
    Packed,
}

impl DataType {
    pub fn storage_kind(self) -> StorageKind {
        match self {
            DataType::Binary => StorageKind::Binary,
            DataType::Reference => StorageKind::Reference,
            DataType::Text => StorageKind::LongText,
            DataType::String | DataType::Int | DataType::Currency | DataType::DateTime => {
                StorageKind::Packed
            }
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataType::String => "String",
            DataType::Text => "Text",
            DataType::Int => "Int",
            DataType::Currency => "Currency",
            DataType::DateTime => "DateTime",
            DataType::Binary => "Binary",
            DataType::Reference => "Reference",
        };
        f.write_str(name)
    }
}

/// Typed descriptor of a dynamic property
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropertyType {
    pub id: i64,
    pub name: String,
    pub data_type: DataType,
}

impl PropertyType {
    pub fn new(id: i64, name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            id,
            name: name.into(),
            data_type,
        }
    }
}

/// Errors raised while building a registry
#[derive(Error, Debug)]
pub enum SchemaError {
    #[error("Duplicate property type id {id} ('{first}' and '{second}')")]
    DuplicateId {
        id: i64,
        first: String,
        second: String,
    },

    #[error("Duplicate property type name '{0}'")]
    DuplicateName(String),

    #[error("Invalid property type id {id} for '{name}': ids must be positive")]
    InvalidId { id: i64, name: String },

    #[error("Schema JSON could not be parsed: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Immutable name/id index over property types
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    by_name: HashMap<String, PropertyType>,
    by_id: HashMap<i64, PropertyType>,
}

impl SchemaRegistry {
    /// Build a registry, rejecting duplicate names or ids
    pub fn new(property_types: Vec<PropertyType>) -> Result<Self, SchemaError> {
        let mut by_name = HashMap::with_capacity(property_types.len());
        let mut by_id = HashMap::with_capacity(property_types.len());

        for property_type in property_types {
            if property_type.id <= 0 {
                return Err(SchemaError::InvalidId {
                    id: property_type.id,
                    name: property_type.name,
                });
            }
            if by_name.contains_key(&property_type.name) {
                return Err(SchemaError::DuplicateName(property_type.name));
            }
            if let Some(existing) = by_id.get(&property_type.id) {
                let existing: &PropertyType = existing;
                return Err(SchemaError::DuplicateId {
                    id: property_type.id,
                    first: existing.name.clone(),
                    second: property_type.name,
                });
            }
            by_id.insert(property_type.id, property_type.clone());
            by_name.insert(property_type.name.clone(), property_type);
        }

        Ok(Self { by_name, by_id })
    }

    /// Parse a JSON array of property types
    pub fn from_json_str(json: &str) -> Result<Self, SchemaError> {
        let property_types: Vec<PropertyType> = serde_json::from_str(json)?;
        Self::new(property_types)
    }

    /// Wrap into the shared snapshot handed to the stores
    pub fn into_shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// Resolve a property name
    pub fn resolve(&self, name: &str) -> Option<&PropertyType> {
        self.by_name.get(name)
    }

    /// Resolve a property type id
    pub fn resolve_id(&self, id: i64) -> Option<&PropertyType> {
        self.by_id.get(&id)
    }

    /// All property types, ordered by id
    pub fn property_types(&self) -> Vec<&PropertyType> {
        let mut types: Vec<&PropertyType> = self.by_id.values().collect();
        types.sort_by_key(|pt| pt.id);
        types
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}
