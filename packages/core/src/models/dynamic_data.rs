//! Dynamic Property Values
//!
//! A version carries a set of dynamically typed properties. Each property
//! lives in exactly one physical store chosen by its declared kind:
//!
//! | Kind      | Bucket                  | Physical store                      |
//! |-----------|-------------------------|-------------------------------------|
//! | Binary    | `binary_properties`     | `files` + `binary_properties` rows  |
//! | Reference | `reference_properties`  | one row per referred node           |
//! | Text      | `long_text_properties`  | one `long_text_properties` row      |
//! | Scalar    | `dynamic_properties`    | packed JSON on the version row      |

use crate::schema::DataType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Binary property value: metadata of a file row plus optional content
///
/// `id` is the `binary_properties` row id and `file_id` the `files` row id;
/// both are written back by the store when the value is saved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct BinaryDataValue {
    pub id: i64,
    pub file_id: i64,
    pub size: i64,
    pub content_type: String,
    pub file_name: String,
    pub staging: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<Vec<u8>>,
}

impl BinaryDataValue {
    /// Unsaved value carrying the given content; `size` follows the content
    pub fn from_bytes(
        file_name: impl Into<String>,
        content_type: impl Into<String>,
        content: Vec<u8>,
    ) -> Self {
        Self {
            id: 0,
            file_id: 0,
            size: content.len() as i64,
            content_type: content_type.into(),
            file_name: file_name.into(),
            staging: false,
            stream: Some(content),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }
}

/// Value of a packed scalar property
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum ScalarValue {
    String(String),
    Int(i64),
    Currency(f64),
    DateTime(DateTime<Utc>),
}

impl ScalarValue {
    /// Declared data type this value satisfies
    pub fn data_type(&self) -> DataType {
        match self {
            ScalarValue::String(_) => DataType::String,
            ScalarValue::Int(_) => DataType::Int,
            ScalarValue::Currency(_) => DataType::Currency,
            ScalarValue::DateTime(_) => DataType::DateTime,
        }
    }
}

/// A single property value, tagged by the physical store it belongs to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PropertyValue {
    Binary(BinaryDataValue),
    Reference(Vec<i64>),
    Text(String),
    Scalar(ScalarValue),
}

impl PropertyValue {
    /// Whether this value may be stored under a property of `data_type`
    pub fn fits(&self, data_type: DataType) -> bool {
        match self {
            PropertyValue::Binary(_) => data_type == DataType::Binary,
            PropertyValue::Reference(_) => data_type == DataType::Reference,
            PropertyValue::Text(_) => data_type == DataType::Text,
            PropertyValue::Scalar(value) => value.data_type() == data_type,
        }
    }
}

/// All dynamic properties of a version, bucketed by physical store
///
/// Keys are property names as registered in the schema registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct DynamicData {
    pub binary_properties: BTreeMap<String, BinaryDataValue>,
    pub reference_properties: BTreeMap<String, Vec<i64>>,
    pub long_text_properties: BTreeMap<String, String>,
    pub dynamic_properties: BTreeMap<String, ScalarValue>,
}

impl DynamicData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_binary(mut self, name: impl Into<String>, value: BinaryDataValue) -> Self {
        self.binary_properties.insert(name.into(), value);
        self
    }

    pub fn with_references(mut self, name: impl Into<String>, node_ids: Vec<i64>) -> Self {
        self.reference_properties.insert(name.into(), node_ids);
        self
    }

    pub fn with_text(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.long_text_properties.insert(name.into(), value.into());
        self
    }

    pub fn with_scalar(mut self, name: impl Into<String>, value: ScalarValue) -> Self {
        self.dynamic_properties.insert(name.into(), value);
        self
    }

    /// Place a tagged value into its bucket, replacing any previous value
    pub fn set(&mut self, name: impl Into<String>, value: PropertyValue) {
        let name = name.into();
        self.remove(&name);
        match value {
            PropertyValue::Binary(v) => {
                self.binary_properties.insert(name, v);
            }
            PropertyValue::Reference(v) => {
                self.reference_properties.insert(name, v);
            }
            PropertyValue::Text(v) => {
                self.long_text_properties.insert(name, v);
            }
            PropertyValue::Scalar(v) => {
                self.dynamic_properties.insert(name, v);
            }
        }
    }

    /// Look a property up in whichever bucket holds it
    pub fn get(&self, name: &str) -> Option<PropertyValue> {
        if let Some(v) = self.binary_properties.get(name) {
            return Some(PropertyValue::Binary(v.clone()));
        }
        if let Some(v) = self.reference_properties.get(name) {
            return Some(PropertyValue::Reference(v.clone()));
        }
        if let Some(v) = self.long_text_properties.get(name) {
            return Some(PropertyValue::Text(v.clone()));
        }
        self.dynamic_properties
            .get(name)
            .map(|v| PropertyValue::Scalar(v.clone()))
    }

    pub fn remove(&mut self, name: &str) {
        self.binary_properties.remove(name);
        self.reference_properties.remove(name);
        self.long_text_properties.remove(name);
        self.dynamic_properties.remove(name);
    }

    /// Names of every property present, sorted
    pub fn property_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .binary_properties
            .keys()
            .chain(self.reference_properties.keys())
            .chain(self.long_text_properties.keys())
            .chain(self.dynamic_properties.keys())
            .cloned()
            .collect();
        names.sort();
        names.dedup();
        names
    }

    pub fn is_empty(&self) -> bool {
        self.binary_properties.is_empty()
            && self.reference_properties.is_empty()
            && self.long_text_properties.is_empty()
            && self.dynamic_properties.is_empty()
    }

    /// Overlay `other` on top of `self`, property by property
    pub fn merge(&mut self, other: DynamicData) {
        for (name, value) in other.binary_properties {
            self.set(name, PropertyValue::Binary(value));
        }
        for (name, value) in other.reference_properties {
            self.set(name, PropertyValue::Reference(value));
        }
        for (name, value) in other.long_text_properties {
            self.set(name, PropertyValue::Text(value));
        }
        for (name, value) in other.dynamic_properties {
            self.set(name, PropertyValue::Scalar(value));
        }
    }
}
