use std::collections::BTreeMap;

use time::OffsetDateTime;

#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Float(f64),
    Bool(bool),
    Str(String),
}

/// The persistable unit: one row in the measurement table.
#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    pub measurement: String,
    pub timestamp: Option<OffsetDateTime>,
    pub tags: BTreeMap<String, String>,
    pub fields: BTreeMap<String, FieldValue>,
}

impl Point {
    pub fn new(measurement: impl Into<String>) -> Self {
        Self {
            measurement: measurement.into(),
            timestamp: None,
            tags: BTreeMap::new(),
            fields: BTreeMap::new(),
        }
    }

    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }

    pub fn field(&self, key: &str) -> Option<&FieldValue> {
        self.fields.get(key)
    }

    pub fn float_field(&self, key: &str) -> Option<f64> {
        match self.fields.get(key)? {
            FieldValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// True when `key` appears as either a tag or a field.
    pub fn has_key(&self, key: &str) -> bool {
        self.tags.contains_key(key) || self.fields.contains_key(key)
    }
}
