//! Tri-state attribute values and resource states.
//!
//! Terraform distinguishes a value that is set ([`AttributeValue::Known`]),
//! one that is explicitly absent ([`AttributeValue::Null`]) and one that will
//! only be known after apply ([`AttributeValue::Unknown`]). A [`ResourceState`]
//! maps every attribute of a schema to one of these.

use std::collections::BTreeMap;

use crate::schema::ResourceSchema;

/// A concrete attribute value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// A string.
    String(String),
    /// An integer.
    Int(i64),
    /// A floating point number.
    Float(f64),
    /// A boolean.
    Bool(bool),
    /// A list of values.
    List(Vec<AttributeValue>),
    /// A map of string keys to values.
    Map(BTreeMap<String, AttributeValue>),
}

/// A value that may be set, explicitly absent, or not yet known.
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeValue {
    /// The value is set.
    Known(Value),
    /// The value will be decided during apply.
    Unknown,
    /// The value is explicitly absent.
    Null,
}

impl AttributeValue {
    /// A known string value.
    pub fn string(value: impl Into<String>) -> Self {
        Self::Known(Value::String(value.into()))
    }

    /// A known integer value.
    pub fn int(value: i64) -> Self {
        Self::Known(Value::Int(value))
    }

    /// A known float value.
    pub fn float(value: f64) -> Self {
        Self::Known(Value::Float(value))
    }

    /// A known boolean value.
    pub fn bool(value: bool) -> Self {
        Self::Known(Value::Bool(value))
    }

    /// A known list value.
    pub fn list(values: impl IntoIterator<Item = AttributeValue>) -> Self {
        Self::Known(Value::List(values.into_iter().collect()))
    }

    /// A known map value.
    pub fn map<K: Into<String>>(entries: impl IntoIterator<Item = (K, AttributeValue)>) -> Self {
        Self::Known(Value::Map(
            entries.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        ))
    }

    /// Whether the value is set (it may still contain unknown elements).
    pub fn is_known(&self) -> bool {
        matches!(self, Self::Known(_))
    }

    /// Whether the value is not yet known.
    pub fn is_unknown(&self) -> bool {
        matches!(self, Self::Unknown)
    }

    /// Whether the value is explicitly absent.
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Whether the value or any nested element is unknown.
    pub fn contains_unknown(&self) -> bool {
        match self {
            Self::Unknown => true,
            Self::Null => false,
            Self::Known(Value::List(items)) => items.iter().any(Self::contains_unknown),
            Self::Known(Value::Map(entries)) => entries.values().any(Self::contains_unknown),
            Self::Known(_) => false,
        }
    }

    /// The string content, if this is a known string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Known(Value::String(s)) => Some(s),
            _ => None,
        }
    }

    /// The integer content, if this is a known integer.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Known(Value::Int(i)) => Some(*i),
            _ => None,
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        Self::string(value)
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        Self::string(value)
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        Self::int(value)
    }
}

impl From<f64> for AttributeValue {
    fn from(value: f64) -> Self {
        Self::float(value)
    }
}

impl From<bool> for AttributeValue {
    fn from(value: bool) -> Self {
        Self::bool(value)
    }
}

impl<T: Into<AttributeValue>> From<Option<T>> for AttributeValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

/// The values of one resource instance, keyed by attribute name.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ResourceState {
    values: BTreeMap<String, AttributeValue>,
}

impl ResourceState {
    /// Create an empty state.
    pub fn new() -> Self {
        Self::default()
    }

    /// A state holding `Null` for every attribute in the schema.
    pub fn nulls(schema: &ResourceSchema) -> Self {
        schema
            .attributes()
            .iter()
            .map(|attr| (attr.name.clone(), AttributeValue::Null))
            .collect()
    }

    /// Set a value, builder style.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        self.set(name, value);
        self
    }

    /// Set a value.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<AttributeValue>) {
        self.values.insert(name.into(), value.into());
    }

    /// Get a value by attribute name.
    pub fn get(&self, name: &str) -> Option<&AttributeValue> {
        self.values.get(name)
    }

    /// Get a value, treating a missing attribute as `Null`.
    pub fn get_or_null(&self, name: &str) -> &AttributeValue {
        const NULL: AttributeValue = AttributeValue::Null;
        self.values.get(name).unwrap_or(&NULL)
    }

    /// Whether the attribute is present.
    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    /// Iterate over `(name, value)` pairs in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &AttributeValue)> {
        self.values.iter()
    }

    /// Number of attributes present.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether no attributes are present.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl FromIterator<(String, AttributeValue)> for ResourceState {
    fn from_iter<I: IntoIterator<Item = (String, AttributeValue)>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for ResourceState {
    type Item = (String, AttributeValue);
    type IntoIter = std::collections::btree_map::IntoIter<String, AttributeValue>;

    fn into_iter(self) -> Self::IntoIter {
        self.values.into_iter()
    }
}
