//! Configuration validation helpers.
//!
//! This module validates a [`ResourceState`] built from configuration against
//! its [`ResourceSchema`]. Every problem becomes a [`Diagnostic`] carrying the
//! attribute path it refers to.
//!
//! # Example
//!
//! ```
//! use tfplugin_sdk::schema::{Attribute, SchemaBuilder};
//! use tfplugin_sdk::validation::validate;
//! use tfplugin_sdk::{AttributeValue, ResourceState};
//!
//! let schema = SchemaBuilder::new()
//!     .attribute("name", Attribute::required_string())
//!     .attribute("count", Attribute::optional_int())
//!     .build()
//!     .unwrap();
//!
//! // Valid input
//! let config = ResourceState::nulls(&schema).with("name", "test").with("count", 42i64);
//! assert!(validate(&schema, &config).is_empty());
//!
//! // Invalid input - wrong type for count
//! let config = ResourceState::nulls(&schema)
//!     .with("name", "test")
//!     .with("count", "not a number");
//! let diagnostics = validate(&schema, &config);
//! assert_eq!(diagnostics.len(), 1);
//! assert_eq!(diagnostics[0].attribute.as_ref().unwrap().to_string(), "count");
//! ```

use crate::schema::{AttributeKind, AttributePath, AttributeSchema, Diagnostic, ResourceSchema, ScalarKind};
use crate::value::{AttributeValue, ResourceState, Value};

/// Validate a configuration against a schema.
///
/// Returns a list of diagnostics for any validation errors found.
/// An empty list means the configuration is valid.
///
/// # Validation Rules
///
/// - Required attributes must not be null (they may still be unknown)
/// - Computed-only attributes must not be set by configuration
/// - Attribute values must match their declared kind
/// - List elements must not be null
/// - Attributes the schema does not declare are rejected
pub fn validate(schema: &ResourceSchema, config: &ResourceState) -> Vec<Diagnostic> {
    let mut diagnostics = missing_required(schema, config, true);

    for (name, value) in config.iter() {
        let path = AttributePath::attribute(name.clone());
        match schema.attribute(name) {
            None => diagnostics.push(
                Diagnostic::error(format!("Unsupported attribute '{}'", name))
                    .with_detail("An attribute with this name is not expected here")
                    .with_attribute(path),
            ),
            Some(attr) => validate_attribute(attr, value, &path, &mut diagnostics),
        }
    }

    diagnostics
}

/// Validate a configuration, returning Ok if valid or Err with diagnostics.
///
/// This is a convenience wrapper around [`validate`] that returns a Result.
pub fn validate_result(schema: &ResourceSchema, config: &ResourceState) -> Result<(), Vec<Diagnostic>> {
    let diagnostics = validate(schema, config);
    if diagnostics.is_empty() {
        Ok(())
    } else {
        Err(diagnostics)
    }
}

/// Check if a configuration is valid against a schema.
///
/// Returns `true` if valid, `false` otherwise.
/// Use [`validate`] to get detailed error information.
pub fn is_valid(schema: &ResourceSchema, config: &ResourceState) -> bool {
    validate(schema, config).is_empty()
}

/// Diagnostics for required attributes that have no value.
///
/// With `allow_unknown` false, an unknown value counts as missing too.
pub fn missing_required(
    schema: &ResourceSchema,
    state: &ResourceState,
    allow_unknown: bool,
) -> Vec<Diagnostic> {
    schema
        .attributes()
        .iter()
        .filter(|attr| attr.is_required())
        .filter_map(|attr| {
            let value = state.get_or_null(&attr.name);
            let path = AttributePath::attribute(attr.name.clone());
            match value {
                AttributeValue::Null => Some(
                    Diagnostic::error(format!("Missing required attribute '{}'", attr.name))
                        .with_detail("This attribute is required and must be provided")
                        .with_attribute(path),
                ),
                AttributeValue::Unknown if !allow_unknown => Some(
                    Diagnostic::error(format!("Unknown value for required attribute '{}'", attr.name))
                        .with_detail("The value of this attribute must be known before apply")
                        .with_attribute(path),
                ),
                _ => None,
            }
        })
        .collect()
}

fn validate_attribute(
    attr: &AttributeSchema,
    value: &AttributeValue,
    path: &AttributePath,
    diagnostics: &mut Vec<Diagnostic>,
) {
    if attr.attribute.flags.is_computed_only() {
        if value.is_known() {
            diagnostics.push(
                Diagnostic::error(format!("Cannot set computed attribute '{}'", attr.name))
                    .with_detail("This attribute is set by the provider")
                    .with_attribute(path.clone()),
            );
        }
        return;
    }

    validate_value_kind(attr.kind(), value, path, diagnostics);
}

fn validate_value_kind(
    kind: &AttributeKind,
    value: &AttributeValue,
    path: &AttributePath,
    diagnostics: &mut Vec<Diagnostic>,
) {
    let known = match value {
        AttributeValue::Known(known) => known,
        AttributeValue::Null | AttributeValue::Unknown => return,
    };

    match (kind, known) {
        (AttributeKind::Scalar(ScalarKind::String), Value::String(_))
        | (AttributeKind::Scalar(ScalarKind::Int), Value::Int(_))
        | (AttributeKind::Scalar(ScalarKind::Float), Value::Float(_))
        | (AttributeKind::Scalar(ScalarKind::Bool), Value::Bool(_)) => {},
        (AttributeKind::List(element), Value::List(items)) => {
            for (i, item) in items.iter().enumerate() {
                let item_path = path.index(i);
                if item.is_null() {
                    diagnostics.push(
                        Diagnostic::error(format!("Null element in list '{}'", path))
                            .with_detail("List elements must not be null")
                            .with_attribute(item_path),
                    );
                } else {
                    validate_value_kind(element, item, &item_path, diagnostics);
                }
            }
        },
        (AttributeKind::Map(element), Value::Map(entries)) => {
            for (key, item) in entries {
                validate_value_kind(element, item, &path.key(key.clone()), diagnostics);
            }
        },
        (expected, got) => diagnostics.push(type_error(path, expected, got)),
    }
}

fn value_type_name(value: &Value) -> &'static str {
    match value {
        Value::String(_) => "string",
        Value::Int(_) => "int",
        Value::Float(_) => "float",
        Value::Bool(_) => "bool",
        Value::List(_) => "list",
        Value::Map(_) => "map",
    }
}

fn type_error(path: &AttributePath, expected: &AttributeKind, got: &Value) -> Diagnostic {
    Diagnostic::error(format!("Invalid type for attribute '{}'", path))
        .with_detail(format!(
            "Expected {}, got {}",
            expected.describe(),
            value_type_name(got)
        ))
        .with_attribute(path.clone())
}
