//! Schema types for describing resource structure.
//!
//! A [`ResourceSchema`] is the declarative description of one resource type:
//! an ordered list of attributes with their kinds and usage flags. Schemas
//! are produced by [`SchemaBuilder`] (usually from [`crate::Resource::describe`])
//! and are immutable once built.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::SchemaError;

/// Default name of the identifier attribute every resource carries.
pub const DEFAULT_IDENTIFIER: &str = "id";

/// The primitive type of a scalar attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalarKind {
    /// A UTF-8 string.
    String,
    /// A 64-bit signed integer.
    Int,
    /// A boolean.
    Bool,
    /// A 64-bit floating point number.
    Float,
}

/// The type of an attribute value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeKind {
    /// A single primitive value.
    Scalar(ScalarKind),
    /// An ordered list of values of a single kind.
    List(Box<AttributeKind>),
    /// A map from string keys to values of a single kind.
    Map(Box<AttributeKind>),
}

impl AttributeKind {
    /// Shorthand for `Scalar(ScalarKind::String)`.
    pub const STRING: AttributeKind = AttributeKind::Scalar(ScalarKind::String);
    /// Shorthand for `Scalar(ScalarKind::Int)`.
    pub const INT: AttributeKind = AttributeKind::Scalar(ScalarKind::Int);
    /// Shorthand for `Scalar(ScalarKind::Bool)`.
    pub const BOOL: AttributeKind = AttributeKind::Scalar(ScalarKind::Bool);
    /// Shorthand for `Scalar(ScalarKind::Float)`.
    pub const FLOAT: AttributeKind = AttributeKind::Scalar(ScalarKind::Float);

    /// Create a list kind.
    pub fn list(element: AttributeKind) -> Self {
        Self::List(Box::new(element))
    }

    /// Create a map kind.
    pub fn map(element: AttributeKind) -> Self {
        Self::Map(Box::new(element))
    }

    /// The type expression Terraform expects in a schema attribute.
    ///
    /// Both integer and float attributes are `"number"` on the Terraform side;
    /// the distinction only matters to the codec.
    pub fn type_json(&self) -> serde_json::Value {
        match self {
            Self::Scalar(ScalarKind::String) => json!("string"),
            Self::Scalar(ScalarKind::Int) | Self::Scalar(ScalarKind::Float) => json!("number"),
            Self::Scalar(ScalarKind::Bool) => json!("bool"),
            Self::List(element) => json!(["list", element.type_json()]),
            Self::Map(element) => json!(["map", element.type_json()]),
        }
    }

    /// Human-readable name used in error messages.
    pub fn describe(&self) -> String {
        match self {
            Self::Scalar(ScalarKind::String) => "string".to_string(),
            Self::Scalar(ScalarKind::Int) => "int".to_string(),
            Self::Scalar(ScalarKind::Bool) => "bool".to_string(),
            Self::Scalar(ScalarKind::Float) => "float".to_string(),
            Self::List(element) => format!("list({})", element.describe()),
            Self::Map(element) => format!("map({})", element.describe()),
        }
    }
}

/// Describes how an attribute can be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct AttributeFlags {
    /// The attribute is required in configuration.
    pub required: bool,
    /// The attribute is optional in configuration.
    pub optional: bool,
    /// The attribute is computed by the provider.
    pub computed: bool,
    /// The attribute is sensitive and should be hidden in logs/UI.
    pub sensitive: bool,
}

impl AttributeFlags {
    /// Create flags for a required attribute.
    pub fn required() -> Self {
        Self {
            required: true,
            ..Default::default()
        }
    }

    /// Create flags for an optional attribute.
    pub fn optional() -> Self {
        Self {
            optional: true,
            ..Default::default()
        }
    }

    /// Create flags for a computed attribute (read-only, set by provider).
    pub fn computed() -> Self {
        Self {
            computed: true,
            ..Default::default()
        }
    }

    /// Create flags for an optional+computed attribute (can be set, but has default from provider).
    pub fn optional_computed() -> Self {
        Self {
            optional: true,
            computed: true,
            ..Default::default()
        }
    }

    /// Mark the attribute as sensitive.
    pub fn sensitive(mut self) -> Self {
        self.sensitive = true;
        self
    }

    /// Whether the attribute is computed and can never be supplied by configuration.
    pub fn is_computed_only(&self) -> bool {
        self.computed && !self.optional && !self.required
    }
}

/// Definition of a single attribute, before it is given a name in a schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attribute {
    /// The kind of value the attribute holds.
    pub kind: AttributeKind,
    /// Flags describing how the attribute can be used.
    #[serde(flatten)]
    pub flags: AttributeFlags,
    /// Human-readable description of the attribute.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// If set, changing this attribute forces resource replacement.
    #[serde(default)]
    pub forces_replacement: bool,
}

impl Attribute {
    /// Create a new attribute with the given kind and flags.
    pub fn new(kind: AttributeKind, flags: AttributeFlags) -> Self {
        Self {
            kind,
            flags,
            description: None,
            forces_replacement: false,
        }
    }

    /// Create a required attribute of any kind.
    pub fn required(kind: AttributeKind) -> Self {
        Self::new(kind, AttributeFlags::required())
    }

    /// Create an optional attribute of any kind.
    pub fn optional(kind: AttributeKind) -> Self {
        Self::new(kind, AttributeFlags::optional())
    }

    /// Create a computed attribute of any kind.
    pub fn computed(kind: AttributeKind) -> Self {
        Self::new(kind, AttributeFlags::computed())
    }

    /// Create an optional attribute the provider fills in when it is left unset.
    pub fn optional_computed(kind: AttributeKind) -> Self {
        Self::new(kind, AttributeFlags::optional_computed())
    }

    /// Create a required string attribute.
    pub fn required_string() -> Self {
        Self::required(AttributeKind::STRING)
    }

    /// Create an optional string attribute.
    pub fn optional_string() -> Self {
        Self::optional(AttributeKind::STRING)
    }

    /// Create a computed string attribute.
    pub fn computed_string() -> Self {
        Self::computed(AttributeKind::STRING)
    }

    /// Create a required integer attribute.
    pub fn required_int() -> Self {
        Self::required(AttributeKind::INT)
    }

    /// Create an optional integer attribute.
    pub fn optional_int() -> Self {
        Self::optional(AttributeKind::INT)
    }

    /// Create an optional bool attribute.
    pub fn optional_bool() -> Self {
        Self::optional(AttributeKind::BOOL)
    }

    /// Create an optional float attribute.
    pub fn optional_float() -> Self {
        Self::optional(AttributeKind::FLOAT)
    }

    /// Set the description for this attribute.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Mark this attribute as forcing resource replacement when changed.
    pub fn with_forces_replacement(mut self) -> Self {
        self.forces_replacement = true;
        self
    }

    /// Mark this attribute as sensitive.
    pub fn sensitive(mut self) -> Self {
        self.flags.sensitive = true;
        self
    }
}

/// A named attribute inside a [`ResourceSchema`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeSchema {
    /// Wire name of the attribute, unique within its schema.
    pub name: String,
    /// The attribute definition.
    #[serde(flatten)]
    pub attribute: Attribute,
}

impl AttributeSchema {
    /// The kind of value this attribute holds.
    pub fn kind(&self) -> &AttributeKind {
        &self.attribute.kind
    }

    /// Whether configuration must supply this attribute.
    pub fn is_required(&self) -> bool {
        self.attribute.flags.required
    }

    /// Whether the provider may compute this attribute.
    pub fn is_computed(&self) -> bool {
        self.attribute.flags.computed
    }

    /// Whether a change to this attribute forces replacement.
    pub fn forces_replacement(&self) -> bool {
        self.attribute.forces_replacement
    }
}

/// The complete, validated schema of one resource type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSchema {
    /// State schema version reported to Terraform.
    pub version: i64,
    /// Name of the identifier attribute, if the schema has one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identifier: Option<String>,
    /// Human-readable description of the resource.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Whether the resource may be destroyed and recreated to apply a change.
    pub replaceable: bool,
    attributes: Vec<AttributeSchema>,
}

impl ResourceSchema {
    /// A schema without attributes or identifier.
    pub fn empty() -> Self {
        Self {
            version: 0,
            identifier: None,
            description: None,
            replaceable: true,
            attributes: Vec::new(),
        }
    }

    /// All attributes in declaration order.
    pub fn attributes(&self) -> &[AttributeSchema] {
        &self.attributes
    }

    /// Look up an attribute by name.
    pub fn attribute(&self, name: &str) -> Option<&AttributeSchema> {
        self.attributes.iter().find(|a| a.name == name)
    }

    /// Number of attributes.
    pub fn len(&self) -> usize {
        self.attributes.len()
    }

    /// Whether the schema has no attributes.
    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }
}

/// Builder for [`ResourceSchema`].
///
/// `build` enforces the schema invariants; an identifier attribute (named
/// `id` by default) is added as a computed string when the description does
/// not declare one.
///
/// # Example
///
/// ```
/// use tfplugin_sdk::schema::{Attribute, SchemaBuilder};
///
/// let schema = SchemaBuilder::new()
///     .version(1)
///     .attribute("path", Attribute::required_string().with_forces_replacement())
///     .attribute("content", Attribute::required_string())
///     .build()
///     .unwrap();
///
/// assert!(schema.attribute("id").unwrap().is_computed());
/// ```
#[derive(Debug, Clone)]
pub struct SchemaBuilder {
    version: i64,
    identifier: Option<String>,
    description: Option<String>,
    replaceable: bool,
    attributes: Vec<AttributeSchema>,
}

impl Default for SchemaBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SchemaBuilder {
    /// Start a resource schema with the default `id` identifier.
    pub fn new() -> Self {
        Self {
            version: 0,
            identifier: Some(DEFAULT_IDENTIFIER.to_string()),
            description: None,
            replaceable: true,
            attributes: Vec::new(),
        }
    }

    /// Start a schema without an identifier (provider configuration blocks).
    pub fn without_identifier() -> Self {
        Self {
            identifier: None,
            ..Self::new()
        }
    }

    /// Set the state schema version.
    pub fn version(mut self, version: i64) -> Self {
        self.version = version;
        self
    }

    /// Use a different attribute name as the identifier.
    pub fn identifier(mut self, name: impl Into<String>) -> Self {
        self.identifier = Some(name.into());
        self
    }

    /// Set the resource description.
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Declare that this resource type can never be replaced.
    ///
    /// Plans that would require replacement fail instead.
    pub fn disallow_replacement(mut self) -> Self {
        self.replaceable = false;
        self
    }

    /// Add an attribute.
    pub fn attribute(mut self, name: impl Into<String>, attribute: Attribute) -> Self {
        self.attributes.push(AttributeSchema {
            name: name.into(),
            attribute,
        });
        self
    }

    /// Validate and produce the schema.
    pub fn build(self) -> Result<ResourceSchema, SchemaError> {
        let mut attributes = self.attributes;

        let mut seen = HashSet::new();
        for attr in &attributes {
            if !is_valid_name(&attr.name) {
                return Err(SchemaError::InvalidName(attr.name.clone()));
            }
            if !seen.insert(attr.name.as_str()) {
                return Err(SchemaError::DuplicateAttribute(attr.name.clone()));
            }
            let flags = attr.attribute.flags;
            if flags.required && (flags.computed || flags.optional) {
                return Err(SchemaError::ConflictingFlags(attr.name.clone()));
            }
            if !flags.required && !flags.optional && !flags.computed {
                return Err(SchemaError::NoUsage(attr.name.clone()));
            }
        }

        if let Some(identifier) = &self.identifier {
            if identifier.is_empty() {
                return Err(SchemaError::MissingIdentifier);
            }
            match attributes.iter().find(|a| &a.name == identifier) {
                Some(attr) if !attr.is_computed() => {
                    return Err(SchemaError::IdentifierNotComputed(identifier.clone()));
                },
                Some(_) => {},
                None => {
                    if !is_valid_name(identifier) {
                        return Err(SchemaError::InvalidName(identifier.clone()));
                    }
                    attributes.insert(
                        0,
                        AttributeSchema {
                            name: identifier.clone(),
                            attribute: Attribute::computed_string()
                                .with_description("Unique identifier for this resource."),
                        },
                    );
                },
            }
        }

        Ok(ResourceSchema {
            version: self.version,
            identifier: self.identifier,
            description: self.description,
            replaceable: self.replaceable,
            attributes,
        })
    }
}

/// Terraform attribute names must be lowercase identifiers.
fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() || c == '_' => {},
        _ => return false,
    }
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

/// One step in an [`AttributePath`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PathStep {
    /// A named attribute.
    Attribute(String),
    /// A list element.
    Index(i64),
    /// A map element.
    Key(String),
}

/// Location of a value inside a resource, e.g. `tags.0` or `labels.env`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct AttributePath {
    /// The steps from the resource root.
    pub steps: Vec<PathStep>,
}

impl AttributePath {
    /// A path naming a top-level attribute.
    pub fn attribute(name: impl Into<String>) -> Self {
        Self {
            steps: vec![PathStep::Attribute(name.into())],
        }
    }

    /// Extend the path with a list index.
    pub fn index(&self, index: usize) -> Self {
        self.push(PathStep::Index(index as i64))
    }

    /// Extend the path with a map key.
    pub fn key(&self, key: impl Into<String>) -> Self {
        self.push(PathStep::Key(key.into()))
    }

    fn push(&self, step: PathStep) -> Self {
        let mut steps = self.steps.clone();
        steps.push(step);
        Self { steps }
    }
}

impl fmt::Display for AttributePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, step) in self.steps.iter().enumerate() {
            if i > 0 {
                f.write_str(".")?;
            }
            match step {
                PathStep::Attribute(name) | PathStep::Key(name) => f.write_str(name)?,
                PathStep::Index(index) => write!(f, "{}", index)?,
            }
        }
        Ok(())
    }
}

/// Diagnostic severity level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiagnosticSeverity {
    /// An error that prevents the operation from completing.
    Error,
    /// A warning that doesn't prevent the operation but should be addressed.
    Warning,
}

/// A diagnostic message returned to Terraform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    /// The severity of the diagnostic.
    pub severity: DiagnosticSeverity,
    /// A short summary of the issue.
    pub summary: String,
    /// A detailed description of the issue.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// The attribute path where the issue occurred.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attribute: Option<AttributePath>,
}

impl Diagnostic {
    /// Create an error diagnostic.
    pub fn error(summary: impl Into<String>) -> Self {
        Self {
            severity: DiagnosticSeverity::Error,
            summary: summary.into(),
            detail: None,
            attribute: None,
        }
    }

    /// Create a warning diagnostic.
    pub fn warning(summary: impl Into<String>) -> Self {
        Self {
            severity: DiagnosticSeverity::Warning,
            summary: summary.into(),
            detail: None,
            attribute: None,
        }
    }

    /// Add detail to this diagnostic.
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Set the attribute path for this diagnostic.
    pub fn with_attribute(mut self, attribute: AttributePath) -> Self {
        self.attribute = Some(attribute);
        self
    }

    /// Whether this diagnostic is an error.
    pub fn is_error(&self) -> bool {
        self.severity == DiagnosticSeverity::Error
    }
}

/// Whether any diagnostic in the slice is an error.
pub fn has_errors(diagnostics: &[Diagnostic]) -> bool {
    diagnostics.iter().any(Diagnostic::is_error)
}
