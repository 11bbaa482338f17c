//! Error types for the Terraform provider SDK.

use thiserror::Error;

use crate::schema::{AttributePath, Diagnostic};

/// Errors raised while building or reflecting a resource schema.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    /// An attribute name is not a valid Terraform identifier.
    #[error("Invalid attribute name '{0}': names must match [a-z_][a-z0-9_]*")]
    InvalidName(String),

    /// Two attributes share the same wire name.
    #[error("Duplicate attribute name '{0}'")]
    DuplicateAttribute(String),

    /// The declared identifier attribute is not computed.
    #[error("Identifier attribute '{0}' must be computed")]
    IdentifierNotComputed(String),

    /// An attribute is both required and computed (or optional).
    #[error("Attribute '{0}' cannot be required and also optional or computed")]
    ConflictingFlags(String),

    /// An attribute is neither required, optional nor computed.
    #[error("Attribute '{0}' must be required, optional or computed")]
    NoUsage(String),

    /// The schema names an empty identifier, or none where one is needed.
    #[error("Resource schema has no identifier attribute")]
    MissingIdentifier,

    /// The resource type does not deserialize as a struct with named fields.
    #[error("Resource type {0} must be a struct with named fields")]
    NotAStruct(String),

    /// A serde field of the resource type is not declared in its schema.
    #[error("Field '{0}' is not declared in the schema")]
    UndeclaredField(String),

    /// A schema attribute has no serde field on the resource type.
    #[error("Attribute '{0}' has no matching field")]
    MissingField(String),
}

/// Errors raised by the state codec.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The payload is not well-formed msgpack.
    #[error("Malformed msgpack: {0}")]
    Malformed(String),

    /// Writing the payload failed.
    #[error("Encoding failed: {0}")]
    Encode(String),

    /// The payload names an attribute the schema does not declare.
    #[error("Unexpected attribute '{0}'")]
    UnexpectedAttribute(String),

    /// The payload omits an attribute the schema declares.
    #[error("Missing attribute '{0}'")]
    MissingAttribute(String),

    /// The payload names the same attribute twice.
    #[error("Duplicate attribute '{0}'")]
    DuplicateAttribute(String),

    /// A value does not match the declared attribute kind.
    #[error("Type mismatch at '{path}': expected {expected}")]
    TypeMismatch {
        /// Location of the offending value.
        path: AttributePath,
        /// The declared kind.
        expected: String,
    },

    /// The payload is not an object at the top level.
    #[error("Expected an object at the top level")]
    NotAnObject,

    /// Bytes remain after the top-level value.
    #[error("{0} trailing byte(s) after state")]
    TrailingBytes(usize),

    /// The JSON payload could not be parsed.
    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl CodecError {
    /// The attribute path the error refers to, if any.
    pub fn attribute_path(&self) -> Option<AttributePath> {
        match self {
            Self::UnexpectedAttribute(name)
            | Self::MissingAttribute(name)
            | Self::DuplicateAttribute(name) => Some(AttributePath::attribute(name.clone())),
            Self::TypeMismatch { path, .. } => Some(path.clone()),
            _ => None,
        }
    }
}

/// Errors raised by the plan engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanError {
    /// The proposed state does not satisfy the schema.
    #[error("Validation failed with {} error(s)", .0.len())]
    Validation(Vec<Diagnostic>),

    /// The change needs a replacement the resource type does not allow.
    #[error("Attributes {attributes:?} require replacement, but this resource cannot be replaced")]
    ReplacementConflict {
        /// Attributes whose change forces replacement.
        attributes: Vec<String>,
    },
}

impl PlanError {
    /// Convert the error into per-attribute diagnostics.
    pub fn to_diagnostics(&self) -> Vec<Diagnostic> {
        match self {
            Self::Validation(diagnostics) => diagnostics.clone(),
            Self::ReplacementConflict { attributes } => attributes
                .iter()
                .map(|name| {
                    Diagnostic::error("Replacement not allowed")
                        .with_detail(format!(
                            "Changing '{}' requires replacing the resource, which this resource type does not support",
                            name
                        ))
                        .with_attribute(AttributePath::attribute(name.clone()))
                })
                .collect(),
        }
    }
}

/// Errors raised when registering a resource type.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistrationError {
    /// A resource type with this name is already registered.
    #[error("Resource type '{0}' is already registered")]
    Duplicate(String),

    /// The resource type name is empty.
    #[error("Resource type name must not be empty")]
    EmptyName,

    /// The resource type's schema is invalid.
    #[error("Invalid schema for resource type '{name}': {source}")]
    Schema {
        /// The resource type name.
        name: String,
        /// The schema problem.
        #[source]
        source: SchemaError,
    },
}

/// Errors raised while bootstrapping the plugin handshake.
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// The magic cookie is absent or wrong.
    #[error("This binary is a plugin and is not meant to be executed directly; run it through Terraform")]
    NotLaunchedByTerraform,

    /// Terraform does not offer a protocol version this plugin speaks.
    #[error("Unsupported plugin protocol versions '{0}'")]
    UnsupportedProtocol(String),

    /// Output reached the handshake channel before the handshake line.
    #[error("{0} byte(s) were written to the handshake channel before the handshake line")]
    OutputAlreadyWritten(u64),

    /// The handshake line could not be parsed.
    #[error("Malformed handshake line: {0}")]
    Malformed(String),

    /// The port range in the environment is invalid or exhausted.
    #[error("Invalid port range: {0}")]
    InvalidPortRange(String),

    /// Certificate generation failed.
    #[error("Certificate generation failed: {0}")]
    Certificate(#[from] rcgen::Error),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that can occur when implementing a provider.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The requested resource was not found.
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// A validation error occurred.
    #[error("Validation error: {0}")]
    Validation(String),

    /// An internal SDK error occurred.
    #[error("SDK error: {0}")]
    Sdk(String),

    /// A configuration error occurred.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The requested resource type is unknown.
    #[error("Unknown resource type: {0}")]
    UnknownResource(String),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A state payload could not be decoded or encoded.
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// Planning failed.
    #[error("Plan error: {0}")]
    Plan(#[from] PlanError),

    /// A gRPC transport error occurred.
    #[error("Transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    /// Resource already exists (create conflict).
    #[error("Resource already exists: {0}")]
    AlreadyExists(String),

    /// Permission denied (authentication/authorization failure).
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Service temporarily unavailable.
    #[error("Service unavailable: {0}")]
    Unavailable(String),

    /// Operation not implemented.
    #[error("Unimplemented: {0}")]
    Unimplemented(String),

    /// Invalid request from client.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The call arrived in a lifecycle state that does not allow it.
    #[error("Protocol sequence error: {0}")]
    ProtocolSequence(String),

    /// The call was cancelled by a stop request.
    #[error("Operation cancelled")]
    Cancelled,

    /// The operation failed after changing the real resource.
    ///
    /// `state` is the serialized resource as it exists now; it is returned to
    /// Terraform so the change is not lost.
    #[error("{message}")]
    Partial {
        /// What went wrong.
        message: String,
        /// The resource as it exists after the failure.
        state: serde_json::Value,
    },
}

impl ProviderError {
    /// Get the error message as a string.
    ///
    /// Returns a reference to the error message for any variant.
    pub fn message(&self) -> &str {
        match self {
            Self::NotFound(msg) => msg,
            Self::Validation(msg) => msg,
            Self::Sdk(msg) => msg,
            Self::Configuration(msg) => msg,
            Self::UnknownResource(msg) => msg,
            Self::Serialization(_err) => "serialization error (see Debug output)",
            Self::Codec(_err) => "codec error (see Debug output)",
            Self::Plan(_err) => "plan error (see Debug output)",
            Self::Transport(_err) => "transport error (see Debug output)",
            Self::AlreadyExists(msg) => msg,
            Self::PermissionDenied(msg) => msg,
            Self::Unavailable(msg) => msg,
            Self::Unimplemented(msg) => msg,
            Self::InvalidRequest(msg) => msg,
            Self::ProtocolSequence(msg) => msg,
            Self::Cancelled => "operation cancelled",
            Self::Partial { message, .. } => message,
        }
    }

    /// Report a failure that left the resource partially changed.
    ///
    /// # Examples
    ///
    /// ```
    /// use tfplugin_sdk::ProviderError;
    ///
    /// let err = ProviderError::partial("upload interrupted", &serde_json::json!({"id": "a"}));
    /// assert_eq!(err.message(), "upload interrupted");
    /// ```
    ///
    /// If `state` cannot be serialized, the serialization error is appended to
    /// the message and the state is left null.
    pub fn partial<T: serde::Serialize>(message: impl Into<String>, state: &T) -> Self {
        let message = message.into();
        match serde_json::to_value(state) {
            Ok(state) => Self::Partial { message, state },
            Err(err) => Self::Partial {
                message: format!("{} (state could not be serialized: {})", message, err),
                state: serde_json::Value::Null,
            },
        }
    }

    /// Convert the error into diagnostics for a response.
    pub fn to_diagnostics(&self) -> Vec<Diagnostic> {
        match self {
            Self::Plan(err) => err.to_diagnostics(),
            Self::Codec(err) => {
                let diagnostic = Diagnostic::error("Invalid resource state").with_detail(err.to_string());
                vec![match err.attribute_path() {
                    Some(path) => diagnostic.with_attribute(path),
                    None => diagnostic,
                }]
            },
            Self::ProtocolSequence(msg) => {
                vec![Diagnostic::error("Protocol sequence error").with_detail(msg.clone())]
            },
            other => vec![Diagnostic::error(other.to_string())],
        }
    }
}

impl From<ProviderError> for tonic::Status {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::NotFound(msg) => tonic::Status::not_found(msg),
            ProviderError::Validation(msg) => tonic::Status::invalid_argument(msg),
            ProviderError::Configuration(msg) => tonic::Status::failed_precondition(msg),
            ProviderError::UnknownResource(msg) => tonic::Status::not_found(msg),
            ProviderError::Sdk(msg) => tonic::Status::internal(msg),
            ProviderError::Serialization(err) => {
                tonic::Status::invalid_argument(format!("Serialization error: {}", err))
            },
            ProviderError::Codec(err) => {
                tonic::Status::invalid_argument(format!("Codec error: {}", err))
            },
            ProviderError::Plan(err) => tonic::Status::invalid_argument(err.to_string()),
            ProviderError::Transport(err) => {
                tonic::Status::unavailable(format!("Transport error: {}", err))
            },
            ProviderError::AlreadyExists(msg) => tonic::Status::already_exists(msg),
            ProviderError::PermissionDenied(msg) => tonic::Status::permission_denied(msg),
            ProviderError::Unavailable(msg) => tonic::Status::unavailable(msg),
            ProviderError::Unimplemented(msg) => tonic::Status::unimplemented(msg),
            ProviderError::InvalidRequest(msg) => tonic::Status::invalid_argument(msg),
            ProviderError::ProtocolSequence(msg) => tonic::Status::failed_precondition(msg),
            ProviderError::Cancelled => tonic::Status::cancelled("operation cancelled"),
            ProviderError::Partial { message, .. } => tonic::Status::aborted(message),
        }
    }
}
