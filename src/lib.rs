//! Terraform Provider SDK
//!
//! This crate turns plain Rust types into a Terraform provider: a subprocess
//! that speaks Terraform's plugin protocol (tfplugin5 over gRPC), bootstrapped
//! by the go-plugin handshake.
//!
//! # Overview
//!
//! The SDK provides:
//!
//! - **Schema reflection**: resource types describe their attributes once and
//!   the schema is cached for the process lifetime
//! - **Wire codec**: tri-state (null, unknown, known) msgpack encoding of
//!   resource state, plus a JSON bridge for typed resources
//! - **Plan engine**: planned state, requires-replace detection and unknown
//!   propagation for computed attributes
//! - **Resource registry**: type name to implementation, validated at registration
//! - **Server helpers**: the handshake, self-signed mTLS and the gRPC services
//! - **Logging**: integration with `tracing`, honoring `TF_LOG_PROVIDER`
//!
//! # Quick Start
//!
//! ```ignore
//! use async_trait::async_trait;
//! use serde::{Deserialize, Serialize};
//! use tfplugin_sdk::{
//!     init_logging, serve, Attribute, ProviderError, Resource, ResourceProvider,
//!     ResourceRegistry, SchemaBuilder,
//! };
//!
//! #[derive(Serialize, Deserialize)]
//! struct File {
//!     id: Option<String>,
//!     path: String,
//!     content: String,
//! }
//!
//! impl Resource for File {
//!     fn describe(schema: SchemaBuilder) -> SchemaBuilder {
//!         schema
//!             .attribute("path", Attribute::required_string().with_forces_replacement())
//!             .attribute("content", Attribute::required_string())
//!     }
//! }
//!
//! struct FileProvider;
//!
//! fn io_error(err: std::io::Error) -> ProviderError {
//!     ProviderError::Sdk(err.to_string())
//! }
//!
//! #[async_trait]
//! impl ResourceProvider<File> for FileProvider {
//!     async fn create(&self, planned: File) -> Result<File, ProviderError> {
//!         std::fs::write(&planned.path, &planned.content).map_err(io_error)?;
//!         Ok(File { id: Some(planned.path.clone()), ..planned })
//!     }
//!
//!     async fn read(&self, current: File) -> Result<Option<File>, ProviderError> {
//!         match std::fs::read_to_string(&current.path) {
//!             Ok(content) => Ok(Some(File { content, ..current })),
//!             Err(_) => Ok(None),
//!         }
//!     }
//!
//!     async fn update(&self, _prior: File, planned: File) -> Result<File, ProviderError> {
//!         std::fs::write(&planned.path, &planned.content).map_err(io_error)?;
//!         Ok(planned)
//!     }
//!
//!     async fn delete(&self, current: File) -> Result<(), ProviderError> {
//!         std::fs::remove_file(&current.path).map_err(io_error)?;
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     init_logging();
//!
//!     let mut registry = ResourceRegistry::new();
//!     registry.register::<File, _>("local_file", FileProvider)?;
//!     serve(registry).await
//! }
//! ```
//!
//! # Handshake Protocol
//!
//! When a provider starts via [`serve`], it checks the magic cookie, binds a
//! listener and writes a single line to stdout:
//!
//! ```text
//! 1|5|tcp|127.0.0.1:10000|grpc|<base64 DER certificate>
//! ```
//!
//! Format: `<core version>|<protocol version>|<network>|<address>|grpc|<cert>`
//!
//! Everything else the provider writes must go to stderr.
//!
//! # Provider Protocol
//!
//! The gRPC service implements tfplugin5:
//!
//! - **GetSchema**: Returns the provider and resource schemas
//! - **PrepareProviderConfig**: Validates provider configuration
//! - **Configure**: Configures the provider
//! - **ValidateResourceTypeConfig**: Validates resource configuration
//! - **UpgradeResourceState**: Migrates state from older schema versions
//! - **ReadResource**: Refreshes a resource
//! - **PlanResourceChange**: Computes planned state and replacement paths
//! - **ApplyResourceChange**: Creates, updates or deletes a resource
//! - **ImportResourceState**: Imports existing infrastructure
//! - **Stop**: Cancels in-flight work
//!
//! The go-plugin controller service's **Shutdown** stops the process.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod error;
pub mod handshake;
pub mod logging;
pub mod plan;
pub mod reflect;
pub mod registry;
pub mod schema;
pub mod server;
pub mod service;
pub mod testing;
pub mod types;
pub mod validation;
pub mod value;

#[allow(missing_docs)]
#[allow(clippy::all)]
pub mod generated;

// Re-export main types at crate root
pub use error::{CodecError, HandshakeError, PlanError, ProviderError, RegistrationError, SchemaError};
pub use handshake::HandshakeConfig;
pub use logging::{init_logging, init_logging_with_default, try_init_logging};
pub use reflect::{Resource, SchemaReflector};
pub use registry::{ResourceProvider, ResourceRegistry};
pub use schema::{
    Attribute, AttributeKind, AttributePath, AttributeSchema, Diagnostic, DiagnosticSeverity,
    ResourceSchema, ScalarKind, SchemaBuilder,
};
pub use server::{serve, serve_on_listener, serve_with_options, ServeOptions};
pub use service::{Lifecycle, ProviderConfigurator, ProviderSchema, ProviderService};
pub use types::{ApplyResult, PlanResult, ServerCapabilities, CORE_PROTOCOL_VERSION, PROTOCOL_VERSION};
pub use validation::{is_valid, validate, validate_result};
pub use value::{AttributeValue, ResourceState, Value};

// Re-export async_trait for convenience
pub use async_trait::async_trait;

// Re-export commonly used external types
pub use serde_json;
pub use tonic;
pub use tracing;
