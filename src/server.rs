//! Server helpers for running providers.
//!
//! This module adapts a [`ProviderService`] to the `tfplugin5` gRPC service
//! and provides the `serve` functions that run it as a Terraform plugin.
//!
//! # Signal Handling
//!
//! The server shuts down gracefully when Terraform calls the plugin
//! controller's `Shutdown` or when the process receives SIGTERM. On shutdown
//! the server:
//! 1. Cancels calls still in flight
//! 2. Stops accepting new connections
//! 3. Waits for open requests to finish (with configurable timeout)
//! 4. Exits cleanly
//!
//! SIGINT is logged and otherwise ignored: Terraform forwards Ctrl-C to the
//! whole process group and then drives shutdown itself through `Stop`.

use std::collections::HashMap;
use std::fmt;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::Notify;
use tonic::transport::Server;
use tracing::{debug, error, info, instrument, warn};

use crate::codec;
use crate::error::{CodecError, ProviderError};
use crate::generated::plugin::grpc_controller_server::{GrpcController, GrpcControllerServer};
use crate::generated::plugin::Empty;
use crate::generated::tfplugin5 as proto;
use crate::generated::tfplugin5::provider_server::{Provider, ProviderServer};
use crate::handshake::{bind_listener, BootstrapContext, HandshakeChannel, HandshakeConfig, PluginIdentity};
use crate::registry::ResourceRegistry;
use crate::schema::{has_errors, AttributePath, AttributeSchema, Diagnostic, DiagnosticSeverity, PathStep, ResourceSchema};
use crate::service::{ProviderConfigurator, ProviderService};
use crate::value::ResourceState;

// =============================================================================
// Conversions
// =============================================================================

fn path_to_proto(path: &AttributePath) -> proto::AttributePath {
    use proto::attribute_path::step::Selector;

    proto::AttributePath {
        steps: path
            .steps
            .iter()
            .map(|step| proto::attribute_path::Step {
                selector: Some(match step {
                    PathStep::Attribute(name) => Selector::AttributeName(name.clone()),
                    PathStep::Index(index) => Selector::ElementKeyInt(*index),
                    PathStep::Key(key) => Selector::ElementKeyString(key.clone()),
                }),
            })
            .collect(),
    }
}

fn diagnostics_to_proto(diagnostics: Vec<Diagnostic>) -> Vec<proto::Diagnostic> {
    diagnostics
        .into_iter()
        .map(|d| proto::Diagnostic {
            severity: match d.severity {
                DiagnosticSeverity::Error => proto::diagnostic::Severity::Error as i32,
                DiagnosticSeverity::Warning => proto::diagnostic::Severity::Warning as i32,
            },
            summary: d.summary,
            detail: d.detail.unwrap_or_default(),
            attribute: d.attribute.as_ref().map(path_to_proto),
        })
        .collect()
}

/// Per-call errors are reported as diagnostics. Cancellation is the exception:
/// it fails the call so that no partial result reaches Terraform.
fn error_to_diagnostics(err: ProviderError) -> Result<Vec<proto::Diagnostic>, tonic::Status> {
    match err {
        ProviderError::Cancelled => Err(err.into()),
        err => Ok(diagnostics_to_proto(err.to_diagnostics())),
    }
}

fn attribute_to_proto(attr: &AttributeSchema) -> proto::schema::Attribute {
    let flags = attr.attribute.flags;
    proto::schema::Attribute {
        name: attr.name.clone(),
        r#type: attr.kind().type_json().to_string().into_bytes(),
        description: attr.attribute.description.clone().unwrap_or_default(),
        required: flags.required,
        optional: flags.optional,
        computed: flags.computed,
        sensitive: flags.sensitive,
        description_kind: proto::StringKind::Plain as i32,
        deprecated: false,
    }
}

fn schema_to_proto(schema: &ResourceSchema) -> proto::Schema {
    proto::Schema {
        version: schema.version,
        block: Some(proto::schema::Block {
            version: schema.version,
            attributes: schema.attributes().iter().map(attribute_to_proto).collect(),
            block_types: vec![],
            description: schema.description.clone().unwrap_or_default(),
            description_kind: proto::StringKind::Plain as i32,
            deprecated: false,
        }),
    }
}

/// Decode a dynamic value; msgpack takes precedence over JSON.
fn decode_state(
    schema: &ResourceSchema,
    value: Option<&proto::DynamicValue>,
) -> Result<Option<ResourceState>, CodecError> {
    match value {
        None => Ok(None),
        Some(value) if !value.msgpack.is_empty() => codec::decode_optional(schema, &value.msgpack),
        Some(value) => codec::decode_json(schema, &value.json),
    }
}

fn require_state(state: Option<ResourceState>, field: &str) -> Result<ResourceState, ProviderError> {
    state.ok_or_else(|| ProviderError::InvalidRequest(format!("{} must not be null", field)))
}

fn encode_state(schema: &ResourceSchema, state: Option<&ResourceState>) -> Result<proto::DynamicValue, CodecError> {
    Ok(proto::DynamicValue {
        msgpack: codec::encode_optional(schema, state)?,
        json: vec![],
    })
}

fn log_diagnostics(operation: &str, resource_type: &str, diagnostics: &[Diagnostic]) {
    if has_errors(diagnostics) {
        warn!(resource_type = %resource_type, diagnostics = diagnostics.len(), "{} completed with errors", operation);
    } else {
        info!(resource_type = %resource_type, "{} completed successfully", operation);
    }
}

// =============================================================================
// Provider Service
// =============================================================================

/// Wrapper that implements the generated gRPC trait.
struct ProviderGrpcService {
    service: Arc<ProviderService>,
}

impl ProviderGrpcService {
    fn get_schema_response(&self) -> Result<proto::get_provider_schema::Response, ProviderError> {
        let schema = self.service.get_schema()?;
        Ok(proto::get_provider_schema::Response {
            provider: Some(schema_to_proto(&schema.provider)),
            resource_schemas: schema
                .resources
                .iter()
                .map(|(name, schema)| (name.clone(), schema_to_proto(schema)))
                .collect(),
            data_source_schemas: HashMap::new(),
            diagnostics: vec![],
            provider_meta: None,
            server_capabilities: Some(proto::ServerCapabilities {
                plan_destroy: schema.capabilities.plan_destroy,
                get_provider_schema_optional: false,
            }),
        })
    }

    fn provider_config(&self, value: Option<&proto::DynamicValue>) -> Result<ResourceState, ProviderError> {
        let schema = self.service.provider_config_schema();
        Ok(decode_state(schema, value)?.unwrap_or_else(|| ResourceState::nulls(schema)))
    }

    async fn prepare_provider_config_response(
        &self,
        req: proto::prepare_provider_config::Request,
    ) -> Result<proto::prepare_provider_config::Response, ProviderError> {
        self.service.require_schema("PrepareProviderConfig")?;
        let config = self.provider_config(req.config.as_ref())?;
        let diagnostics = self.service.prepare_provider_config(&config).await?;
        Ok(proto::prepare_provider_config::Response {
            prepared_config: Some(encode_state(self.service.provider_config_schema(), Some(&config))?),
            diagnostics: diagnostics_to_proto(diagnostics),
        })
    }

    async fn configure_response(
        &self,
        req: proto::configure::Request,
    ) -> Result<Vec<Diagnostic>, ProviderError> {
        self.service.require_schema("Configure")?;
        let config = self.provider_config(req.config.as_ref())?;
        self.service.configure(&config).await
    }

    fn validate_response(&self, req: &proto::validate_resource_type_config::Request) -> Result<Vec<Diagnostic>, ProviderError> {
        self.service.require_schema("ValidateResourceTypeConfig")?;
        let entry = self.service.resolve(&req.type_name)?;
        let config = require_state(decode_state(entry.schema(), req.config.as_ref())?, "config")?;
        self.service.validate_resource_config(&req.type_name, &config)
    }

    fn upgrade_response(
        &self,
        req: &proto::upgrade_resource_state::Request,
    ) -> Result<proto::DynamicValue, ProviderError> {
        self.service.require_schema("UpgradeResourceState")?;
        let raw = req
            .raw_state
            .as_ref()
            .ok_or_else(|| ProviderError::InvalidRequest("raw_state must be set".to_string()))?;
        if raw.json.is_empty() && !raw.flatmap.is_empty() {
            return Err(ProviderError::InvalidRequest(
                "flatmap state from the legacy SDK is not supported".to_string(),
            ));
        }
        let upgraded = self
            .service
            .upgrade_resource_state(&req.type_name, req.version, &raw.json)?;
        let entry = self.service.resolve(&req.type_name)?;
        Ok(encode_state(entry.schema(), Some(&upgraded))?)
    }

    async fn read_response(
        &self,
        req: &proto::read_resource::Request,
    ) -> Result<proto::DynamicValue, ProviderError> {
        self.service.require_schema("ReadResource")?;
        let entry = self.service.resolve(&req.type_name)?;
        let current = require_state(decode_state(entry.schema(), req.current_state.as_ref())?, "current_state")?;
        let new_state = self.service.read_resource(&req.type_name, &current).await?;
        Ok(encode_state(entry.schema(), new_state.as_ref())?)
    }

    fn plan_response(
        &self,
        req: &proto::plan_resource_change::Request,
    ) -> Result<proto::plan_resource_change::Response, ProviderError> {
        self.service.require_schema("PlanResourceChange")?;
        let entry = self.service.resolve(&req.type_name)?;
        let schema = entry.schema();
        let prior = decode_state(schema, req.prior_state.as_ref())?;
        let proposed = decode_state(schema, req.proposed_new_state.as_ref())?;

        let result = self
            .service
            .plan_resource_change(&req.type_name, prior.as_ref(), proposed.as_ref())?;
        let (planned_state, requires_replace) = match &result {
            Some(result) => (
                encode_state(schema, Some(&result.planned_state))?,
                result
                    .requires_replace
                    .iter()
                    .map(|name| path_to_proto(&AttributePath::attribute(name.clone())))
                    .collect(),
            ),
            None => (encode_state(schema, None)?, vec![]),
        };

        Ok(proto::plan_resource_change::Response {
            planned_state: Some(planned_state),
            requires_replace,
            planned_private: req.prior_private.clone(),
            diagnostics: vec![],
            legacy_type_system: false,
        })
    }

    async fn apply_response(
        &self,
        req: &proto::apply_resource_change::Request,
    ) -> Result<proto::apply_resource_change::Response, ProviderError> {
        self.service.require_schema("ApplyResourceChange")?;
        let entry = self.service.resolve(&req.type_name)?;
        let schema = entry.schema();
        let prior = decode_state(schema, req.prior_state.as_ref())?;
        let planned = decode_state(schema, req.planned_state.as_ref())?;

        let result = self
            .service
            .apply_resource_change(&req.type_name, prior.as_ref(), planned.as_ref())
            .await?;

        let mut diagnostics = result.diagnostics;
        let new_state = match encode_state(schema, result.new_state.as_ref()) {
            Ok(value) => value,
            Err(err) => {
                // Never drop the state of a real resource: fall back to JSON.
                error!(resource_type = %req.type_name, error = %err, "New state does not match schema");
                diagnostics.push(
                    Diagnostic::error("Provider returned invalid state").with_detail(err.to_string()),
                );
                proto::DynamicValue {
                    msgpack: vec![],
                    json: result
                        .new_state
                        .as_ref()
                        .map(|state| codec::to_json(state).to_string().into_bytes())
                        .unwrap_or_default(),
                }
            },
        };

        Ok(proto::apply_resource_change::Response {
            new_state: Some(new_state),
            private: req.planned_private.clone(),
            diagnostics: diagnostics_to_proto(diagnostics),
            legacy_type_system: false,
        })
    }

    async fn import_response(
        &self,
        req: &proto::import_resource_state::Request,
    ) -> Result<Vec<proto::import_resource_state::ImportedResource>, ProviderError> {
        self.service.require_schema("ImportResourceState")?;
        let entry = self.service.resolve(&req.type_name)?;
        let imported = self
            .service
            .import_resource_state(&req.type_name, &req.id)
            .await?;
        imported
            .iter()
            .map(|state| {
                Ok(proto::import_resource_state::ImportedResource {
                    type_name: req.type_name.clone(),
                    state: Some(encode_state(entry.schema(), Some(state))?),
                    private: vec![],
                })
            })
            .collect()
    }
}

#[tonic::async_trait]
impl Provider for ProviderGrpcService {
    #[instrument(skip(self, _request), name = "grpc.get_provider_schema")]
    async fn get_schema(
        &self,
        _request: tonic::Request<proto::get_provider_schema::Request>,
    ) -> Result<tonic::Response<proto::get_provider_schema::Response>, tonic::Status> {
        debug!("GetProviderSchema called");
        match self.get_schema_response() {
            Ok(response) => {
                info!(resources = response.resource_schemas.len(), "GetProviderSchema completed");
                Ok(tonic::Response::new(response))
            },
            Err(e) => {
                error!(error = %e, "GetProviderSchema failed");
                Ok(tonic::Response::new(proto::get_provider_schema::Response {
                    diagnostics: error_to_diagnostics(e)?,
                    ..Default::default()
                }))
            },
        }
    }

    #[instrument(skip(self, request), name = "grpc.prepare_provider_config")]
    async fn prepare_provider_config(
        &self,
        request: tonic::Request<proto::prepare_provider_config::Request>,
    ) -> Result<tonic::Response<proto::prepare_provider_config::Response>, tonic::Status> {
        debug!("PrepareProviderConfig called");
        match self.prepare_provider_config_response(request.into_inner()).await {
            Ok(response) => {
                info!(diagnostics = response.diagnostics.len(), "PrepareProviderConfig completed");
                Ok(tonic::Response::new(response))
            },
            Err(e) => {
                error!(error = %e, "PrepareProviderConfig failed");
                Ok(tonic::Response::new(proto::prepare_provider_config::Response {
                    prepared_config: None,
                    diagnostics: error_to_diagnostics(e)?,
                }))
            },
        }
    }

    #[instrument(skip(self, request), name = "grpc.validate_resource_type_config")]
    async fn validate_resource_type_config(
        &self,
        request: tonic::Request<proto::validate_resource_type_config::Request>,
    ) -> Result<tonic::Response<proto::validate_resource_type_config::Response>, tonic::Status> {
        let req = request.into_inner();
        debug!(resource_type = %req.type_name, "ValidateResourceTypeConfig called");
        let diagnostics = match self.validate_response(&req) {
            Ok(diagnostics) => {
                log_diagnostics("ValidateResourceTypeConfig", &req.type_name, &diagnostics);
                diagnostics_to_proto(diagnostics)
            },
            Err(e) => {
                error!(resource_type = %req.type_name, error = %e, "ValidateResourceTypeConfig failed");
                error_to_diagnostics(e)?
            },
        };
        Ok(tonic::Response::new(proto::validate_resource_type_config::Response { diagnostics }))
    }

    #[instrument(skip(self, request), name = "grpc.upgrade_resource_state")]
    async fn upgrade_resource_state(
        &self,
        request: tonic::Request<proto::upgrade_resource_state::Request>,
    ) -> Result<tonic::Response<proto::upgrade_resource_state::Response>, tonic::Status> {
        let req = request.into_inner();
        debug!(resource_type = %req.type_name, version = req.version, "UpgradeResourceState called");
        match self.upgrade_response(&req) {
            Ok(upgraded) => {
                info!(resource_type = %req.type_name, from_version = req.version, "UpgradeResourceState completed");
                Ok(tonic::Response::new(proto::upgrade_resource_state::Response {
                    upgraded_state: Some(upgraded),
                    diagnostics: vec![],
                }))
            },
            Err(e) => {
                error!(resource_type = %req.type_name, version = req.version, error = %e, "UpgradeResourceState failed");
                Ok(tonic::Response::new(proto::upgrade_resource_state::Response {
                    upgraded_state: None,
                    diagnostics: error_to_diagnostics(e)?,
                }))
            },
        }
    }

    #[instrument(skip(self, request), name = "grpc.configure")]
    async fn configure(
        &self,
        request: tonic::Request<proto::configure::Request>,
    ) -> Result<tonic::Response<proto::configure::Response>, tonic::Status> {
        let req = request.into_inner();
        debug!(terraform_version = %req.terraform_version, "Configure called");
        let diagnostics = match self.configure_response(req).await {
            Ok(diagnostics) => {
                if has_errors(&diagnostics) {
                    warn!(diagnostics = diagnostics.len(), "Configure completed with errors");
                } else {
                    info!("Configure completed successfully");
                }
                diagnostics_to_proto(diagnostics)
            },
            Err(e) => {
                error!(error = %e, "Configure failed");
                error_to_diagnostics(e)?
            },
        };
        Ok(tonic::Response::new(proto::configure::Response { diagnostics }))
    }

    #[instrument(skip(self, request), name = "grpc.read_resource")]
    async fn read_resource(
        &self,
        request: tonic::Request<proto::read_resource::Request>,
    ) -> Result<tonic::Response<proto::read_resource::Response>, tonic::Status> {
        let req = request.into_inner();
        debug!(resource_type = %req.type_name, "ReadResource called");
        match self.read_response(&req).await {
            Ok(new_state) => {
                debug!(resource_type = %req.type_name, "ReadResource completed successfully");
                Ok(tonic::Response::new(proto::read_resource::Response {
                    new_state: Some(new_state),
                    diagnostics: vec![],
                    private: req.private,
                }))
            },
            Err(e) => {
                error!(resource_type = %req.type_name, error = %e, "ReadResource failed");
                Ok(tonic::Response::new(proto::read_resource::Response {
                    new_state: req.current_state,
                    diagnostics: error_to_diagnostics(e)?,
                    private: req.private,
                }))
            },
        }
    }

    #[instrument(skip(self, request), name = "grpc.plan_resource_change")]
    async fn plan_resource_change(
        &self,
        request: tonic::Request<proto::plan_resource_change::Request>,
    ) -> Result<tonic::Response<proto::plan_resource_change::Response>, tonic::Status> {
        let req = request.into_inner();
        debug!(resource_type = %req.type_name, "PlanResourceChange called");
        match self.plan_response(&req) {
            Ok(response) => {
                info!(
                    resource_type = %req.type_name,
                    requires_replace = response.requires_replace.len(),
                    "PlanResourceChange completed"
                );
                Ok(tonic::Response::new(response))
            },
            Err(e) => {
                error!(resource_type = %req.type_name, error = %e, "PlanResourceChange failed");
                Ok(tonic::Response::new(proto::plan_resource_change::Response {
                    diagnostics: error_to_diagnostics(e)?,
                    ..Default::default()
                }))
            },
        }
    }

    #[instrument(skip(self, request), name = "grpc.apply_resource_change")]
    async fn apply_resource_change(
        &self,
        request: tonic::Request<proto::apply_resource_change::Request>,
    ) -> Result<tonic::Response<proto::apply_resource_change::Response>, tonic::Status> {
        let req = request.into_inner();
        info!(resource_type = %req.type_name, "ApplyResourceChange called");
        match self.apply_response(&req).await {
            Ok(response) => {
                if response.diagnostics.is_empty() {
                    info!(resource_type = %req.type_name, "ApplyResourceChange completed successfully");
                } else {
                    warn!(
                        resource_type = %req.type_name,
                        diagnostics = response.diagnostics.len(),
                        "ApplyResourceChange completed with diagnostics"
                    );
                }
                Ok(tonic::Response::new(response))
            },
            Err(e) => {
                error!(resource_type = %req.type_name, error = %e, "ApplyResourceChange failed");
                // Nothing was changed; hand the prior state back unchanged.
                Ok(tonic::Response::new(proto::apply_resource_change::Response {
                    new_state: req.prior_state,
                    private: req.planned_private,
                    diagnostics: error_to_diagnostics(e)?,
                    legacy_type_system: false,
                }))
            },
        }
    }

    #[instrument(skip(self, request), name = "grpc.import_resource_state")]
    async fn import_resource_state(
        &self,
        request: tonic::Request<proto::import_resource_state::Request>,
    ) -> Result<tonic::Response<proto::import_resource_state::Response>, tonic::Status> {
        let req = request.into_inner();
        info!(resource_type = %req.type_name, id = %req.id, "ImportResourceState called");
        match self.import_response(&req).await {
            Ok(imported_resources) => {
                info!(
                    resource_type = %req.type_name,
                    id = %req.id,
                    imported_count = imported_resources.len(),
                    "ImportResourceState completed"
                );
                Ok(tonic::Response::new(proto::import_resource_state::Response {
                    imported_resources,
                    diagnostics: vec![],
                }))
            },
            Err(e) => {
                error!(resource_type = %req.type_name, id = %req.id, error = %e, "ImportResourceState failed");
                Ok(tonic::Response::new(proto::import_resource_state::Response {
                    imported_resources: vec![],
                    diagnostics: error_to_diagnostics(e)?,
                }))
            },
        }
    }

    #[instrument(skip(self, _request), name = "grpc.stop")]
    async fn stop(
        &self,
        _request: tonic::Request<proto::stop::Request>,
    ) -> Result<tonic::Response<proto::stop::Response>, tonic::Status> {
        info!("Stop called");
        self.service.stop();
        Ok(tonic::Response::new(proto::stop::Response { error: String::new() }))
    }
}

// =============================================================================
// Plugin Controller
// =============================================================================

/// Handles the plugin controller's `Shutdown` call.
struct ControllerService {
    service: Arc<ProviderService>,
    terminate: Arc<Notify>,
}

#[tonic::async_trait]
impl GrpcController for ControllerService {
    #[instrument(skip(self, _request), name = "grpc.controller_shutdown")]
    async fn shutdown(&self, _request: tonic::Request<Empty>) -> Result<tonic::Response<Empty>, tonic::Status> {
        info!("Shutdown requested by Terraform");
        self.service.stop();
        self.terminate.notify_one();
        Ok(tonic::Response::new(Empty {}))
    }
}

// =============================================================================
// Serving
// =============================================================================

/// Options for configuring the provider server.
#[derive(Clone)]
pub struct ServeOptions {
    /// Timeout for graceful shutdown. After shutdown is triggered, the server
    /// will wait this long for open requests to complete.
    /// Default: 30 seconds.
    pub shutdown_timeout: Duration,
    /// Handshake settings; read from the environment when `None`.
    pub handshake: Option<HandshakeConfig>,
    /// Provider configuration hooks.
    pub configurator: Option<Arc<dyn ProviderConfigurator>>,
}

impl fmt::Debug for ServeOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServeOptions")
            .field("shutdown_timeout", &self.shutdown_timeout)
            .field("handshake", &self.handshake)
            .field("configurable", &self.configurator.is_some())
            .finish()
    }
}

impl Default for ServeOptions {
    fn default() -> Self {
        Self {
            shutdown_timeout: Duration::from_secs(30),
            handshake: None,
            configurator: None,
        }
    }
}

impl ServeOptions {
    /// Create new serve options with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the shutdown timeout.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Use explicit handshake settings instead of the environment.
    pub fn with_handshake(mut self, config: HandshakeConfig) -> Self {
        self.handshake = Some(config);
        self
    }

    /// Set the provider configuration hooks.
    pub fn with_configurator(mut self, configurator: Arc<dyn ProviderConfigurator>) -> Self {
        self.configurator = Some(configurator);
        self
    }
}

/// Wait for SIGTERM (or CTRL+C on Windows).
async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let (mut sigterm, mut sigint) = match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
            (Err(err), _) | (_, Err(err)) => {
                warn!(error = %err, "Failed to install signal handlers");
                return std::future::pending().await;
            },
        };

        let mut interrupts = 0u32;
        loop {
            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, initiating graceful shutdown");
                    return;
                }
                _ = sigint.recv() => {
                    interrupts += 1;
                    debug!(count = interrupts, "Ignoring SIGINT; Terraform coordinates shutdown");
                }
            }
        }
    }

    #[cfg(windows)]
    {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received CTRL+C, initiating graceful shutdown"),
            Err(err) => {
                warn!(error = %err, "Failed to install CTRL+C handler");
                std::future::pending::<()>().await;
            },
        }
    }

    #[cfg(not(any(unix, windows)))]
    {
        std::future::pending::<()>().await;
    }
}

/// Serve the registered resources as a Terraform provider.
///
/// This function:
/// 1. Checks that Terraform launched the process
/// 2. Binds a loopback port and generates the TLS identity
/// 3. Writes the handshake line to stdout
/// 4. Serves until Terraform shuts the plugin down
///
/// The handshake format is: `1|5|tcp|<address>|grpc|<certificate>`
///
/// For custom configuration, use [`serve_with_options`].
pub async fn serve(registry: ResourceRegistry) -> Result<(), Box<dyn std::error::Error>> {
    serve_with_options(registry, ServeOptions::default()).await
}

/// Serve the registered resources with custom options.
///
/// See [`serve`] for details.
pub async fn serve_with_options(
    registry: ResourceRegistry,
    options: ServeOptions,
) -> Result<(), Box<dyn std::error::Error>> {
    // Claimed before anything else runs, so the handshake stays the first output.
    let output = HandshakeChannel::new(std::io::stdout());
    let config = match &options.handshake {
        Some(config) => config.clone(),
        None => HandshakeConfig::from_env()?,
    };

    let mut service = ProviderService::new(registry);
    if let Some(configurator) = &options.configurator {
        service = service.with_configurator(Arc::clone(configurator))?;
    }

    let listener = bind_listener(&config).await?;
    serve_on_listener(service, listener, config, options.shutdown_timeout, output).await
}

/// Serve a provider service on an already-bound listener.
///
/// The handshake line is announced through `output`, which fails the call if
/// anything was already written through it. Writes that bypass the channel
/// (a stray `println!`) are not seen, so the process must leave stdout to it.
pub async fn serve_on_listener<W: Write>(
    service: ProviderService,
    listener: TcpListener,
    config: HandshakeConfig,
    shutdown_timeout: Duration,
    mut output: HandshakeChannel<W>,
) -> Result<(), Box<dyn std::error::Error>> {
    let addr = listener.local_addr()?;
    let context = BootstrapContext::new(PluginIdentity::generate(addr)?, config);

    let service = Arc::new(service);
    let terminate = Arc::new(Notify::new());
    let stop_serving = Arc::new(Notify::new());

    let server = Server::builder()
        .tls_config(context.tls_config())?
        .add_service(ProviderServer::new(ProviderGrpcService {
            service: Arc::clone(&service),
        }))
        .add_service(GrpcControllerServer::new(ControllerService {
            service: Arc::clone(&service),
            terminate: Arc::clone(&terminate),
        }))
        .serve_with_incoming_shutdown(tokio_stream::wrappers::TcpListenerStream::new(listener), {
            let stop_serving = Arc::clone(&stop_serving);
            async move { stop_serving.notified().await }
        });
    tokio::pin!(server);

    output.announce(&context.handshake())?;
    info!(
        address = %addr,
        client_certificate = context.requires_client_certificate(),
        "Provider server starting"
    );

    tokio::select! {
        result = &mut server => {
            if let Err(e) = result {
                error!(error = %e, "Server error");
                return Err(e.into());
            }
            return Ok(());
        }
        _ = terminate.notified() => {}
        _ = wait_for_shutdown_signal() => {}
    }

    service.stop();
    stop_serving.notify_one();

    // The grace period starts once shutdown was triggered.
    match tokio::time::timeout(shutdown_timeout, &mut server).await {
        Ok(Ok(())) => {
            info!("Server shutdown complete");
        },
        Ok(Err(e)) => {
            error!(error = %e, "Server error during shutdown");
            return Err(e.into());
        },
        Err(_) => {
            warn!(timeout = ?shutdown_timeout, "Shutdown timeout exceeded, forcing shutdown");
        },
    }

    info!("Provider shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HandshakeError;
    use crate::handshake::Handshake;
    use crate::reflect::Resource;
    use crate::registry::ResourceProvider;
    use crate::service::Lifecycle;
    use crate::schema::{Attribute, SchemaBuilder};
    use crate::value::AttributeValue;
    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Network {
        id: Option<String>,
        cidr: String,
        tags: Option<Vec<String>>,
    }

    impl Resource for Network {
        fn describe(schema: SchemaBuilder) -> SchemaBuilder {
            schema
                .attribute("cidr", Attribute::required_string().with_forces_replacement())
                .attribute(
                    "tags",
                    Attribute::optional(crate::schema::AttributeKind::list(crate::schema::AttributeKind::STRING)),
                )
        }
    }

    struct NetworkProvider;

    #[async_trait]
    impl ResourceProvider<Network> for NetworkProvider {
        async fn create(&self, planned: Network) -> Result<Network, ProviderError> {
            Ok(Network {
                id: Some(format!("net-{}", planned.cidr)),
                ..planned
            })
        }

        async fn read(&self, current: Network) -> Result<Option<Network>, ProviderError> {
            Ok(Some(current))
        }

        async fn update(&self, _prior: Network, planned: Network) -> Result<Network, ProviderError> {
            Ok(planned)
        }

        async fn delete(&self, _current: Network) -> Result<(), ProviderError> {
            Ok(())
        }

        async fn import(&self, id: &str) -> Result<Vec<Network>, ProviderError> {
            Ok(vec![Network {
                id: Some(id.to_string()),
                cidr: "10.0.0.0/16".to_string(),
                tags: None,
            }])
        }
    }

    fn registry() -> ResourceRegistry {
        ResourceRegistry::new()
            .with_resource::<Network, _>("cloud_network", NetworkProvider)
            .unwrap()
    }

    fn grpc_service() -> ProviderGrpcService {
        ProviderGrpcService {
            service: Arc::new(ProviderService::new(registry())),
        }
    }

    /// Stdout stand-in the test can inspect while the server runs.
    #[derive(Clone, Default)]
    struct SharedOutput(Arc<parking_lot::Mutex<Vec<u8>>>);

    impl Write for SharedOutput {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn schema(svc: &ProviderGrpcService) -> Arc<ResourceSchema> {
        Arc::clone(svc.service.resolve("cloud_network").unwrap().schema())
    }

    fn dynamic(schema: &ResourceSchema, state: &ResourceState) -> Option<proto::DynamicValue> {
        Some(encode_state(schema, Some(state)).unwrap())
    }

    fn config(cidr: &str) -> ResourceState {
        ResourceState::new()
            .with("id", AttributeValue::Null)
            .with("cidr", cidr)
            .with("tags", AttributeValue::Null)
    }

    #[test]
    fn test_path_to_proto() {
        use proto::attribute_path::step::Selector;

        let path = AttributePath::attribute("labels").key("env");
        let proto = path_to_proto(&path);
        assert_eq!(proto.steps.len(), 2);
        assert_eq!(proto.steps[0].selector, Some(Selector::AttributeName("labels".to_string())));
        assert_eq!(proto.steps[1].selector, Some(Selector::ElementKeyString("env".to_string())));

        let proto = path_to_proto(&AttributePath::attribute("tags").index(3));
        assert_eq!(proto.steps[1].selector, Some(Selector::ElementKeyInt(3)));
    }

    #[test]
    fn test_schema_to_proto() {
        let svc = grpc_service();
        let proto = schema_to_proto(&schema(&svc));
        let block = proto.block.unwrap();

        let names: Vec<_> = block.attributes.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["id", "cidr", "tags"]);
        assert!(block.attributes[0].computed);
        assert!(block.attributes[1].required);
        assert_eq!(block.attributes[1].r#type, br#""string""#.to_vec());
        assert_eq!(block.attributes[2].r#type, br#"["list","string"]"#.to_vec());
    }

    #[test]
    fn test_cancellation_is_not_a_diagnostic() {
        let status = error_to_diagnostics(ProviderError::Cancelled).unwrap_err();
        assert_eq!(status.code(), tonic::Code::Cancelled);

        let diagnostics = error_to_diagnostics(ProviderError::UnknownResource("x".into())).unwrap();
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].severity, proto::diagnostic::Severity::Error as i32);
    }

    #[tokio::test]
    async fn test_plan_before_schema_returns_diagnostic() {
        let svc = grpc_service();
        let schema = schema(&svc);
        let response = svc
            .plan_resource_change(tonic::Request::new(proto::plan_resource_change::Request {
                type_name: "cloud_network".to_string(),
                proposed_new_state: dynamic(&schema, &config("10.0.0.0/16")),
                ..Default::default()
            }))
            .await
            .unwrap()
            .into_inner();

        assert_eq!(response.diagnostics.len(), 1);
        assert_eq!(response.diagnostics[0].summary, "Protocol sequence error");
    }

    #[tokio::test]
    async fn test_sequence_checked_before_payload() {
        let svc = grpc_service();
        let garbage = Some(proto::DynamicValue {
            msgpack: vec![0xc1],
            json: vec![],
        });

        let response = svc
            .plan_resource_change(tonic::Request::new(proto::plan_resource_change::Request {
                type_name: "cloud_network".to_string(),
                proposed_new_state: garbage.clone(),
                ..Default::default()
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(response.diagnostics[0].summary, "Protocol sequence error");

        let response = svc
            .apply_resource_change(tonic::Request::new(proto::apply_resource_change::Request {
                type_name: "cloud_unknown".to_string(),
                planned_state: garbage.clone(),
                ..Default::default()
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(response.diagnostics[0].summary, "Protocol sequence error");

        let response = svc
            .read_resource(tonic::Request::new(proto::read_resource::Request {
                type_name: "cloud_network".to_string(),
                current_state: garbage,
                ..Default::default()
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(response.diagnostics[0].summary, "Protocol sequence error");
        assert_eq!(svc.service.lifecycle(), Lifecycle::Uninitialized);
    }

    #[tokio::test]
    async fn test_serve_refuses_after_other_output() {
        let listener = bind_listener(&HandshakeConfig::new()).await.unwrap();
        let mut output = HandshakeChannel::new(Vec::new());
        write!(output, "hello").unwrap();

        let err = serve_on_listener(
            ProviderService::new(registry()),
            listener,
            HandshakeConfig::new(),
            Duration::from_secs(1),
            output,
        )
        .await
        .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<HandshakeError>(),
            Some(HandshakeError::OutputAlreadyWritten(5))
        ));
    }

    #[tokio::test]
    async fn test_serve_announces_handshake_with_certificate() {
        let output = SharedOutput::default();
        let listener = bind_listener(&HandshakeConfig::new()).await.unwrap();
        let addr = listener.local_addr().unwrap();

        let serve = serve_on_listener(
            ProviderService::new(registry()),
            listener,
            HandshakeConfig::new(),
            Duration::from_secs(1),
            HandshakeChannel::new(output.clone()),
        );
        tokio::pin!(serve);

        let line = tokio::select! {
            result = &mut serve => panic!("server exited early: {:?}", result.err().map(|e| e.to_string())),
            line = async {
                loop {
                    let written = output.0.lock().clone();
                    if written.ends_with(b"\n") {
                        return String::from_utf8(written).unwrap();
                    }
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            } => line,
        };

        assert_eq!(line.lines().count(), 1);
        let handshake = Handshake::parse(&line).unwrap();
        assert_eq!(handshake.address, addr);
        assert!(handshake.certificate.is_some());
    }

    #[tokio::test]
    async fn test_schema_plan_apply_round_trip() {
        let svc = grpc_service();
        let schema = schema(&svc);

        let response = svc
            .get_schema(tonic::Request::new(proto::get_provider_schema::Request {}))
            .await
            .unwrap()
            .into_inner();
        assert!(response.resource_schemas.contains_key("cloud_network"));
        assert!(response.server_capabilities.unwrap().plan_destroy);
        assert!(response.diagnostics.is_empty());

        let plan = svc
            .plan_resource_change(tonic::Request::new(proto::plan_resource_change::Request {
                type_name: "cloud_network".to_string(),
                prior_state: Some(encode_state(&schema, None).unwrap()),
                proposed_new_state: dynamic(&schema, &config("10.0.0.0/16")),
                config: dynamic(&schema, &config("10.0.0.0/16")),
                ..Default::default()
            }))
            .await
            .unwrap()
            .into_inner();
        assert!(plan.diagnostics.is_empty());
        assert!(plan.requires_replace.is_empty());
        let planned = decode_state(&schema, plan.planned_state.as_ref()).unwrap().unwrap();
        assert!(planned.get_or_null("id").is_unknown());

        let apply = svc
            .apply_resource_change(tonic::Request::new(proto::apply_resource_change::Request {
                type_name: "cloud_network".to_string(),
                prior_state: Some(encode_state(&schema, None).unwrap()),
                planned_state: plan.planned_state,
                planned_private: b"p".to_vec(),
                ..Default::default()
            }))
            .await
            .unwrap()
            .into_inner();
        assert!(apply.diagnostics.is_empty());
        assert_eq!(apply.private, b"p".to_vec());
        let created = decode_state(&schema, apply.new_state.as_ref()).unwrap().unwrap();
        assert_eq!(created.get_or_null("id").as_str(), Some("net-10.0.0.0/16"));

        // Changing a replacement-forcing attribute reports its path.
        let plan = svc
            .plan_resource_change(tonic::Request::new(proto::plan_resource_change::Request {
                type_name: "cloud_network".to_string(),
                prior_state: dynamic(&schema, &created),
                proposed_new_state: dynamic(&schema, &config("10.1.0.0/16")),
                ..Default::default()
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(
            plan.requires_replace,
            vec![path_to_proto(&AttributePath::attribute("cidr"))]
        );

        // Schema requests are rejected once serving.
        let response = svc
            .get_schema(tonic::Request::new(proto::get_provider_schema::Request {}))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(response.diagnostics.len(), 1);
    }

    #[tokio::test]
    async fn test_malformed_state_reports_diagnostic() {
        let svc = grpc_service();
        svc.service.get_schema().unwrap();

        let response = svc
            .read_resource(tonic::Request::new(proto::read_resource::Request {
                type_name: "cloud_network".to_string(),
                current_state: Some(proto::DynamicValue {
                    msgpack: vec![0x81, 0xa3],
                    json: vec![],
                }),
                ..Default::default()
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(response.diagnostics.len(), 1);
        assert_eq!(response.diagnostics[0].summary, "Invalid resource state");
    }

    #[tokio::test]
    async fn test_import_and_json_state() {
        let svc = grpc_service();
        let schema = schema(&svc);
        svc.service.get_schema().unwrap();

        let response = svc
            .import_resource_state(tonic::Request::new(proto::import_resource_state::Request {
                type_name: "cloud_network".to_string(),
                id: "net-1".to_string(),
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(response.imported_resources.len(), 1);
        let imported = &response.imported_resources[0];
        assert_eq!(imported.type_name, "cloud_network");
        let state = decode_state(&schema, imported.state.as_ref()).unwrap().unwrap();
        assert_eq!(state.get_or_null("id").as_str(), Some("net-1"));

        // Terraform may send JSON instead of msgpack.
        let response = svc
            .read_resource(tonic::Request::new(proto::read_resource::Request {
                type_name: "cloud_network".to_string(),
                current_state: Some(proto::DynamicValue {
                    msgpack: vec![],
                    json: br#"{"id":"net-1","cidr":"10.0.0.0/16","tags":["a"]}"#.to_vec(),
                }),
                ..Default::default()
            }))
            .await
            .unwrap()
            .into_inner();
        assert!(response.diagnostics.is_empty());
        let state = decode_state(&schema, response.new_state.as_ref()).unwrap().unwrap();
        assert_eq!(
            state.get_or_null("tags"),
            &AttributeValue::list([AttributeValue::string("a")])
        );
    }

    #[tokio::test]
    async fn test_stop_then_calls_fail() {
        let svc = grpc_service();
        svc.service.get_schema().unwrap();

        let response = svc
            .stop(tonic::Request::new(proto::stop::Request {}))
            .await
            .unwrap()
            .into_inner();
        assert!(response.error.is_empty());

        let response = svc
            .import_resource_state(tonic::Request::new(proto::import_resource_state::Request {
                type_name: "cloud_network".to_string(),
                id: "net-1".to_string(),
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(response.diagnostics[0].summary, "Protocol sequence error");
    }

    #[tokio::test]
    async fn test_controller_shutdown_signals_termination() {
        let svc = grpc_service();
        let terminate = Arc::new(Notify::new());
        let controller = ControllerService {
            service: Arc::clone(&svc.service),
            terminate: Arc::clone(&terminate),
        };

        controller.shutdown(tonic::Request::new(Empty {})).await.unwrap();
        assert!(svc.service.is_stopped());
        // notify_one stores a permit, so this completes immediately.
        tokio::time::timeout(Duration::from_secs(1), terminate.notified())
            .await
            .unwrap();
    }
}
