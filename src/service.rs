//! Protocol-independent provider service.
//!
//! [`ProviderService`] owns the resource registry and implements every
//! provider operation in terms of [`ResourceState`]. The gRPC layer in
//! [`crate::server`] only decodes requests, calls into this type and encodes
//! the results.
//!
//! Calls are checked against a small lifecycle:
//!
//! ```text
//! Uninitialized -> SchemaPublished -> Serving -> Stopped
//! ```
//!
//! The schema can only be requested before serving begins; every other call
//! needs a published schema, and nothing but `stop` is accepted once stopped.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::codec;
use crate::error::{ProviderError, SchemaError};
use crate::plan;
use crate::registry::{RegistryEntry, ResourceRegistry};
use crate::schema::{AttributePath, Diagnostic, ResourceSchema, SchemaBuilder};
use crate::types::{ApplyResult, PlanResult, ServerCapabilities};
use crate::validation;
use crate::value::ResourceState;

/// Hooks for provider-level configuration.
///
/// Optional: a provider without configuration does not need one.
///
/// # Example
///
/// ```
/// use async_trait::async_trait;
/// use tfplugin_sdk::{Attribute, Diagnostic, ProviderConfigurator, ProviderError, SchemaBuilder};
///
/// struct FileProviderConfig;
///
/// #[async_trait]
/// impl ProviderConfigurator for FileProviderConfig {
///     fn describe(&self, schema: SchemaBuilder) -> SchemaBuilder {
///         schema.attribute("file_header", Attribute::optional_string())
///     }
///
///     async fn configure(&self, config: serde_json::Value) -> Result<Vec<Diagnostic>, ProviderError> {
///         let _header = config["file_header"].as_str().unwrap_or_default();
///         Ok(vec![])
///     }
/// }
/// ```
#[async_trait]
pub trait ProviderConfigurator: Send + Sync + 'static {
    /// Add the provider configuration attributes to the builder.
    fn describe(&self, schema: SchemaBuilder) -> SchemaBuilder;

    /// Validate the provider configuration before configuring.
    /// Returns diagnostics (errors and warnings).
    async fn validate(&self, config: serde_json::Value) -> Result<Vec<Diagnostic>, ProviderError> {
        let _ = config;
        Ok(vec![])
    }

    /// Configure the provider with credentials and settings.
    /// Returns diagnostics (errors and warnings).
    async fn configure(&self, config: serde_json::Value) -> Result<Vec<Diagnostic>, ProviderError>;
}

/// Lifecycle state of a [`ProviderService`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Lifecycle {
    /// No call has been made yet.
    Uninitialized = 0,
    /// The schema was handed out.
    SchemaPublished = 1,
    /// Resource calls are being served.
    Serving = 2,
    /// The service was stopped.
    Stopped = 3,
}

impl Lifecycle {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Uninitialized,
            1 => Self::SchemaPublished,
            2 => Self::Serving,
            _ => Self::Stopped,
        }
    }
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Uninitialized => "uninitialized",
            Self::SchemaPublished => "schema published",
            Self::Serving => "serving",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Everything returned by `get_schema`.
#[derive(Debug, Clone)]
pub struct ProviderSchema {
    /// Provider configuration schema; empty when the provider takes no configuration.
    pub provider: Arc<ResourceSchema>,
    /// Resource schemas by type name.
    pub resources: BTreeMap<String, Arc<ResourceSchema>>,
    /// Capabilities advertised to Terraform.
    pub capabilities: ServerCapabilities,
}

/// The provider service.
pub struct ProviderService {
    registry: ResourceRegistry,
    provider_schema: Arc<ResourceSchema>,
    configurator: Option<Arc<dyn ProviderConfigurator>>,
    lifecycle: AtomicU8,
    stop: watch::Sender<bool>,
}

impl fmt::Debug for ProviderService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderService")
            .field("registry", &self.registry)
            .field("configurable", &self.configurator.is_some())
            .field("lifecycle", &self.lifecycle())
            .finish()
    }
}

impl ProviderService {
    /// Create a service serving the registered resource types.
    pub fn new(registry: ResourceRegistry) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            registry,
            provider_schema: Arc::new(ResourceSchema::empty()),
            configurator: None,
            lifecycle: AtomicU8::new(Lifecycle::Uninitialized as u8),
            stop,
        }
    }

    /// Attach provider configuration hooks.
    pub fn with_configurator(mut self, hooks: Arc<dyn ProviderConfigurator>) -> Result<Self, SchemaError> {
        let schema = hooks.describe(SchemaBuilder::without_identifier()).build()?;
        self.provider_schema = Arc::new(schema);
        self.configurator = Some(hooks);
        Ok(self)
    }

    /// The registry this service dispatches to.
    pub fn registry(&self) -> &ResourceRegistry {
        &self.registry
    }

    /// The current lifecycle state.
    pub fn lifecycle(&self) -> Lifecycle {
        Lifecycle::from_u8(self.lifecycle.load(Ordering::Acquire))
    }

    /// The provider configuration schema.
    pub fn provider_config_schema(&self) -> &Arc<ResourceSchema> {
        &self.provider_schema
    }

    /// Resolve a resource type.
    pub fn resolve(&self, type_name: &str) -> Result<&RegistryEntry, ProviderError> {
        self.registry.resolve(type_name)
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    fn transition(
        &self,
        operation: &str,
        next: impl Fn(Lifecycle) -> Option<Lifecycle>,
    ) -> Result<(), ProviderError> {
        self.lifecycle
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                next(Lifecycle::from_u8(current)).map(|state| state as u8)
            })
            .map(|_| ())
            .map_err(|current| {
                let current = Lifecycle::from_u8(current);
                warn!(operation, state = %current, "Call out of sequence");
                ProviderError::ProtocolSequence(format!(
                    "{} is not allowed while the provider is {}",
                    operation, current
                ))
            })
    }

    fn publish_schema(&self) -> Result<(), ProviderError> {
        self.transition("GetProviderSchema", |state| match state {
            Lifecycle::Uninitialized | Lifecycle::SchemaPublished => Some(Lifecycle::SchemaPublished),
            Lifecycle::Serving | Lifecycle::Stopped => None,
        })
    }

    /// Fail unless the schema was published and the service is not stopped.
    ///
    /// Leaves the lifecycle unchanged. Callers that decode request payloads
    /// check this first so that out-of-sequence calls are reported as such.
    pub fn require_schema(&self, operation: &str) -> Result<(), ProviderError> {
        self.transition(operation, |state| match state {
            Lifecycle::SchemaPublished | Lifecycle::Serving => Some(state),
            Lifecycle::Uninitialized | Lifecycle::Stopped => None,
        })
    }

    fn begin_serving(&self, operation: &str) -> Result<(), ProviderError> {
        self.transition(operation, |state| match state {
            Lifecycle::SchemaPublished | Lifecycle::Serving => Some(Lifecycle::Serving),
            Lifecycle::Uninitialized | Lifecycle::Stopped => None,
        })
    }

    /// Stop the service and cancel every call in flight.
    pub fn stop(&self) {
        let previous = Lifecycle::from_u8(
            self.lifecycle
                .swap(Lifecycle::Stopped as u8, Ordering::AcqRel),
        );
        self.stop.send_replace(true);
        info!(previous = %previous, "Provider stopped");
    }

    /// Whether `stop` was called.
    pub fn is_stopped(&self) -> bool {
        *self.stop.borrow()
    }

    /// Run `work` unless the service is stopped first.
    async fn cancellable<T>(
        &self,
        work: impl Future<Output = Result<T, ProviderError>>,
    ) -> Result<T, ProviderError> {
        let mut stopped = self.stop.subscribe();
        let already_stopped = *stopped.borrow_and_update();
        if already_stopped {
            return Err(ProviderError::Cancelled);
        }
        tokio::select! {
            result = work => result,
            _ = stopped.wait_for(|stopped| *stopped) => Err(ProviderError::Cancelled),
        }
    }

    // =========================================================================
    // Schema & Provider Configuration
    // =========================================================================

    /// Return the provider and resource schemas.
    pub fn get_schema(&self) -> Result<ProviderSchema, ProviderError> {
        self.publish_schema()?;
        Ok(self.schema())
    }

    /// The schemas, without any lifecycle transition.
    pub fn schema(&self) -> ProviderSchema {
        let resources = self
            .registry
            .entries()
            .map(|entry| (entry.name().to_string(), Arc::clone(entry.schema())))
            .collect();
        ProviderSchema {
            provider: Arc::clone(&self.provider_schema),
            resources,
            capabilities: ServerCapabilities { plan_destroy: true },
        }
    }

    /// Validate the provider configuration.
    pub async fn prepare_provider_config(&self, config: &ResourceState) -> Result<Vec<Diagnostic>, ProviderError> {
        self.require_schema("PrepareProviderConfig")?;
        let mut diagnostics = validation::validate(&self.provider_schema, config);
        if let (true, Some(hooks)) = (diagnostics.is_empty(), &self.configurator) {
            diagnostics.extend(
                self.cancellable(hooks.validate(codec::to_json(config)))
                    .await?,
            );
        }
        Ok(diagnostics)
    }

    /// Configure the provider.
    pub async fn configure(&self, config: &ResourceState) -> Result<Vec<Diagnostic>, ProviderError> {
        self.require_schema("Configure")?;
        match &self.configurator {
            Some(hooks) => self.cancellable(hooks.configure(codec::to_json(config))).await,
            None => Ok(Vec::new()),
        }
    }

    // =========================================================================
    // Resource Operations
    // =========================================================================

    /// Validate a resource configuration.
    pub fn validate_resource_config(
        &self,
        type_name: &str,
        config: &ResourceState,
    ) -> Result<Vec<Diagnostic>, ProviderError> {
        self.require_schema("ValidateResourceTypeConfig")?;
        let entry = self.resolve(type_name)?;
        Ok(validation::validate(entry.schema(), config))
    }

    /// Convert stored JSON state to the current schema.
    ///
    /// Attributes the schema no longer declares are dropped; attributes it
    /// gained since are null.
    pub fn upgrade_resource_state(
        &self,
        type_name: &str,
        version: i64,
        raw_json: &[u8],
    ) -> Result<ResourceState, ProviderError> {
        self.begin_serving("UpgradeResourceState")?;
        let entry = self.resolve(type_name)?;
        let schema = entry.schema();
        if version > schema.version {
            return Err(ProviderError::InvalidRequest(format!(
                "state version {} is newer than schema version {} for '{}'",
                version, schema.version, type_name
            )));
        }

        let mut json: serde_json::Value = serde_json::from_slice(raw_json)?;
        if let Some(object) = json.as_object_mut() {
            let before = object.len();
            object.retain(|name, _| schema.attribute(name).is_some());
            if object.len() != before {
                debug!(resource_type = %type_name, dropped = before - object.len(), "Dropped obsolete attributes");
            }
        }
        Ok(codec::from_json(schema, &json)?)
    }

    /// Refresh a resource. `None` means it no longer exists.
    pub async fn read_resource(
        &self,
        type_name: &str,
        current: &ResourceState,
    ) -> Result<Option<ResourceState>, ProviderError> {
        self.begin_serving("ReadResource")?;
        let entry = self.resolve(type_name)?;
        let result = self
            .cancellable(entry.handler().read(entry.schema(), current))
            .await?;
        if result.is_none() {
            info!(resource_type = %type_name, "Resource no longer exists");
        }
        Ok(result)
    }

    /// Plan a change. A missing proposed state plans a destroy, which yields `None`.
    pub fn plan_resource_change(
        &self,
        type_name: &str,
        prior: Option<&ResourceState>,
        proposed: Option<&ResourceState>,
    ) -> Result<Option<PlanResult>, ProviderError> {
        self.begin_serving("PlanResourceChange")?;
        if self.is_stopped() {
            return Err(ProviderError::Cancelled);
        }
        let entry = self.resolve(type_name)?;

        let Some(proposed) = proposed else {
            debug!(resource_type = %type_name, "Planned destroy");
            return Ok(None);
        };

        let result = plan::plan(entry.schema(), prior, proposed)?;
        if let Some(prior) = prior {
            debug!(
                resource_type = %type_name,
                changed = ?plan::changed_attributes(entry.schema(), prior, &result.planned_state),
                requires_replace = ?result.requires_replace,
                "Planned update"
            );
        }
        Ok(Some(result))
    }

    /// Apply a planned change.
    ///
    /// Create, update or delete is chosen from which states are present. When
    /// the resource implementation fails, the result still carries the state
    /// the resource is known to be in.
    pub async fn apply_resource_change(
        &self,
        type_name: &str,
        prior: Option<&ResourceState>,
        planned: Option<&ResourceState>,
    ) -> Result<ApplyResult, ProviderError> {
        self.begin_serving("ApplyResourceChange")?;
        let entry = self.resolve(type_name)?;
        let schema = entry.schema();
        let handler = entry.handler();

        let outcome = match (prior, planned) {
            (None, None) => {
                return Err(ProviderError::InvalidRequest(
                    "apply needs a prior or a planned state".to_string(),
                ))
            },
            (None, Some(planned)) => {
                info!(resource_type = %type_name, "Creating resource");
                self.cancellable(handler.create(schema, planned)).await.map(Some)
            },
            (Some(prior), Some(planned)) => {
                info!(resource_type = %type_name, "Updating resource");
                self.cancellable(handler.update(schema, prior, planned))
                    .await
                    .map(Some)
            },
            (Some(prior), None) => {
                info!(resource_type = %type_name, "Deleting resource");
                self.cancellable(handler.delete(schema, prior)).await.map(|()| None)
            },
        };

        match outcome {
            Ok(new_state) => {
                let mut result = ApplyResult::success(new_state);
                if let (Some(state), Some(identifier)) = (&result.new_state, &schema.identifier) {
                    if !state.get_or_null(identifier).is_known() {
                        result.diagnostics.push(
                            Diagnostic::error("Resource has no identifier after apply")
                                .with_detail(format!("The provider did not set '{}'", identifier))
                                .with_attribute(AttributePath::attribute(identifier.clone())),
                        );
                    }
                }
                Ok(result)
            },
            Err(ProviderError::Cancelled) => Err(ProviderError::Cancelled),
            Err(ProviderError::Partial { message, state }) => {
                warn!(resource_type = %type_name, error = %message, "Apply partially failed");
                let mut diagnostics = vec![Diagnostic::error(message)];
                let new_state = match codec::from_json(schema, &state) {
                    Ok(state) => Some(state),
                    Err(err) => {
                        warn!(resource_type = %type_name, error = %err, "Partial state does not match schema");
                        diagnostics.extend(ProviderError::Codec(err).to_diagnostics());
                        // The resource exists: keep what can be read, and the
                        // prior (or planned, on create) values for the rest.
                        codec::from_json_lossy(schema, &state, prior.or(planned))
                    },
                };
                Ok(ApplyResult {
                    new_state,
                    diagnostics,
                })
            },
            Err(err) => {
                warn!(resource_type = %type_name, error = %err, "Apply failed");
                Ok(ApplyResult {
                    new_state: prior.cloned(),
                    diagnostics: err.to_diagnostics(),
                })
            },
        }
    }

    /// Import existing resources by identifier.
    pub async fn import_resource_state(&self, type_name: &str, id: &str) -> Result<Vec<ResourceState>, ProviderError> {
        self.begin_serving("ImportResourceState")?;
        let entry = self.resolve(type_name)?;
        self.cancellable(entry.handler().import(entry.schema(), id)).await
    }
}
