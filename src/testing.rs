//! Testing utilities for provider implementations.
//!
//! This module drives a [`ProviderService`] the way Terraform would, without
//! spinning up a gRPC server.
//!
//! # Example
//!
//! ```ignore
//! use tfplugin_sdk::testing::ProviderTester;
//! use serde_json::json;
//!
//! #[tokio::test]
//! async fn test_create_bucket() {
//!     let registry = ResourceRegistry::new()
//!         .with_resource::<Bucket, _>("cloud_bucket", BucketProvider::default())
//!         .unwrap();
//!     let tester = ProviderTester::new(registry);
//!
//!     let state = tester
//!         .lifecycle_create("cloud_bucket", json!({"name": "logs"}))
//!         .await
//!         .unwrap();
//!
//!     assert_eq!(state.get_or_null("name").as_str(), Some("logs"));
//! }
//! ```

use std::sync::Arc;

use serde_json::Value;

use crate::codec;
use crate::error::{ProviderError, SchemaError};
use crate::registry::ResourceRegistry;
use crate::schema::{Diagnostic, DiagnosticSeverity};
use crate::service::{ProviderConfigurator, ProviderSchema, ProviderService};
use crate::types::{ApplyResult, PlanResult};
use crate::value::ResourceState;

/// A test harness for provider implementations.
///
/// The schema is published when the tester is created, so resource calls can
/// be made right away.
pub struct ProviderTester {
    service: ProviderService,
}

impl ProviderTester {
    /// Create a new tester for the given resources.
    pub fn new(registry: ResourceRegistry) -> Self {
        Self::from_service(ProviderService::new(registry))
    }

    /// Create a tester for a configurable provider.
    pub fn with_configurator(
        registry: ResourceRegistry,
        configurator: Arc<dyn ProviderConfigurator>,
    ) -> Result<Self, SchemaError> {
        Ok(Self::from_service(
            ProviderService::new(registry).with_configurator(configurator)?,
        ))
    }

    fn from_service(service: ProviderService) -> Self {
        // A fresh service is uninitialized, so publishing cannot fail.
        let _ = service.get_schema();
        Self { service }
    }

    /// Get a reference to the underlying service.
    pub fn service(&self) -> &ProviderService {
        &self.service
    }

    // =========================================================================
    // Schema
    // =========================================================================

    /// The published schema.
    pub fn schema(&self) -> ProviderSchema {
        self.service.schema()
    }

    /// Get the list of resource type names.
    pub fn resource_types(&self) -> Vec<String> {
        self.service.registry().resource_types()
    }

    /// Convert a JSON object to a state of `resource_type`.
    ///
    /// Attributes missing from `json` are null.
    pub fn state(&self, resource_type: &str, json: Value) -> Result<ResourceState, ProviderError> {
        let entry = self.service.resolve(resource_type)?;
        Ok(codec::from_json(entry.schema(), &json)?)
    }

    // =========================================================================
    // Provider Lifecycle
    // =========================================================================

    /// Validate provider configuration.
    ///
    /// Returns `Ok(())` if validation passes (no error diagnostics).
    /// Returns `Err` with the diagnostics if there are errors.
    pub async fn validate_provider_config(&self, config: Value) -> Result<(), TestError> {
        let config = codec::from_json(self.service.provider_config_schema(), &config).map_err(ProviderError::from)?;
        let diagnostics = self.service.prepare_provider_config(&config).await?;
        check_diagnostics(diagnostics)
    }

    /// Configure the provider.
    ///
    /// Returns `Ok(())` if configuration succeeds.
    /// Returns `Err` with the diagnostics if there are errors.
    pub async fn configure(&self, config: Value) -> Result<(), TestError> {
        let config = codec::from_json(self.service.provider_config_schema(), &config).map_err(ProviderError::from)?;
        let diagnostics = self.service.configure(&config).await?;
        check_diagnostics(diagnostics)
    }

    /// Stop the provider.
    pub fn stop(&self) {
        self.service.stop();
    }

    // =========================================================================
    // Resource Operations
    // =========================================================================

    /// Validate a resource configuration.
    pub fn validate_resource_config(&self, resource_type: &str, config: Value) -> Result<(), TestError> {
        let config = self.state(resource_type, config)?;
        let diagnostics = self.service.validate_resource_config(resource_type, &config)?;
        check_diagnostics(diagnostics)
    }

    /// Plan a resource creation (no prior state).
    pub fn plan_create(&self, resource_type: &str, config: Value) -> Result<PlanResult, ProviderError> {
        let proposed = self.state(resource_type, config)?;
        self.plan(resource_type, None, &proposed)
    }

    /// Plan a resource update from configuration.
    pub fn plan_update(
        &self,
        resource_type: &str,
        prior_state: &ResourceState,
        config: Value,
    ) -> Result<PlanResult, ProviderError> {
        let proposed = self.state(resource_type, config)?;
        self.plan(resource_type, Some(prior_state), &proposed)
    }

    /// Plan a resource deletion.
    pub fn plan_delete(&self, resource_type: &str, prior_state: &ResourceState) -> Result<(), ProviderError> {
        self.service
            .plan_resource_change(resource_type, Some(prior_state), None)
            .map(|_| ())
    }

    /// Full plan operation with an explicit proposed state.
    pub fn plan(
        &self,
        resource_type: &str,
        prior_state: Option<&ResourceState>,
        proposed_state: &ResourceState,
    ) -> Result<PlanResult, ProviderError> {
        self.service
            .plan_resource_change(resource_type, prior_state, Some(proposed_state))?
            .ok_or_else(|| ProviderError::Sdk("plan with a proposed state returned a destroy".to_string()))
    }

    /// Apply a change, exactly as Terraform would.
    pub async fn apply(
        &self,
        resource_type: &str,
        prior_state: Option<&ResourceState>,
        planned_state: Option<&ResourceState>,
    ) -> Result<ApplyResult, ProviderError> {
        self.service
            .apply_resource_change(resource_type, prior_state, planned_state)
            .await
    }

    /// Create a new resource.
    pub async fn create(&self, resource_type: &str, planned_state: &ResourceState) -> Result<ResourceState, TestError> {
        let result = self.apply(resource_type, None, Some(planned_state)).await?;
        applied_state(result)
    }

    /// Read the current state of a resource.
    pub async fn read(
        &self,
        resource_type: &str,
        current_state: &ResourceState,
    ) -> Result<Option<ResourceState>, ProviderError> {
        self.service.read_resource(resource_type, current_state).await
    }

    /// Update an existing resource.
    pub async fn update(
        &self,
        resource_type: &str,
        prior_state: &ResourceState,
        planned_state: &ResourceState,
    ) -> Result<ResourceState, TestError> {
        let result = self
            .apply(resource_type, Some(prior_state), Some(planned_state))
            .await?;
        applied_state(result)
    }

    /// Delete a resource.
    pub async fn delete(&self, resource_type: &str, current_state: &ResourceState) -> Result<(), TestError> {
        let result = self.apply(resource_type, Some(current_state), None).await?;
        check_diagnostics(result.diagnostics)
    }

    /// Import an existing resource.
    pub async fn import_resource(&self, resource_type: &str, id: &str) -> Result<Vec<ResourceState>, ProviderError> {
        self.service.import_resource_state(resource_type, id).await
    }

    /// Upgrade stored state from an older schema version.
    pub fn upgrade_resource_state(
        &self,
        resource_type: &str,
        version: i64,
        state: Value,
    ) -> Result<ResourceState, ProviderError> {
        let raw = serde_json::to_vec(&state)?;
        self.service.upgrade_resource_state(resource_type, version, &raw)
    }

    // =========================================================================
    // Lifecycle Helpers
    // =========================================================================

    /// Run a full create lifecycle: plan → create → read.
    ///
    /// Returns the final state after read.
    pub async fn lifecycle_create(&self, resource_type: &str, config: Value) -> Result<ResourceState, TestError> {
        let plan = self.plan_create(resource_type, config)?;
        let created = self.create(resource_type, &plan.planned_state).await?;
        self.read_existing(resource_type, &created).await
    }

    /// Run a full update lifecycle: plan → update → read.
    ///
    /// Returns the final state after read.
    pub async fn lifecycle_update(
        &self,
        resource_type: &str,
        prior_state: &ResourceState,
        config: Value,
    ) -> Result<ResourceState, TestError> {
        let plan = self.plan_update(resource_type, prior_state, config)?;
        if plan.requires_replacement() {
            // Terraform replaces by destroying first, then creating.
            self.delete(resource_type, prior_state).await?;
            let created = self.create(resource_type, &plan.planned_state).await?;
            return self.read_existing(resource_type, &created).await;
        }
        let updated = self
            .update(resource_type, prior_state, &plan.planned_state)
            .await?;
        self.read_existing(resource_type, &updated).await
    }

    /// Run a full delete lifecycle: plan → delete.
    pub async fn lifecycle_delete(&self, resource_type: &str, current_state: &ResourceState) -> Result<(), TestError> {
        self.plan_delete(resource_type, current_state)?;
        self.delete(resource_type, current_state).await
    }

    /// Run a full CRUD lifecycle: create → read → update → read → delete.
    ///
    /// Returns the state after the update (before delete).
    pub async fn lifecycle_crud(
        &self,
        resource_type: &str,
        initial_config: Value,
        updated_config: Value,
    ) -> Result<ResourceState, TestError> {
        let created = self.lifecycle_create(resource_type, initial_config).await?;
        let updated = self
            .lifecycle_update(resource_type, &created, updated_config)
            .await?;
        self.lifecycle_delete(resource_type, &updated).await?;
        Ok(updated)
    }

    async fn read_existing(&self, resource_type: &str, state: &ResourceState) -> Result<ResourceState, TestError> {
        self.read(resource_type, state).await?.ok_or_else(|| {
            TestError::Provider(ProviderError::NotFound(format!(
                "{} disappeared right after apply",
                resource_type
            )))
        })
    }
}

/// Error type for test operations that may fail with diagnostics.
#[derive(Debug, thiserror::Error)]
pub enum TestError {
    /// The operation failed with diagnostics.
    #[error("{}", describe_diagnostics(.0))]
    Diagnostics(Vec<Diagnostic>),
    /// The operation failed with a provider error.
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),
}

fn describe_diagnostics(diagnostics: &[Diagnostic]) -> String {
    let mut out = format!("Operation failed with {} diagnostic(s):\n", diagnostics.len());
    for diag in diagnostics {
        out.push_str(&format!("  [{:?}] {}", diag.severity, diag.summary));
        if let Some(detail) = &diag.detail {
            out.push_str(&format!(": {}", detail));
        }
        if let Some(attr) = &diag.attribute {
            out.push_str(&format!(" (at {})", attr));
        }
        out.push('\n');
    }
    out
}

/// Check diagnostics and return an error if there are any errors.
fn check_diagnostics(diagnostics: Vec<Diagnostic>) -> Result<(), TestError> {
    let errors: Vec<_> = diagnostics
        .into_iter()
        .filter(|d| matches!(d.severity, DiagnosticSeverity::Error))
        .collect();

    if errors.is_empty() {
        Ok(())
    } else {
        Err(TestError::Diagnostics(errors))
    }
}

fn applied_state(result: ApplyResult) -> Result<ResourceState, TestError> {
    check_diagnostics(result.diagnostics)?;
    result
        .new_state
        .ok_or_else(|| TestError::Provider(ProviderError::Sdk("apply returned no state".to_string())))
}

// =========================================================================
// Assertion Helpers
// =========================================================================

/// Assert that a plan requires resource replacement.
///
/// # Panics
///
/// Panics if the plan does not require replacement.
pub fn assert_plan_replaces(plan: &PlanResult) {
    assert!(
        plan.requires_replacement(),
        "Expected plan to require replacement, but it does not"
    );
}

/// Assert that a plan does not require resource replacement.
///
/// # Panics
///
/// Panics if the plan requires replacement.
pub fn assert_plan_updates_in_place(plan: &PlanResult) {
    assert!(
        !plan.requires_replacement(),
        "Expected plan to update in place, but it requires replacement of {:?}",
        plan.requires_replace
    );
}

/// Assert that changing `attribute` is one of the reasons for replacement.
///
/// # Panics
///
/// Panics if `attribute` is not in the plan's replacement set.
pub fn assert_plan_replaces_because_of(plan: &PlanResult, attribute: &str) {
    assert!(
        plan.requires_replace.contains(attribute),
        "Expected '{}' to force replacement, but replacement is caused by {:?}",
        attribute,
        plan.requires_replace
    );
}

/// Assert that the planned value of `attribute` is unknown.
///
/// # Panics
///
/// Panics if the planned value is known or null.
pub fn assert_planned_unknown(plan: &PlanResult, attribute: &str) {
    let value = plan.planned_state.get_or_null(attribute);
    assert!(
        value.is_unknown(),
        "Expected '{}' to be unknown after plan, but it is {:?}",
        attribute,
        value
    );
}

/// Assert that diagnostics contain no errors.
///
/// # Panics
///
/// Panics if there are any error diagnostics.
pub fn assert_no_errors(diagnostics: &[Diagnostic]) {
    let errors: Vec<_> = diagnostics
        .iter()
        .filter(|d| matches!(d.severity, DiagnosticSeverity::Error))
        .collect();

    assert!(
        errors.is_empty(),
        "Expected no errors, but got {} error(s): {:?}",
        errors.len(),
        errors.iter().map(|d| &d.summary).collect::<Vec<_>>()
    );
}

/// Assert that diagnostics contain at least one error.
///
/// # Panics
///
/// Panics if there are no error diagnostics.
pub fn assert_has_errors(diagnostics: &[Diagnostic]) {
    let has_errors = diagnostics
        .iter()
        .any(|d| matches!(d.severity, DiagnosticSeverity::Error));

    assert!(has_errors, "Expected at least one error, but got none");
}

/// Assert that diagnostics contain an error with the given summary substring.
///
/// # Panics
///
/// Panics if no error diagnostic contains the given substring.
pub fn assert_error_contains(diagnostics: &[Diagnostic], substring: &str) {
    let has_matching_error = diagnostics
        .iter()
        .any(|d| matches!(d.severity, DiagnosticSeverity::Error) && d.summary.contains(substring));

    assert!(
        has_matching_error,
        "Expected an error containing '{}', but no matching error found. Errors: {:?}",
        substring,
        diagnostics
            .iter()
            .filter(|d| matches!(d.severity, DiagnosticSeverity::Error))
            .map(|d| &d.summary)
            .collect::<Vec<_>>()
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reflect::Resource;
    use crate::registry::ResourceProvider;
    use crate::schema::{Attribute, AttributeKind, AttributePath, SchemaBuilder};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde::{Deserialize, Serialize};
    use serde_json::json;
    use std::collections::HashMap;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Bucket {
        id: Option<String>,
        name: String,
        region: Option<String>,
        versioning: Option<bool>,
    }

    impl Resource for Bucket {
        fn describe(schema: SchemaBuilder) -> SchemaBuilder {
            schema
                .attribute("name", Attribute::required_string().with_forces_replacement())
                .attribute("region", Attribute::optional_computed(AttributeKind::STRING))
                .attribute("versioning", Attribute::optional_bool())
        }
    }

    #[derive(Default)]
    struct BucketProvider {
        buckets: Mutex<HashMap<String, Bucket>>,
    }

    #[async_trait]
    impl ResourceProvider<Bucket> for BucketProvider {
        async fn create(&self, planned: Bucket) -> Result<Bucket, ProviderError> {
            let bucket = Bucket {
                id: Some(format!("bucket-{}", planned.name)),
                region: planned.region.or_else(|| Some("eu-west-1".to_string())),
                ..planned
            };
            self.buckets.lock().insert(bucket.name.clone(), bucket.clone());
            Ok(bucket)
        }

        async fn read(&self, current: Bucket) -> Result<Option<Bucket>, ProviderError> {
            Ok(self.buckets.lock().get(&current.name).cloned())
        }

        async fn update(&self, _prior: Bucket, planned: Bucket) -> Result<Bucket, ProviderError> {
            self.buckets.lock().insert(planned.name.clone(), planned.clone());
            Ok(planned)
        }

        async fn delete(&self, current: Bucket) -> Result<(), ProviderError> {
            self.buckets.lock().remove(&current.name);
            Ok(())
        }
    }

    struct ApiKeyConfig;

    #[async_trait]
    impl ProviderConfigurator for ApiKeyConfig {
        fn describe(&self, schema: SchemaBuilder) -> SchemaBuilder {
            schema.attribute("api_key", Attribute::optional_string().sensitive())
        }

        async fn configure(&self, config: Value) -> Result<Vec<Diagnostic>, ProviderError> {
            if config["api_key"].is_null() {
                return Ok(vec![Diagnostic::error("Missing API key")]);
            }
            Ok(vec![])
        }
    }

    fn tester() -> ProviderTester {
        let registry = ResourceRegistry::new()
            .with_resource::<Bucket, _>("cloud_bucket", BucketProvider::default())
            .unwrap();
        ProviderTester::with_configurator(registry, Arc::new(ApiKeyConfig)).unwrap()
    }

    #[tokio::test]
    async fn test_tester_configure() {
        let tester = tester();
        assert!(tester.configure(json!({"api_key": "test"})).await.is_ok());

        let err = tester.configure(json!({})).await.unwrap_err();
        assert!(matches!(err, TestError::Diagnostics(d) if d[0].summary == "Missing API key"));
    }

    #[test]
    fn test_tester_schema() {
        let tester = tester();
        assert!(tester.schema().resources.contains_key("cloud_bucket"));
        assert!(tester.schema().provider.attribute("api_key").is_some());
        assert_eq!(tester.resource_types(), vec!["cloud_bucket".to_string()]);
    }

    #[test]
    fn test_tester_plan_create() {
        let tester = tester();
        let plan = tester.plan_create("cloud_bucket", json!({"name": "logs"})).unwrap();

        assert_plan_updates_in_place(&plan);
        assert_planned_unknown(&plan, "id");
        assert_planned_unknown(&plan, "region");
        assert!(plan.planned_state.get_or_null("versioning").is_null());
    }

    #[test]
    fn test_tester_plan_update_replaces() {
        let tester = tester();
        let prior = tester
            .state(
                "cloud_bucket",
                json!({"id": "bucket-logs", "name": "logs", "region": "eu-west-1"}),
            )
            .unwrap();

        let plan = tester
            .plan_update("cloud_bucket", &prior, json!({"name": "audit"}))
            .unwrap();
        assert_plan_replaces(&plan);
        assert_plan_replaces_because_of(&plan, "name");
        assert_planned_unknown(&plan, "region");

        let plan = tester
            .plan_update("cloud_bucket", &prior, json!({"name": "logs", "versioning": true}))
            .unwrap();
        assert_plan_updates_in_place(&plan);
        assert_eq!(plan.planned_state.get_or_null("region").as_str(), Some("eu-west-1"));
    }

    #[test]
    fn test_tester_validate_resource_config() {
        let tester = tester();
        assert!(tester
            .validate_resource_config("cloud_bucket", json!({"name": "logs"}))
            .is_ok());

        match tester.validate_resource_config("cloud_bucket", json!({"versioning": true})) {
            Err(TestError::Diagnostics(diagnostics)) => {
                assert_error_contains(&diagnostics, "Missing required attribute");
                assert_eq!(diagnostics[0].attribute, Some(AttributePath::attribute("name")));
            },
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_tester_lifecycle_create() {
        let tester = tester();
        let state = tester
            .lifecycle_create("cloud_bucket", json!({"name": "logs"}))
            .await
            .unwrap();

        assert_eq!(state.get_or_null("id").as_str(), Some("bucket-logs"));
        assert_eq!(state.get_or_null("region").as_str(), Some("eu-west-1"));
    }

    #[tokio::test]
    async fn test_tester_lifecycle_crud() {
        let tester = tester();
        let final_state = tester
            .lifecycle_crud(
                "cloud_bucket",
                json!({"name": "logs"}),
                json!({"name": "logs", "versioning": true}),
            )
            .await
            .unwrap();

        assert_eq!(final_state.get_or_null("versioning"), &crate::AttributeValue::bool(true));
        assert_eq!(final_state.get_or_null("id").as_str(), Some("bucket-logs"));
    }

    #[tokio::test]
    async fn test_tester_lifecycle_replacement() {
        let tester = tester();
        let created = tester
            .lifecycle_create("cloud_bucket", json!({"name": "logs"}))
            .await
            .unwrap();
        let replaced = tester
            .lifecycle_update("cloud_bucket", &created, json!({"name": "audit"}))
            .await
            .unwrap();

        assert_eq!(replaced.get_or_null("id").as_str(), Some("bucket-audit"));
        assert!(tester.read("cloud_bucket", &created).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_tester_import_unsupported() {
        let tester = tester();
        let err = tester.import_resource("cloud_bucket", "bucket-logs").await.unwrap_err();
        assert!(matches!(err, ProviderError::Unimplemented(_)));
    }

    #[test]
    fn test_assert_no_errors() {
        let diagnostics = vec![Diagnostic::warning("Just a warning")];
        assert_no_errors(&diagnostics);
    }

    #[test]
    #[should_panic(expected = "Expected no errors")]
    fn test_assert_no_errors_fails() {
        let diagnostics = vec![Diagnostic::error("An error")];
        assert_no_errors(&diagnostics);
    }

    #[test]
    fn test_assert_has_errors() {
        let diagnostics = vec![Diagnostic::error("An error")];
        assert_has_errors(&diagnostics);
    }

    #[test]
    fn test_assert_error_contains() {
        let diagnostics = vec![Diagnostic::error("Invalid configuration value")];
        assert_error_contains(&diagnostics, "Invalid");
        assert_error_contains(&diagnostics, "configuration");
    }

    #[test]
    fn test_test_error_display() {
        let err = TestError::Diagnostics(vec![
            Diagnostic::error("First error").with_attribute(AttributePath::attribute("field1")),
            Diagnostic::error("Second error").with_detail("More info"),
        ]);

        let display = format!("{}", err);
        assert!(display.contains("First error"));
        assert!(display.contains("Second error"));
        assert!(display.contains("field1"));
        assert!(display.contains("More info"));
    }

    #[test]
    fn test_test_error_wraps_provider_error() {
        fn failing() -> Result<(), TestError> {
            Err(ProviderError::NotFound("net-1".to_string()))?;
            Ok(())
        }

        let err = failing().unwrap_err();
        assert!(matches!(err, TestError::Provider(ProviderError::NotFound(_))));
        assert!(err.to_string().starts_with("Provider error: "));
        assert!(std::error::Error::source(&err).is_some());
        assert!(std::error::Error::source(&TestError::Diagnostics(vec![])).is_none());
    }
}
