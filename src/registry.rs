//! Resource type registry.
//!
//! Typed resources are registered under a Terraform type name together with
//! a [`ResourceProvider`] that performs the real work. The registry erases the
//! types so the service can dispatch any call by name alone.

use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;

use crate::codec;
use crate::error::{ProviderError, RegistrationError};
use crate::reflect::{Resource, SchemaReflector};
use crate::schema::ResourceSchema;
use crate::value::ResourceState;

/// Lifecycle operations for one typed resource.
///
/// Implement this trait for each resource type your provider manages.
///
/// # Example
///
/// ```
/// use async_trait::async_trait;
/// use serde::{Deserialize, Serialize};
/// use tfplugin_sdk::{Attribute, ProviderError, Resource, ResourceProvider, SchemaBuilder};
///
/// #[derive(Clone, Serialize, Deserialize)]
/// struct Bucket {
///     id: Option<String>,
///     name: String,
/// }
///
/// impl Resource for Bucket {
///     fn describe(schema: SchemaBuilder) -> SchemaBuilder {
///         schema.attribute("name", Attribute::required_string().with_forces_replacement())
///     }
/// }
///
/// struct BucketProvider;
///
/// #[async_trait]
/// impl ResourceProvider<Bucket> for BucketProvider {
///     async fn create(&self, planned: Bucket) -> Result<Bucket, ProviderError> {
///         Ok(Bucket { id: Some(planned.name.clone()), ..planned })
///     }
///
///     async fn read(&self, current: Bucket) -> Result<Option<Bucket>, ProviderError> {
///         Ok(Some(current))
///     }
///
///     async fn update(&self, _prior: Bucket, planned: Bucket) -> Result<Bucket, ProviderError> {
///         Ok(planned)
///     }
///
///     async fn delete(&self, _current: Bucket) -> Result<(), ProviderError> {
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait ResourceProvider<R: Resource>: Send + Sync + 'static {
    /// Create the resource and return its state, with computed attributes filled in.
    async fn create(&self, planned: R) -> Result<R, ProviderError>;

    /// Refresh the resource. Return `None` if it no longer exists.
    async fn read(&self, current: R) -> Result<Option<R>, ProviderError>;

    /// Update the resource in place.
    async fn update(&self, prior: R, planned: R) -> Result<R, ProviderError>;

    /// Delete the resource.
    async fn delete(&self, current: R) -> Result<(), ProviderError>;

    /// Import existing resources by identifier.
    ///
    /// Default implementation returns an error indicating import is not supported.
    async fn import(&self, id: &str) -> Result<Vec<R>, ProviderError> {
        let _ = id;
        Err(ProviderError::Unimplemented(
            "Import is not supported for this resource type".to_string(),
        ))
    }
}

/// Type-erased view of a [`ResourceProvider`].
#[async_trait]
pub(crate) trait ResourceHandler: Send + Sync {
    async fn create(&self, schema: &ResourceSchema, planned: &ResourceState) -> Result<ResourceState, ProviderError>;

    async fn read(
        &self,
        schema: &ResourceSchema,
        current: &ResourceState,
    ) -> Result<Option<ResourceState>, ProviderError>;

    async fn update(
        &self,
        schema: &ResourceSchema,
        prior: &ResourceState,
        planned: &ResourceState,
    ) -> Result<ResourceState, ProviderError>;

    async fn delete(&self, schema: &ResourceSchema, current: &ResourceState) -> Result<(), ProviderError>;

    async fn import(&self, schema: &ResourceSchema, id: &str) -> Result<Vec<ResourceState>, ProviderError>;
}

struct TypedHandler<R, P> {
    provider: P,
    _resource: PhantomData<fn() -> R>,
}

fn to_typed<R: Resource>(state: &ResourceState) -> Result<R, ProviderError> {
    Ok(serde_json::from_value(codec::to_json(state))?)
}

fn from_typed<R: Resource>(schema: &ResourceSchema, resource: &R) -> Result<ResourceState, ProviderError> {
    Ok(codec::from_json(schema, &serde_json::to_value(resource)?)?)
}

/// Convert the result of a call that has already changed the real resource.
///
/// A conversion failure here must not lose the resource, so it is reported as
/// a partial failure carrying whatever JSON could be produced.
fn settled<R: Resource>(schema: &ResourceSchema, resource: &R) -> Result<ResourceState, ProviderError> {
    let json = serde_json::to_value(resource).map_err(|err| ProviderError::Partial {
        message: format!("Resource state could not be serialized: {}", err),
        state: serde_json::Value::Null,
    })?;
    codec::from_json(schema, &json).map_err(|err| ProviderError::Partial {
        message: format!("Resource state does not match the schema: {}", err),
        state: json,
    })
}

#[async_trait]
impl<R: Resource, P: ResourceProvider<R>> ResourceHandler for TypedHandler<R, P> {
    async fn create(&self, schema: &ResourceSchema, planned: &ResourceState) -> Result<ResourceState, ProviderError> {
        let created = self.provider.create(to_typed(planned)?).await?;
        settled(schema, &created)
    }

    async fn read(
        &self,
        schema: &ResourceSchema,
        current: &ResourceState,
    ) -> Result<Option<ResourceState>, ProviderError> {
        match self.provider.read(to_typed(current)?).await? {
            Some(resource) => from_typed(schema, &resource).map(Some),
            None => Ok(None),
        }
    }

    async fn update(
        &self,
        schema: &ResourceSchema,
        prior: &ResourceState,
        planned: &ResourceState,
    ) -> Result<ResourceState, ProviderError> {
        let updated = self
            .provider
            .update(to_typed(prior)?, to_typed(planned)?)
            .await?;
        settled(schema, &updated)
    }

    async fn delete(&self, _schema: &ResourceSchema, current: &ResourceState) -> Result<(), ProviderError> {
        self.provider.delete(to_typed(current)?).await
    }

    async fn import(&self, schema: &ResourceSchema, id: &str) -> Result<Vec<ResourceState>, ProviderError> {
        self.provider
            .import(id)
            .await?
            .iter()
            .map(|resource| from_typed(schema, resource))
            .collect()
    }
}

/// A registered resource type.
#[derive(Clone)]
pub struct RegistryEntry {
    name: String,
    schema: Arc<ResourceSchema>,
    handler: Arc<dyn ResourceHandler>,
}

impl RegistryEntry {
    /// The Terraform type name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The resource schema.
    pub fn schema(&self) -> &Arc<ResourceSchema> {
        &self.schema
    }

    pub(crate) fn handler(&self) -> &dyn ResourceHandler {
        self.handler.as_ref()
    }
}

impl std::fmt::Debug for RegistryEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryEntry")
            .field("name", &self.name)
            .field("schema", &self.schema)
            .finish_non_exhaustive()
    }
}

/// The set of resource types a provider serves.
///
/// Registration happens before serving; the service takes ownership of the
/// registry, after which it is only read.
#[derive(Debug, Default)]
pub struct ResourceRegistry {
    reflector: Arc<SchemaReflector>,
    entries: BTreeMap<String, RegistryEntry>,
}

impl ResourceRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry that shares a schema cache with others.
    pub fn with_reflector(reflector: Arc<SchemaReflector>) -> Self {
        Self {
            reflector,
            entries: BTreeMap::new(),
        }
    }

    /// Register resource type `R` under `name`.
    ///
    /// The first registration of a name wins; later ones fail and leave the
    /// registry unchanged.
    pub fn register<R, P>(&mut self, name: impl Into<String>, provider: P) -> Result<(), RegistrationError>
    where
        R: Resource,
        P: ResourceProvider<R>,
    {
        let name = name.into();
        if name.is_empty() {
            return Err(RegistrationError::EmptyName);
        }
        if self.entries.contains_key(&name) {
            return Err(RegistrationError::Duplicate(name));
        }

        let schema = self
            .reflector
            .schema_for::<R>()
            .map_err(|source| RegistrationError::Schema {
                name: name.clone(),
                source,
            })?;

        tracing::debug!(resource_type = %name, attributes = schema.len(), "Registered resource type");
        let entry = RegistryEntry {
            name: name.clone(),
            schema,
            handler: Arc::new(TypedHandler {
                provider,
                _resource: PhantomData,
            }),
        };
        self.entries.insert(name, entry);
        Ok(())
    }

    /// Builder-style variant of [`ResourceRegistry::register`].
    pub fn with_resource<R, P>(mut self, name: impl Into<String>, provider: P) -> Result<Self, RegistrationError>
    where
        R: Resource,
        P: ResourceProvider<R>,
    {
        self.register::<R, P>(name, provider)?;
        Ok(self)
    }

    /// Look up a resource type by name.
    pub fn resolve(&self, name: &str) -> Result<&RegistryEntry, ProviderError> {
        self.entries
            .get(name)
            .ok_or_else(|| ProviderError::UnknownResource(name.to_string()))
    }

    /// All registered entries, ordered by name.
    pub fn entries(&self) -> impl Iterator<Item = &RegistryEntry> {
        self.entries.values()
    }

    /// All registered type names, ordered.
    pub fn resource_types(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    /// Number of registered resource types.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SchemaError;
    use crate::schema::{Attribute, SchemaBuilder};
    use crate::value::AttributeValue;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Note {
        id: Option<String>,
        text: String,
    }

    impl Resource for Note {
        fn describe(schema: SchemaBuilder) -> SchemaBuilder {
            schema.attribute("text", Attribute::required_string())
        }
    }

    #[derive(Serialize, Deserialize)]
    struct BadNote {
        text: String,
    }

    impl Resource for BadNote {
        fn describe(schema: SchemaBuilder) -> SchemaBuilder {
            schema.attribute("Text", Attribute::required_string())
        }
    }

    struct NoteProvider;

    #[async_trait]
    impl ResourceProvider<Note> for NoteProvider {
        async fn create(&self, planned: Note) -> Result<Note, ProviderError> {
            Ok(Note {
                id: Some(format!("note-{}", planned.text.len())),
                ..planned
            })
        }

        async fn read(&self, current: Note) -> Result<Option<Note>, ProviderError> {
            Ok(Some(current))
        }

        async fn update(&self, _prior: Note, planned: Note) -> Result<Note, ProviderError> {
            Ok(planned)
        }

        async fn delete(&self, _current: Note) -> Result<(), ProviderError> {
            Ok(())
        }
    }

    struct BadNoteProvider;

    #[async_trait]
    impl ResourceProvider<BadNote> for BadNoteProvider {
        async fn create(&self, planned: BadNote) -> Result<BadNote, ProviderError> {
            Ok(planned)
        }

        async fn read(&self, current: BadNote) -> Result<Option<BadNote>, ProviderError> {
            Ok(Some(current))
        }

        async fn update(&self, _prior: BadNote, planned: BadNote) -> Result<BadNote, ProviderError> {
            Ok(planned)
        }

        async fn delete(&self, _current: BadNote) -> Result<(), ProviderError> {
            Ok(())
        }
    }

    #[test]
    fn test_register_and_resolve() {
        let mut registry = ResourceRegistry::new();
        registry.register::<Note, _>("demo_note", NoteProvider).unwrap();

        let entry = registry.resolve("demo_note").unwrap();
        assert_eq!(entry.name(), "demo_note");
        assert!(entry.schema().attribute("text").is_some());
        assert_eq!(registry.resource_types(), vec!["demo_note".to_string()]);
    }

    #[test]
    fn test_duplicate_registration_keeps_first() {
        let mut registry = ResourceRegistry::new();
        registry.register::<Note, _>("demo_note", NoteProvider).unwrap();
        let err = registry.register::<Note, _>("demo_note", NoteProvider).unwrap_err();

        assert_eq!(err, RegistrationError::Duplicate("demo_note".to_string()));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_empty_name_rejected() {
        let err = ResourceRegistry::new()
            .with_resource::<Note, _>("", NoteProvider)
            .unwrap_err();
        assert_eq!(err, RegistrationError::EmptyName);
    }

    #[test]
    fn test_invalid_schema_rejected() {
        let mut registry = ResourceRegistry::new();
        let err = registry.register::<BadNote, _>("demo_bad", BadNoteProvider).unwrap_err();
        assert!(matches!(err, RegistrationError::Schema { name, .. } if name == "demo_bad"));
        assert!(registry.is_empty());
    }

    #[derive(Serialize, Deserialize)]
    struct TaggedNote {
        id: Option<String>,
        text: String,
        tag: String,
    }

    impl Resource for TaggedNote {
        fn describe(schema: SchemaBuilder) -> SchemaBuilder {
            schema.attribute("text", Attribute::required_string())
        }
    }

    struct TaggedNoteProvider;

    #[async_trait]
    impl ResourceProvider<TaggedNote> for TaggedNoteProvider {
        async fn create(&self, planned: TaggedNote) -> Result<TaggedNote, ProviderError> {
            Ok(planned)
        }

        async fn read(&self, current: TaggedNote) -> Result<Option<TaggedNote>, ProviderError> {
            Ok(Some(current))
        }

        async fn update(&self, _prior: TaggedNote, planned: TaggedNote) -> Result<TaggedNote, ProviderError> {
            Ok(planned)
        }

        async fn delete(&self, _current: TaggedNote) -> Result<(), ProviderError> {
            Ok(())
        }
    }

    #[test]
    fn test_field_outside_schema_rejected() {
        let mut registry = ResourceRegistry::new();
        let err = registry
            .register::<TaggedNote, _>("demo_tagged", TaggedNoteProvider)
            .unwrap_err();
        assert_eq!(
            err,
            RegistrationError::Schema {
                name: "demo_tagged".to_string(),
                source: SchemaError::UndeclaredField("tag".to_string()),
            }
        );
        assert!(registry.is_empty());
    }

    #[test]
    fn test_resolve_unknown() {
        let registry = ResourceRegistry::new();
        let err = registry.resolve("missing").unwrap_err();
        assert!(matches!(err, ProviderError::UnknownResource(name) if name == "missing"));
    }

    #[tokio::test]
    async fn test_handler_round_trips_through_typed_model() {
        let registry = ResourceRegistry::new()
            .with_resource::<Note, _>("demo_note", NoteProvider)
            .unwrap();
        let entry = registry.resolve("demo_note").unwrap();
        let planned = ResourceState::new()
            .with("id", AttributeValue::Unknown)
            .with("text", "hello");

        let created = tokio_test::assert_ok!(entry.handler().create(entry.schema(), &planned).await);
        assert_eq!(created.get_or_null("id").as_str(), Some("note-5"));
        assert_eq!(created.get_or_null("text").as_str(), Some("hello"));

        let err = tokio_test::assert_err!(entry.handler().import(entry.schema(), "note-5").await);
        assert!(matches!(err, ProviderError::Unimplemented(_)));
    }
}
