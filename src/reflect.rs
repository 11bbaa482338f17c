//! Schema reflection for typed resources.
//!
//! A [`Resource`] is a plain serde type that describes its own schema. The
//! [`SchemaReflector`] builds that schema once per type and hands out shared
//! copies afterwards. Before a schema is cached, the type's serde field names
//! are traced and compared with the schema's attribute names.

use std::any::{type_name, TypeId};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::de::{DeserializeOwned, Visitor};
use serde::{Deserializer, Serialize};

use crate::error::SchemaError;
use crate::schema::{ResourceSchema, SchemaBuilder};

/// A typed resource model.
///
/// The serde representation of the type must use the same field names as the
/// schema it describes; the SDK converts between the two through JSON.
///
/// # Example
///
/// ```
/// use serde::{Deserialize, Serialize};
/// use tfplugin_sdk::{Attribute, Resource, SchemaBuilder};
///
/// #[derive(Serialize, Deserialize)]
/// struct File {
///     id: Option<String>,
///     path: String,
///     content: String,
/// }
///
/// impl Resource for File {
///     fn describe(schema: SchemaBuilder) -> SchemaBuilder {
///         schema
///             .attribute("path", Attribute::required_string().with_forces_replacement())
///             .attribute("content", Attribute::required_string())
///     }
/// }
/// ```
pub trait Resource: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Add this type's attributes to the schema builder.
    fn describe(schema: SchemaBuilder) -> SchemaBuilder;
}

/// Builds and caches resource schemas by type.
///
/// Lookups take a shared read lock. A miss builds the schema outside any lock,
/// then publishes it under the write lock unless another caller got there
/// first, so every caller observes the same schema instance.
#[derive(Debug, Default)]
pub struct SchemaReflector {
    cache: RwLock<HashMap<TypeId, Arc<ResourceSchema>>>,
}

impl SchemaReflector {
    /// Create an empty reflector.
    pub fn new() -> Self {
        Self::default()
    }

    /// The schema for resource type `R`.
    pub fn schema_for<R: Resource>(&self) -> Result<Arc<ResourceSchema>, SchemaError> {
        let key = TypeId::of::<R>();
        if let Some(schema) = self.cache.read().get(&key) {
            return Ok(Arc::clone(schema));
        }

        let built = Arc::new(R::describe(SchemaBuilder::new()).build()?);
        if built.identifier.is_none() {
            return Err(SchemaError::MissingIdentifier);
        }
        check_fields::<R>(&built)?;
        tracing::debug!(
            resource = type_name::<R>(),
            attributes = built.len(),
            "Reflected resource schema"
        );

        let mut cache = self.cache.write();
        Ok(Arc::clone(cache.entry(key).or_insert(built)))
    }

    /// Number of cached schemas.
    pub fn len(&self) -> usize {
        self.cache.read().len()
    }

    /// Whether nothing has been reflected yet.
    pub fn is_empty(&self) -> bool {
        self.cache.read().is_empty()
    }
}

/// The field names `R` deserializes from, as its serde derive declares them.
///
/// `None` when the type is not deserialized as a struct, which includes
/// structs using `#[serde(flatten)]`.
pub fn serde_fields<R: DeserializeOwned>() -> Option<&'static [&'static str]> {
    let mut trace = FieldTrace { fields: None };
    let _ = R::deserialize(&mut trace);
    trace.fields
}

fn check_fields<R: Resource>(schema: &ResourceSchema) -> Result<(), SchemaError> {
    let fields: BTreeSet<&str> = serde_fields::<R>()
        .ok_or_else(|| SchemaError::NotAStruct(type_name::<R>().to_string()))?
        .iter()
        .copied()
        .collect();

    if let Some(field) = fields.iter().find(|field| schema.attribute(field).is_none()) {
        return Err(SchemaError::UndeclaredField(field.to_string()));
    }
    if let Some(attr) = schema.attributes().iter().find(|a| !fields.contains(a.name.as_str())) {
        return Err(SchemaError::MissingField(attr.name.clone()));
    }
    Ok(())
}

/// A deserializer that records the field list a derived struct asks for,
/// then stops.
struct FieldTrace {
    fields: Option<&'static [&'static str]>,
}

#[derive(Debug)]
struct TraceStopped;

impl fmt::Display for TraceStopped {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("field trace stopped")
    }
}

impl std::error::Error for TraceStopped {}

impl serde::de::Error for TraceStopped {
    fn custom<T: fmt::Display>(_msg: T) -> Self {
        TraceStopped
    }
}

impl<'de> Deserializer<'de> for &mut FieldTrace {
    type Error = TraceStopped;

    fn deserialize_any<V: Visitor<'de>>(self, _visitor: V) -> Result<V::Value, Self::Error> {
        Err(TraceStopped)
    }

    fn deserialize_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        fields: &'static [&'static str],
        _visitor: V,
    ) -> Result<V::Value, Self::Error> {
        self.fields = Some(fields);
        Err(TraceStopped)
    }

    serde::forward_to_deserialize_any! {
        bool i8 i16 i32 i64 u8 u16 u32 u64 f32 f64 char str string bytes byte_buf
        option unit unit_struct newtype_struct seq tuple tuple_struct map enum
        identifier ignored_any
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Attribute;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize)]
    struct Bucket {
        id: Option<String>,
        name: String,
    }

    impl Resource for Bucket {
        fn describe(schema: SchemaBuilder) -> SchemaBuilder {
            schema.attribute("name", Attribute::required_string().with_forces_replacement())
        }
    }

    #[derive(Serialize, Deserialize)]
    struct Broken {
        name: String,
    }

    impl Resource for Broken {
        fn describe(schema: SchemaBuilder) -> SchemaBuilder {
            schema
                .attribute("name", Attribute::required_string())
                .attribute("name", Attribute::optional_string())
        }
    }

    #[derive(Serialize, Deserialize)]
    struct Disk {
        id: Option<String>,
        size: i64,
        zone: String,
    }

    impl Resource for Disk {
        fn describe(schema: SchemaBuilder) -> SchemaBuilder {
            schema.attribute("size", Attribute::required_int())
        }
    }

    #[derive(Serialize, Deserialize)]
    struct Volume {
        id: Option<String>,
        #[serde(rename = "capacity")]
        size: i64,
    }

    impl Resource for Volume {
        fn describe(schema: SchemaBuilder) -> SchemaBuilder {
            schema.attribute("size", Attribute::required_int())
        }
    }

    #[derive(Serialize, Deserialize)]
    struct Snapshot {
        #[serde(rename = "id")]
        snapshot_id: Option<String>,
        #[serde(default)]
        source: String,
    }

    impl Resource for Snapshot {
        fn describe(schema: SchemaBuilder) -> SchemaBuilder {
            schema.attribute("source", Attribute::required_string())
        }
    }

    #[test]
    fn test_serde_fields_follow_renames() {
        assert_eq!(serde_fields::<Volume>(), Some(&["id", "capacity"][..]));
        assert_eq!(serde_fields::<Snapshot>(), Some(&["id", "source"][..]));
        assert_eq!(serde_fields::<String>(), None);
    }

    #[test]
    fn test_field_shape_must_match_schema() {
        let reflector = SchemaReflector::new();

        let err = reflector.schema_for::<Disk>().unwrap_err();
        assert_eq!(err, SchemaError::UndeclaredField("zone".to_string()));

        let err = reflector.schema_for::<Volume>().unwrap_err();
        assert_eq!(err, SchemaError::UndeclaredField("capacity".to_string()));

        let err = reflector.schema_for::<Broken>().unwrap_err();
        assert!(matches!(err, SchemaError::DuplicateAttribute(_)));

        assert!(reflector.schema_for::<Snapshot>().is_ok());
        assert_eq!(reflector.len(), 1);
    }

    #[test]
    fn test_schema_is_cached() {
        let reflector = SchemaReflector::new();
        let first = reflector.schema_for::<Bucket>().unwrap();
        let second = reflector.schema_for::<Bucket>().unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(reflector.len(), 1);
        assert!(first.attribute("name").unwrap().forces_replacement());
        assert!(first.attribute("id").unwrap().is_computed());
    }

    #[test]
    fn test_invalid_schema_is_not_cached() {
        let reflector = SchemaReflector::new();
        let err = reflector.schema_for::<Broken>().unwrap_err();
        assert_eq!(err, SchemaError::DuplicateAttribute("name".to_string()));
        assert!(reflector.is_empty());
    }

    #[test]
    fn test_concurrent_reflection_yields_one_instance() {
        let reflector = Arc::new(SchemaReflector::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let reflector = Arc::clone(&reflector);
                std::thread::spawn(move || reflector.schema_for::<Bucket>().unwrap())
            })
            .collect();

        let schemas: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        for schema in &schemas[1..] {
            assert!(Arc::ptr_eq(&schemas[0], schema));
        }
        assert_eq!(reflector.len(), 1);
    }
}
