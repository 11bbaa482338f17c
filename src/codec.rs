//! Wire codec for resource states.
//!
//! Terraform exchanges object values as msgpack maps keyed by attribute name.
//! Absent values are msgpack `nil`; values that are not yet known are the
//! extension value `d4 00 00` (fixext1, type 0, one zero byte). Decoding is
//! schema-directed and strict: every attribute the schema declares must be
//! present and nothing else may be.
//!
//! The JSON bridge (`to_json` / `from_json`) converts states to and from the
//! serde representation used by typed resources and by legacy raw state.

use std::collections::BTreeMap;

use rmp::decode;
use rmp::encode as enc;
use rmp::Marker;
use serde_json::{Map as JsonMap, Number, Value as Json};

use crate::error::CodecError;
use crate::schema::{AttributeKind, AttributePath, ResourceSchema, ScalarKind};
use crate::value::{AttributeValue, ResourceState, Value};

/// msgpack extension type Terraform uses for unknown values.
pub const UNKNOWN_EXT_TYPE: i8 = 0;

/// Extension type for unknown values that carry refinements.
const REFINED_UNKNOWN_EXT_TYPE: i8 = 12;

/// Encode a state as a msgpack map in schema attribute order.
pub fn encode(schema: &ResourceSchema, state: &ResourceState) -> Result<Vec<u8>, CodecError> {
    if let Some((name, _)) = state.iter().find(|(name, _)| schema.attribute(name).is_none()) {
        return Err(CodecError::UnexpectedAttribute(name.clone()));
    }

    let mut buf = Vec::new();
    enc::write_map_len(&mut buf, len_u32(schema.len())?).map_err(write_err)?;
    for attr in schema.attributes() {
        let value = state
            .get(&attr.name)
            .ok_or_else(|| CodecError::MissingAttribute(attr.name.clone()))?;
        enc::write_str(&mut buf, &attr.name).map_err(write_err)?;
        write_value(&mut buf, attr.kind(), value, &AttributePath::attribute(&attr.name))?;
    }
    Ok(buf)
}

/// Encode an optional state; `None` becomes msgpack `nil`.
pub fn encode_optional(
    schema: &ResourceSchema,
    state: Option<&ResourceState>,
) -> Result<Vec<u8>, CodecError> {
    match state {
        Some(state) => encode(schema, state),
        None => {
            let mut buf = Vec::new();
            enc::write_nil(&mut buf).map_err(write_err)?;
            Ok(buf)
        },
    }
}

/// Decode a msgpack state that must be present.
pub fn decode(schema: &ResourceSchema, bytes: &[u8]) -> Result<ResourceState, CodecError> {
    decode_optional(schema, bytes)?.ok_or(CodecError::NotAnObject)
}

/// Decode a msgpack state; an empty payload or top-level `nil` is `None`.
pub fn decode_optional(
    schema: &ResourceSchema,
    bytes: &[u8],
) -> Result<Option<ResourceState>, CodecError> {
    if bytes.is_empty() {
        return Ok(None);
    }

    let mut reader = Reader::new(bytes);
    let len = match reader.peek()? {
        Marker::Null => {
            decode::read_nil(&mut reader.rd).map_err(read_err)?;
            reader.finish()?;
            return Ok(None);
        },
        Marker::FixMap(_) | Marker::Map16 | Marker::Map32 => reader.map_len()?,
        _ => return Err(CodecError::NotAnObject),
    };

    let mut values = BTreeMap::new();
    for _ in 0..len {
        let name = reader.key()?;
        let attr = schema
            .attribute(&name)
            .ok_or_else(|| CodecError::UnexpectedAttribute(name.clone()))?;
        let value = reader.value(attr.kind(), &AttributePath::attribute(&name))?;
        if values.insert(name.clone(), value).is_some() {
            return Err(CodecError::DuplicateAttribute(name));
        }
    }
    reader.finish()?;

    if let Some(attr) = schema.attributes().iter().find(|a| !values.contains_key(&a.name)) {
        return Err(CodecError::MissingAttribute(attr.name.clone()));
    }
    Ok(Some(values.into_iter().collect()))
}

/// Decode a JSON state; an empty payload or `null` is `None`.
pub fn decode_json(
    schema: &ResourceSchema,
    bytes: &[u8],
) -> Result<Option<ResourceState>, CodecError> {
    if bytes.is_empty() {
        return Ok(None);
    }
    match serde_json::from_slice::<Json>(bytes)? {
        Json::Null => Ok(None),
        json => from_json(schema, &json).map(Some),
    }
}

/// Convert a state to JSON. Unknown values become `null`.
pub fn to_json(state: &ResourceState) -> Json {
    Json::Object(
        state
            .iter()
            .map(|(name, value)| (name.clone(), value_to_json(value)))
            .collect(),
    )
}

/// Convert a JSON object to a state. Absent or `null` fields are `Null`.
pub fn from_json(schema: &ResourceSchema, json: &Json) -> Result<ResourceState, CodecError> {
    let object = json.as_object().ok_or(CodecError::NotAnObject)?;
    if let Some(name) = object.keys().find(|name| schema.attribute(name).is_none()) {
        return Err(CodecError::UnexpectedAttribute(name.clone()));
    }

    schema
        .attributes()
        .iter()
        .map(|attr| {
            let value = match object.get(&attr.name) {
                None | Some(Json::Null) => AttributeValue::Null,
                Some(json) => json_to_value(attr.kind(), json, &AttributePath::attribute(&attr.name))?,
            };
            Ok((attr.name.clone(), value))
        })
        .collect()
}

/// Best-effort conversion of the JSON state of a resource that exists but
/// does not match its schema.
///
/// Attributes that are absent or cannot be read take their value from
/// `fallback`. Unknown values become null, since an applied state must be
/// wholly known. Returns `None` when `json` is not an object and there is no
/// fallback.
pub fn from_json_lossy(
    schema: &ResourceSchema,
    json: &Json,
    fallback: Option<&ResourceState>,
) -> Option<ResourceState> {
    let object = json.as_object();
    if object.is_none() && fallback.is_none() {
        return None;
    }

    let state = schema
        .attributes()
        .iter()
        .map(|attr| {
            let read = object
                .and_then(|object| object.get(&attr.name))
                .and_then(|json| json_to_value(attr.kind(), json, &AttributePath::attribute(&attr.name)).ok())
                .filter(|value| !value.is_null());
            let value = read
                .or_else(|| fallback.map(|state| state.get_or_null(&attr.name).clone()))
                .filter(|value| !value.contains_unknown())
                .unwrap_or(AttributeValue::Null);
            (attr.name.clone(), value)
        })
        .collect();
    Some(state)
}

fn write_err(err: impl std::fmt::Display) -> CodecError {
    CodecError::Encode(err.to_string())
}

fn len_u32(len: usize) -> Result<u32, CodecError> {
    u32::try_from(len).map_err(|_| CodecError::Encode(format!("length {} exceeds msgpack limits", len)))
}

fn mismatch(kind: &AttributeKind, path: &AttributePath) -> CodecError {
    CodecError::TypeMismatch {
        path: path.clone(),
        expected: kind.describe(),
    }
}

fn write_value(
    buf: &mut Vec<u8>,
    kind: &AttributeKind,
    value: &AttributeValue,
    path: &AttributePath,
) -> Result<(), CodecError> {
    let known = match value {
        AttributeValue::Null => return enc::write_nil(buf).map_err(write_err),
        AttributeValue::Unknown => {
            enc::write_ext_meta(buf, 1, UNKNOWN_EXT_TYPE).map_err(write_err)?;
            buf.push(0);
            return Ok(());
        },
        AttributeValue::Known(known) => known,
    };

    match (kind, known) {
        (AttributeKind::Scalar(ScalarKind::String), Value::String(s)) => {
            enc::write_str(buf, s).map_err(write_err)
        },
        (AttributeKind::Scalar(ScalarKind::Int), Value::Int(i)) => {
            enc::write_sint(buf, *i).map(|_| ()).map_err(write_err)
        },
        (AttributeKind::Scalar(ScalarKind::Float), Value::Float(f)) => {
            enc::write_f64(buf, *f).map_err(write_err)
        },
        (AttributeKind::Scalar(ScalarKind::Bool), Value::Bool(b)) => {
            enc::write_bool(buf, *b).map_err(write_err)
        },
        (AttributeKind::List(element), Value::List(items)) => {
            enc::write_array_len(buf, len_u32(items.len())?).map_err(write_err)?;
            for (i, item) in items.iter().enumerate() {
                write_value(buf, element, item, &path.index(i))?;
            }
            Ok(())
        },
        (AttributeKind::Map(element), Value::Map(entries)) => {
            enc::write_map_len(buf, len_u32(entries.len())?).map_err(write_err)?;
            for (key, item) in entries {
                enc::write_str(buf, key).map_err(write_err)?;
                write_value(buf, element, item, &path.key(key.clone()))?;
            }
            Ok(())
        },
        _ => Err(mismatch(kind, path)),
    }
}

/// A decoded msgpack number before it is narrowed to the attribute kind.
enum Numeric {
    Signed(i64),
    Unsigned(u64),
    Float(f64),
}

fn read_err(err: impl std::fmt::Display) -> CodecError {
    CodecError::Malformed(err.to_string())
}

/// Schema-directed reader over `rmp::decode`. The next marker is peeked so
/// that nil and unknown can be told apart from the attribute's own kind.
struct Reader<'a> {
    rd: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(rd: &'a [u8]) -> Self {
        Self { rd }
    }

    fn peek(&self) -> Result<Marker, CodecError> {
        self.rd
            .first()
            .map(|b| Marker::from_u8(*b))
            .ok_or_else(|| CodecError::Malformed("unexpected end of input".to_string()))
    }

    fn finish(&self) -> Result<(), CodecError> {
        match self.rd.len() {
            0 => Ok(()),
            n => Err(CodecError::TrailingBytes(n)),
        }
    }

    fn map_len(&mut self) -> Result<usize, CodecError> {
        decode::read_map_len(&mut self.rd).map(|n| n as usize).map_err(read_err)
    }

    fn array_len(&mut self) -> Result<usize, CodecError> {
        decode::read_array_len(&mut self.rd).map(|n| n as usize).map_err(read_err)
    }

    fn string(&mut self) -> Result<String, CodecError> {
        let (s, rest) = decode::read_str_from_slice(self.rd).map_err(read_err)?;
        self.rd = rest;
        Ok(s.to_string())
    }

    fn key(&mut self) -> Result<String, CodecError> {
        match self.peek()? {
            Marker::FixStr(_) | Marker::Str8 | Marker::Str16 | Marker::Str32 => self.string(),
            _ => Err(CodecError::Malformed("map keys must be strings".to_string())),
        }
    }

    /// Consume an extension value, returning its type.
    fn ext(&mut self) -> Result<i8, CodecError> {
        let meta = decode::read_ext_meta(&mut self.rd).map_err(read_err)?;
        let size = meta.size as usize;
        if size > self.rd.len() {
            return Err(CodecError::Malformed("extension payload is truncated".to_string()));
        }
        self.rd = &self.rd[size..];
        Ok(meta.typeid)
    }

    fn number(&mut self, marker: Marker) -> Result<Option<Numeric>, CodecError> {
        Ok(Some(match marker {
            Marker::U64 => Numeric::Unsigned(decode::read_int(&mut self.rd).map_err(read_err)?),
            Marker::FixPos(_)
            | Marker::FixNeg(_)
            | Marker::U8
            | Marker::U16
            | Marker::U32
            | Marker::I8
            | Marker::I16
            | Marker::I32
            | Marker::I64 => Numeric::Signed(decode::read_int(&mut self.rd).map_err(read_err)?),
            Marker::F32 => Numeric::Float(f64::from(decode::read_f32(&mut self.rd).map_err(read_err)?)),
            Marker::F64 => Numeric::Float(decode::read_f64(&mut self.rd).map_err(read_err)?),
            _ => return Ok(None),
        }))
    }

    fn value(&mut self, kind: &AttributeKind, path: &AttributePath) -> Result<AttributeValue, CodecError> {
        let marker = self.peek()?;
        match marker {
            Marker::Null => {
                decode::read_nil(&mut self.rd).map_err(read_err)?;
                return Ok(AttributeValue::Null);
            },
            Marker::FixExt1
            | Marker::FixExt2
            | Marker::FixExt4
            | Marker::FixExt8
            | Marker::FixExt16
            | Marker::Ext8
            | Marker::Ext16
            | Marker::Ext32 => {
                return match self.ext()? {
                    UNKNOWN_EXT_TYPE | REFINED_UNKNOWN_EXT_TYPE => Ok(AttributeValue::Unknown),
                    other => Err(CodecError::Malformed(format!(
                        "unsupported extension type {} at '{}'",
                        other, path
                    ))),
                };
            },
            _ => {},
        }

        let value = match kind {
            AttributeKind::Scalar(ScalarKind::String) => match marker {
                Marker::FixStr(_) | Marker::Str8 | Marker::Str16 | Marker::Str32 => Value::String(self.string()?),
                _ => return Err(mismatch(kind, path)),
            },
            AttributeKind::Scalar(ScalarKind::Bool) => match marker {
                Marker::True | Marker::False => Value::Bool(decode::read_bool(&mut self.rd).map_err(read_err)?),
                _ => return Err(mismatch(kind, path)),
            },
            AttributeKind::Scalar(ScalarKind::Int) => Value::Int(self.int(marker, kind, path)?),
            AttributeKind::Scalar(ScalarKind::Float) => Value::Float(self.float(marker, kind, path)?),
            AttributeKind::List(element) => {
                if !matches!(marker, Marker::FixArray(_) | Marker::Array16 | Marker::Array32) {
                    return Err(mismatch(kind, path));
                }
                let len = self.array_len()?;
                let mut items = Vec::with_capacity(len.min(1024));
                for i in 0..len {
                    items.push(self.value(element, &path.index(i))?);
                }
                Value::List(items)
            },
            AttributeKind::Map(element) => {
                if !matches!(marker, Marker::FixMap(_) | Marker::Map16 | Marker::Map32) {
                    return Err(mismatch(kind, path));
                }
                let len = self.map_len()?;
                let mut entries = BTreeMap::new();
                for _ in 0..len {
                    let key = self.key()?;
                    let item = self.value(element, &path.key(key.clone()))?;
                    entries.insert(key, item);
                }
                Value::Map(entries)
            },
        };
        Ok(AttributeValue::Known(value))
    }

    /// Terraform encodes numbers that do not fit a msgpack number as decimal strings.
    fn numeric_string(&mut self, marker: Marker) -> Result<Option<String>, CodecError> {
        match marker {
            Marker::FixStr(_) | Marker::Str8 | Marker::Str16 | Marker::Str32 => self.string().map(Some),
            _ => Ok(None),
        }
    }

    fn int(&mut self, marker: Marker, kind: &AttributeKind, path: &AttributePath) -> Result<i64, CodecError> {
        match self.number(marker)? {
            Some(Numeric::Signed(i)) => Ok(i),
            Some(Numeric::Unsigned(u)) => i64::try_from(u).map_err(|_| mismatch(kind, path)),
            Some(Numeric::Float(f)) if f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64 => {
                Ok(f as i64)
            },
            Some(Numeric::Float(_)) => Err(mismatch(kind, path)),
            None => self
                .numeric_string(marker)?
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| mismatch(kind, path)),
        }
    }

    fn float(&mut self, marker: Marker, kind: &AttributeKind, path: &AttributePath) -> Result<f64, CodecError> {
        match self.number(marker)? {
            Some(Numeric::Signed(i)) => Ok(i as f64),
            Some(Numeric::Unsigned(u)) => Ok(u as f64),
            Some(Numeric::Float(f)) => Ok(f),
            None => self
                .numeric_string(marker)?
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| mismatch(kind, path)),
        }
    }
}

fn value_to_json(value: &AttributeValue) -> Json {
    match value {
        AttributeValue::Null | AttributeValue::Unknown => Json::Null,
        AttributeValue::Known(Value::String(s)) => Json::String(s.clone()),
        AttributeValue::Known(Value::Int(i)) => Json::Number((*i).into()),
        AttributeValue::Known(Value::Float(f)) => Number::from_f64(*f).map_or(Json::Null, Json::Number),
        AttributeValue::Known(Value::Bool(b)) => Json::Bool(*b),
        AttributeValue::Known(Value::List(items)) => Json::Array(items.iter().map(value_to_json).collect()),
        AttributeValue::Known(Value::Map(entries)) => Json::Object(
            entries
                .iter()
                .map(|(k, v)| (k.clone(), value_to_json(v)))
                .collect::<JsonMap<_, _>>(),
        ),
    }
}

fn json_to_value(kind: &AttributeKind, json: &Json, path: &AttributePath) -> Result<AttributeValue, CodecError> {
    if json.is_null() {
        return Ok(AttributeValue::Null);
    }
    let value = match (kind, json) {
        (AttributeKind::Scalar(ScalarKind::String), Json::String(s)) => Value::String(s.clone()),
        (AttributeKind::Scalar(ScalarKind::Bool), Json::Bool(b)) => Value::Bool(*b),
        (AttributeKind::Scalar(ScalarKind::Int), Json::Number(n)) => {
            let int = n.as_i64().or_else(|| {
                n.as_f64()
                    .filter(|f| f.fract() == 0.0 && *f >= i64::MIN as f64 && *f < i64::MAX as f64)
                    .map(|f| f as i64)
            });
            Value::Int(int.ok_or_else(|| mismatch(kind, path))?)
        },
        (AttributeKind::Scalar(ScalarKind::Float), Json::Number(n)) => {
            Value::Float(n.as_f64().ok_or_else(|| mismatch(kind, path))?)
        },
        (AttributeKind::List(element), Json::Array(items)) => Value::List(
            items
                .iter()
                .enumerate()
                .map(|(i, item)| json_to_value(element, item, &path.index(i)))
                .collect::<Result<_, _>>()?,
        ),
        (AttributeKind::Map(element), Json::Object(entries)) => Value::Map(
            entries
                .iter()
                .map(|(k, v)| Ok((k.clone(), json_to_value(element, v, &path.key(k.clone()))?)))
                .collect::<Result<_, CodecError>>()?,
        ),
        _ => return Err(mismatch(kind, path)),
    };
    Ok(AttributeValue::Known(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Attribute, SchemaBuilder};
    use proptest::prelude::*;
    use serde_json::json;

    fn file_schema() -> ResourceSchema {
        SchemaBuilder::new()
            .attribute("path", Attribute::required_string().with_forces_replacement())
            .attribute("content", Attribute::required_string())
            .build()
            .unwrap()
    }

    fn rich_schema() -> ResourceSchema {
        SchemaBuilder::new()
            .attribute("count", Attribute::optional_int())
            .attribute("ratio", Attribute::optional_float())
            .attribute("enabled", Attribute::optional_bool())
            .attribute("tags", Attribute::optional(AttributeKind::list(AttributeKind::STRING)))
            .attribute("labels", Attribute::optional(AttributeKind::map(AttributeKind::STRING)))
            .build()
            .unwrap()
    }

    #[test]
    fn test_unknown_encodes_as_extension() {
        let schema = SchemaBuilder::without_identifier()
            .attribute("a", Attribute::computed_string())
            .build()
            .unwrap();
        let state = ResourceState::new().with("a", AttributeValue::Unknown);

        let bytes = encode(&schema, &state).unwrap();
        // fixmap(1), fixstr "a", fixext1 type 0, payload 0
        assert_eq!(bytes, vec![0x81, 0xa1, b'a', 0xd4, 0x00, 0x00]);
    }

    #[test]
    fn test_tri_state_survives_round_trip() {
        let schema = file_schema();
        let state = ResourceState::new()
            .with("id", AttributeValue::Unknown)
            .with("path", AttributeValue::Null)
            .with("content", "hello");

        let decoded = decode(&schema, &encode(&schema, &state).unwrap()).unwrap();
        assert_eq!(decoded, state);
        assert!(decoded.get_or_null("id").is_unknown());
        assert!(decoded.get_or_null("path").is_null());
    }

    #[test]
    fn test_decode_rejects_extra_attribute() {
        let schema = SchemaBuilder::without_identifier()
            .attribute("a", Attribute::optional_string())
            .build()
            .unwrap();
        // {"a": nil, "b": nil}
        let bytes = [0x82, 0xa1, b'a', 0xc0, 0xa1, b'b', 0xc0];
        let err = decode(&schema, &bytes).unwrap_err();
        assert!(matches!(err, CodecError::UnexpectedAttribute(name) if name == "b"));
    }

    #[test]
    fn test_decode_rejects_missing_attribute() {
        let schema = file_schema();
        // {"id": nil}
        let bytes = [0x81, 0xa2, b'i', b'd', 0xc0];
        let err = decode(&schema, &bytes).unwrap_err();
        assert!(matches!(err, CodecError::MissingAttribute(name) if name == "path"));
    }

    #[test]
    fn test_encode_reports_type_mismatch_path() {
        let schema = rich_schema();
        let state = ResourceState::nulls(&schema).with("tags", AttributeValue::list([AttributeValue::int(3)]));
        let err = encode(&schema, &state).unwrap_err();
        match err {
            CodecError::TypeMismatch { path, expected } => {
                assert_eq!(path.to_string(), "tags.0");
                assert_eq!(expected, "string");
            },
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_decode_empty_and_nil_are_absent() {
        let schema = file_schema();
        assert_eq!(decode_optional(&schema, &[]).unwrap(), None);
        assert_eq!(decode_optional(&schema, &[0xc0]).unwrap(), None);
        assert!(matches!(decode(&schema, &[0xc0]), Err(CodecError::NotAnObject)));
        assert_eq!(encode_optional(&schema, None).unwrap(), vec![0xc0]);
    }

    #[test]
    fn test_decode_rejects_truncated_and_trailing() {
        let schema = SchemaBuilder::without_identifier()
            .attribute("a", Attribute::optional_string())
            .build()
            .unwrap();
        assert!(matches!(
            decode(&schema, &[0x81, 0xa1]),
            Err(CodecError::Malformed(_))
        ));
        assert!(matches!(
            decode(&schema, &[0x81, 0xa1, b'a', 0xc0, 0x00]),
            Err(CodecError::TrailingBytes(1))
        ));
    }

    #[test]
    fn test_numbers_are_widened_and_narrowed() {
        let schema = SchemaBuilder::without_identifier()
            .attribute("count", Attribute::optional_int())
            .attribute("ratio", Attribute::optional_float())
            .build()
            .unwrap();
        // {"count": 2.0 (f64), "ratio": 3 (fixint)}
        let mut bytes = vec![0x82, 0xa5];
        bytes.extend_from_slice(b"count");
        bytes.push(0xcb);
        bytes.extend_from_slice(&2.0f64.to_be_bytes());
        bytes.push(0xa5);
        bytes.extend_from_slice(b"ratio");
        bytes.push(0x03);

        let state = decode(&schema, &bytes).unwrap();
        assert_eq!(state.get_or_null("count"), &AttributeValue::int(2));
        assert_eq!(state.get_or_null("ratio"), &AttributeValue::float(3.0));
    }

    #[test]
    fn test_int_in_float_attribute_is_rejected() {
        let schema = SchemaBuilder::without_identifier()
            .attribute("ratio", Attribute::optional_float())
            .build()
            .unwrap();
        let state = ResourceState::new().with("ratio", 3i64);

        let err = encode(&schema, &state).unwrap_err();
        assert!(matches!(err, CodecError::TypeMismatch { path, .. } if path.to_string() == "ratio"));

        let state = ResourceState::new().with("ratio", 3.0);
        assert_eq!(decode(&schema, &encode(&schema, &state).unwrap()).unwrap(), state);
    }

    #[test]
    fn test_unknown_extension_variants() {
        let schema = SchemaBuilder::without_identifier()
            .attribute("a", Attribute::optional_string())
            .build()
            .unwrap();
        // refined unknown: ext8, 2 bytes, type 12
        let refined = [0x81, 0xa1, b'a', 0xc7, 0x02, 0x0c, 0x01, 0x00];
        assert!(decode(&schema, &refined).unwrap().get_or_null("a").is_unknown());

        // fixext1 of another type
        let other = [0x81, 0xa1, b'a', 0xd4, 0x05, 0x00];
        assert!(matches!(decode(&schema, &other), Err(CodecError::Malformed(_))));

        // payload shorter than declared
        let truncated = [0x81, 0xa1, b'a', 0xc7, 0x04, 0x00, 0x00];
        assert!(matches!(decode(&schema, &truncated), Err(CodecError::Malformed(_))));
    }

    #[test]
    fn test_large_numbers_as_strings() {
        let schema = SchemaBuilder::without_identifier()
            .attribute("count", Attribute::optional_int())
            .build()
            .unwrap();
        let mut bytes = vec![0x81, 0xa5];
        bytes.extend_from_slice(b"count");
        bytes.extend_from_slice(&[0xa2, b'4', b'2']);
        assert_eq!(
            decode(&schema, &bytes).unwrap().get_or_null("count"),
            &AttributeValue::int(42)
        );
    }

    #[test]
    fn test_json_bridge() {
        let schema = file_schema();
        let state = ResourceState::new()
            .with("id", AttributeValue::Unknown)
            .with("path", "/tmp/x")
            .with("content", "hi");

        let json = to_json(&state);
        assert_eq!(json, json!({"id": null, "path": "/tmp/x", "content": "hi"}));

        let back = from_json(&schema, &json!({"path": "/tmp/x", "content": "hi"})).unwrap();
        assert!(back.get_or_null("id").is_null());
        assert_eq!(back.get_or_null("path").as_str(), Some("/tmp/x"));

        let err = from_json(&schema, &json!({"path": "a", "content": "b", "mode": "0644"})).unwrap_err();
        assert!(matches!(err, CodecError::UnexpectedAttribute(name) if name == "mode"));
    }

    #[test]
    fn test_lossy_json_keeps_readable_attributes() {
        let schema = SchemaBuilder::new()
            .attribute("size", Attribute::optional_int())
            .attribute("zone", Attribute::optional_string())
            .build()
            .unwrap();
        let planned = ResourceState::new()
            .with("id", AttributeValue::Unknown)
            .with("size", 10i64)
            .with("zone", "eu");

        let json = json!({"id": "disk-1", "size": "big", "extra": true});
        let state = from_json_lossy(&schema, &json, Some(&planned)).unwrap();
        assert_eq!(state.get_or_null("id").as_str(), Some("disk-1"));
        assert_eq!(state.get_or_null("size").as_int(), Some(10));
        assert_eq!(state.get_or_null("zone").as_str(), Some("eu"));

        // The unknown identifier is not carried into an applied state.
        let state = from_json_lossy(&schema, &Json::Null, Some(&planned)).unwrap();
        assert!(state.get_or_null("id").is_null());

        assert_eq!(from_json_lossy(&schema, &Json::Null, None), None);
    }

    #[test]
    fn test_decode_json_payload() {
        let schema = file_schema();
        assert_eq!(decode_json(&schema, b"null").unwrap(), None);
        let state = decode_json(&schema, br#"{"id":"1","path":"p","content":"c"}"#)
            .unwrap()
            .unwrap();
        assert_eq!(state.get_or_null("id").as_str(), Some("1"));
    }

    fn scalar_string() -> impl Strategy<Value = AttributeValue> {
        prop_oneof![
            Just(AttributeValue::Null),
            Just(AttributeValue::Unknown),
            "[a-z0-9 ]{0,40}".prop_map(AttributeValue::string),
        ]
    }

    proptest! {
        #[test]
        fn prop_msgpack_round_trip(
            id in scalar_string(),
            count in prop_oneof![Just(AttributeValue::Null), any::<i64>().prop_map(AttributeValue::int)],
            ratio in prop_oneof![Just(AttributeValue::Unknown), (-1.0e12f64..1.0e12).prop_map(AttributeValue::float)],
            enabled in prop_oneof![Just(AttributeValue::Null), any::<bool>().prop_map(AttributeValue::bool)],
            tags in prop::collection::vec(scalar_string(), 0..20),
            labels in prop::collection::btree_map("[a-z]{1,8}", scalar_string(), 0..20),
        ) {
            let schema = rich_schema();
            let state = ResourceState::new()
                .with("id", id)
                .with("count", count)
                .with("ratio", ratio)
                .with("enabled", enabled)
                .with("tags", AttributeValue::list(tags))
                .with("labels", AttributeValue::map(labels));

            let bytes = encode(&schema, &state).unwrap();
            prop_assert_eq!(decode(&schema, &bytes).unwrap(), state);
        }
    }
}
