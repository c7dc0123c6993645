//! Encoding of values for the shared cache, driven by the declared [`Shape`].
//!
//! Values are stored as JSON. The generic type of a value cannot tell what its elements look
//! like once encoded, so every encoded value is checked against the declared shape element by
//! element, both before writing and after reading. A value that does not fit is never written,
//! and a stored value that does not fit is treated as a miss.

use bytes::Bytes;
use serde_json::Value;

use crate::descriptor::Shape;
use crate::error::CodecError;
use crate::value::CacheValue;

/// Encodes `value` for the shared cache.
///
/// Returns `None` for an empty optional, which is never written.
pub fn encode<V: CacheValue>(shape: &Shape, value: &V) -> Result<Option<Bytes>, CodecError> {
    if value.is_absent() {
        return Ok(None);
    }
    let json = serde_json::to_value(value)?;
    if matches!(shape, Shape::Optional(_)) && json.is_null() {
        return Ok(None);
    }
    validate(shape, &json)?;
    Ok(Some(serde_json::to_vec(&json)?.into()))
}

/// Decodes a value read from the shared cache.
pub fn decode<V: CacheValue>(shape: &Shape, bytes: &[u8]) -> Result<V, CodecError> {
    let json: Value = serde_json::from_slice(bytes)?;
    validate(shape, &json)?;
    Ok(serde_json::from_value(json)?)
}

fn validate(shape: &Shape, json: &Value) -> Result<(), CodecError> {
    let valid = match *shape {
        Shape::Scalar(ty) | Shape::Optional(ty) => ty.matches(json),
        Shape::List(ty) => json
            .as_array()
            .is_some_and(|items| items.iter().all(|item| ty.matches(item))),
        Shape::Map { key, value } => json.as_object().is_some_and(|map| {
            map.iter()
                .all(|(k, v)| key.matches_key(k) && value.matches(v))
        }),
    };

    if valid {
        Ok(())
    } else {
        Err(CodecError::ShapeMismatch {
            expected: shape.kind(),
        })
    }
}
