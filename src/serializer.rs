//! Opaque codec boundary for inputs, step results, signal payloads, and
//! errors (C7). The engine never inspects a serialized value beyond
//! round-tripping it through this trait.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

/// Codec seam between user values and the store's opaque payload column.
///
/// The default [`JsonSerializer`] is what every component in this crate
/// uses; a caller may supply their own implementation (e.g. one that adds
/// envelope versioning) without touching the engine.
pub trait Serializer: Send + Sync + 'static {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Value, SerializerError>;
    fn decode<T: DeserializeOwned>(&self, value: &Value) -> Result<T, SerializerError>;
}

#[derive(Debug, thiserror::Error)]
pub enum SerializerError {
    #[error("failed to encode value: {0}")]
    Encode(String),

    #[error("failed to decode value: {0}")]
    Decode(String),
}

/// Default [`Serializer`] backed by `serde_json::Value`, matching the
/// marshaling the rest of the store layer already uses.
#[derive(Debug, Clone, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Value, SerializerError> {
        serde_json::to_value(value).map_err(|e| SerializerError::Encode(e.to_string()))
    }

    fn decode<T: DeserializeOwned>(&self, value: &Value) -> Result<T, SerializerError> {
        serde_json::from_value(value.clone()).map_err(|e| SerializerError::Decode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Sample {
        a: u32,
        b: String,
    }

    #[test]
    fn round_trips_struct_values() {
        let ser = JsonSerializer;
        let sample = Sample {
            a: 7,
            b: "hi".into(),
        };
        let encoded = ser.encode(&sample).unwrap();
        let decoded: Sample = ser.decode(&encoded).unwrap();
        assert_eq!(sample, decoded);
    }

    #[test]
    fn decode_error_on_shape_mismatch() {
        let ser = JsonSerializer;
        let value = serde_json::json!({"a": "not a number", "b": "x"});
        let result: Result<Sample, _> = ser.decode(&value);
        assert!(result.is_err());
    }
}
