//! Content-type keyed payload codecs.
//!
//! Mirrors `SerializableData.serialize()`/`deserialize()` from
//! `protocols/zmq/message.py`: a payload carries its own content-type tag,
//! and encode/decode dispatches on that tag rather than on a fixed schema.
//! `application/json` and `json` are accepted as aliases of the same codec,
//! matching the Python source.

use std::collections::HashMap;

use serde_json::Value;

use crate::error::BrokerError;

/// A typed, still-serialized payload: the bytes plus the content-type tag
/// that explains how to interpret them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypedPayload {
    /// Content-type tag, e.g. `"application/json"`.
    pub content_type: String,
    /// Serialized bytes.
    pub bytes: Vec<u8>,
}

impl TypedPayload {
    /// Build a typed payload from raw parts.
    pub fn new(content_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            content_type: content_type.into(),
            bytes,
        }
    }
}

/// A codec that knows how to turn a [`serde_json::Value`] into wire bytes
/// and back, for one content-type family.
///
/// `serde_json::Value` is used as the common in-memory representation so a
/// single [`CodecRegistry`] can cross-convert between content types without
/// every caller needing to know the concrete payload type.
pub trait Codec: Send + Sync {
    /// Serialize a value into wire bytes.
    fn encode(&self, value: &Value) -> Result<Vec<u8>, BrokerError>;
    /// Parse wire bytes into a value.
    fn decode(&self, bytes: &[u8]) -> Result<Value, BrokerError>;
}

struct JsonCodec;

impl Codec for JsonCodec {
    fn encode(&self, value: &Value) -> Result<Vec<u8>, BrokerError> {
        serde_json::to_vec(value).map_err(|e| BrokerError::Malformed(format!("json encode: {e}")))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value, BrokerError> {
        serde_json::from_slice(bytes).map_err(|e| BrokerError::Malformed(format!("json decode: {e}")))
    }
}

struct MsgpackCodec;

impl Codec for MsgpackCodec {
    fn encode(&self, value: &Value) -> Result<Vec<u8>, BrokerError> {
        rmp_serde::to_vec_named(value)
            .map_err(|e| BrokerError::Malformed(format!("msgpack encode: {e}")))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value, BrokerError> {
        rmp_serde::from_slice(bytes).map_err(|e| BrokerError::Malformed(format!("msgpack decode: {e}")))
    }
}

struct PickleCodec;

impl Codec for PickleCodec {
    fn encode(&self, value: &Value) -> Result<Vec<u8>, BrokerError> {
        serde_pickle::to_vec(value, Default::default())
            .map_err(|e| BrokerError::Malformed(format!("pickle encode: {e}")))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value, BrokerError> {
        serde_pickle::from_slice(bytes, Default::default())
            .map_err(|e| BrokerError::Malformed(format!("pickle decode: {e}")))
    }
}

struct TextCodec;

impl Codec for TextCodec {
    fn encode(&self, value: &Value) -> Result<Vec<u8>, BrokerError> {
        let s = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        Ok(s.into_bytes())
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value, BrokerError> {
        let s = std::str::from_utf8(bytes)
            .map_err(|e| BrokerError::Malformed(format!("text decode: {e}")))?;
        Ok(Value::String(s.to_string()))
    }
}

/// Maps content-type tags to [`Codec`] implementations.
///
/// Built with the four content types the broker's wire format supports;
/// an unrecognized tag is a [`BrokerError::Malformed`] error, surfaced to
/// the client as `INVALID_MESSAGE` per the error taxonomy.
pub struct CodecRegistry {
    codecs: HashMap<&'static str, Box<dyn Codec>>,
}

impl CodecRegistry {
    /// Build the registry with the built-in codecs for
    /// `application/json`/`json`, `x-msgpack`, `pickle` and
    /// `text/plain`/`text`.
    pub fn new() -> Self {
        let mut codecs: HashMap<&'static str, Box<dyn Codec>> = HashMap::new();
        codecs.insert("application/json", Box::new(JsonCodec));
        codecs.insert("json", Box::new(JsonCodec));
        codecs.insert("x-msgpack", Box::new(MsgpackCodec));
        codecs.insert("pickle", Box::new(PickleCodec));
        codecs.insert("text/plain", Box::new(TextCodec));
        codecs.insert("text", Box::new(TextCodec));
        Self { codecs }
    }

    /// Serialize `value` using the codec named by `content_type`.
    pub fn encode(&self, content_type: &str, value: &Value) -> Result<TypedPayload, BrokerError> {
        let codec = self
            .codecs
            .get(content_type)
            .ok_or_else(|| BrokerError::Malformed(format!("unsupported content type: {content_type}")))?;
        Ok(TypedPayload::new(content_type.to_string(), codec.encode(value)?))
    }

    /// Parse `payload.bytes` using the codec named by `payload.content_type`.
    pub fn decode(&self, payload: &TypedPayload) -> Result<Value, BrokerError> {
        let codec = self
            .codecs
            .get(payload.content_type.as_str())
            .ok_or_else(|| {
                BrokerError::Malformed(format!("unsupported content type: {}", payload.content_type))
            })?;
        codec.decode(&payload.bytes)
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_round_trip() {
        let registry = CodecRegistry::new();
        let value = json!({"temperature": 21.5, "unit": "C"});
        let payload = registry.encode("application/json", &value).unwrap();
        let decoded = registry.decode(&payload).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn json_alias_accepted() {
        let registry = CodecRegistry::new();
        let value = json!(42);
        let payload = registry.encode("json", &value).unwrap();
        assert_eq!(payload.content_type, "json");
        assert_eq!(registry.decode(&payload).unwrap(), value);
    }

    #[test]
    fn msgpack_round_trip() {
        let registry = CodecRegistry::new();
        let value = json!({"on": true, "level": 3});
        let payload = registry.encode("x-msgpack", &value).unwrap();
        let decoded = registry.decode(&payload).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn pickle_round_trip() {
        let registry = CodecRegistry::new();
        let value = json!([1, 2, 3]);
        let payload = registry.encode("pickle", &value).unwrap();
        let decoded = registry.decode(&payload).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn text_round_trip() {
        let registry = CodecRegistry::new();
        let value = json!("hello thing");
        let payload = registry.encode("text/plain", &value).unwrap();
        assert_eq!(payload.bytes, b"hello thing");
        let decoded = registry.decode(&payload).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn unknown_content_type_is_malformed() {
        let registry = CodecRegistry::new();
        let err = registry.encode("application/xml", &json!(1)).unwrap_err();
        assert!(matches!(err, BrokerError::Malformed(_)));
    }
}
