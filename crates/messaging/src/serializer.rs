//! Payload serialization boundary.

use thiserror::Error;

use crate::message::Content;

#[derive(Debug, Error)]
pub enum SerializerError {
    #[error("serialization failed: {0}")]
    Serialize(String),

    #[error("deserialization failed: {0}")]
    Deserialize(String),
}

/// Converts message content to bytes and back.
///
/// Stores treat the output as opaque; only the receive path interprets it.
pub trait Serializer: Send + Sync {
    fn serialize(&self, content: &Content) -> Result<Vec<u8>, SerializerError>;

    fn deserialize(&self, bytes: &[u8]) -> Result<Content, SerializerError>;
}

impl<S> Serializer for std::sync::Arc<S>
where
    S: Serializer + ?Sized,
{
    fn serialize(&self, content: &Content) -> Result<Vec<u8>, SerializerError> {
        (**self).serialize(content)
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Content, SerializerError> {
        (**self).deserialize(bytes)
    }
}

/// JSON serializer (the default).
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn serialize(&self, content: &Content) -> Result<Vec<u8>, SerializerError> {
        serde_json::to_vec(content).map_err(|e| SerializerError::Serialize(e.to_string()))
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Content, SerializerError> {
        serde_json::from_slice(bytes).map_err(|e| SerializerError::Deserialize(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn garbage_bytes_fail_to_decode() {
        let err = JsonSerializer.deserialize(b"\x00not json").unwrap_err();
        assert!(matches!(err, SerializerError::Deserialize(_)));
    }

    #[test]
    fn headers_survive_encoding() {
        let content = Content::new(serde_json::json!({"sku": "A-1"})).with_header("k", "v");
        let bytes = JsonSerializer.serialize(&content).unwrap();
        let decoded = JsonSerializer.deserialize(&bytes).unwrap();
        assert_eq!(decoded.header("k"), Some("v"));
    }
}
