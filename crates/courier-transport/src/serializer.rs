//! Message body serialization.

use bytes::Bytes;
use courier_runtime::SerializationError;
use serde_json::Value;

/// Converts application message bodies to and from wire bytes
pub trait MessageSerializer: Send + Sync {
    fn serialize(&self, body: &Value) -> Result<Bytes, SerializationError>;

    fn deserialize(&self, bytes: &[u8]) -> Result<Value, SerializationError>;
}

/// JSON bodies through `serde_json`
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonMessageSerializer;

impl MessageSerializer for JsonMessageSerializer {
    fn serialize(&self, body: &Value) -> Result<Bytes, SerializationError> {
        serde_json::to_vec(body)
            .map(Bytes::from)
            .map_err(|e| SerializationError::Encode {
                message: e.to_string(),
            })
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Value, SerializationError> {
        serde_json::from_slice(bytes).map_err(|e| SerializationError::Decode {
            message: e.to_string(),
        })
    }
}

#[cfg(test)]
#[path = "serializer_tests.rs"]
mod tests;
