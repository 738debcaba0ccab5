//! Serializers turning message payloads into transport bytes

use crate::error::Result;
use crate::message::List;
use serde_json::Value;
use std::fmt;

/// Byte-level encoding of the array-of-fields message form
pub trait Serializer: Send + Sync + fmt::Debug {
    /// Encode one message payload
    fn serialize(&self, payload: &[Value]) -> Result<Vec<u8>>;

    /// Decode one message payload
    fn deserialize(&self, data: &[u8]) -> Result<List>;

    /// Whether the encoding must travel in binary frames
    fn is_binary(&self) -> bool {
        false
    }
}

/// JSON serializer used with the `wamp.2.json` sub-protocol
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn serialize(&self, payload: &[Value]) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(payload)?)
    }

    fn deserialize(&self, data: &[u8]) -> Result<List> {
        Ok(serde_json::from_slice(data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::WampError;
    use serde_json::json;

    #[test]
    fn test_json_serialize() {
        let bytes = JsonSerializer
            .serialize(&[json!(1), json!("realm1"), json!({})])
            .unwrap();
        assert_eq!(bytes, br#"[1,"realm1",{}]"#.to_vec());
    }

    #[test]
    fn test_json_deserialize() {
        let payload = JsonSerializer.deserialize(br#"[2, 42, {}]"#).unwrap();
        assert_eq!(payload, vec![json!(2), json!(42), json!({})]);
    }

    #[test]
    fn test_json_deserialize_rejects_non_array() {
        let err = JsonSerializer.deserialize(br#"{"type": 2}"#).unwrap_err();
        assert!(matches!(err, WampError::Serialization(_)));
    }

    #[test]
    fn test_json_is_text() {
        assert!(!JsonSerializer.is_binary());
    }
}
