// src/rabbitmq/codec.rs

use serde::{de::DeserializeOwned, Serialize};

use super::errors::{MessagingError, Result};

/// Turns typed messages into message bodies and back.
pub trait MessageCodec: Send + Sync + 'static {
    /// Stamped on the `content_type` property of every published message.
    fn content_type(&self) -> &'static str;

    fn encode<T: Serialize + ?Sized>(&self, message: &T) -> Result<Vec<u8>>;

    fn decode<T: DeserializeOwned>(&self, body: &[u8]) -> Result<T>;
}

/// UTF-8 JSON. Field naming follows the message type's serde attributes.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl MessageCodec for JsonCodec {
    fn content_type(&self) -> &'static str {
        "application/json"
    }

    fn encode<T: Serialize + ?Sized>(&self, message: &T) -> Result<Vec<u8>> {
        let value = serde_json::to_value(message)?;
        if value.is_null() {
            return Err(MessagingError::Argument(
                "message must not be null".to_string(),
            ));
        }
        Ok(serde_json::to_vec(&value)?)
    }

    fn decode<T: DeserializeOwned>(&self, body: &[u8]) -> Result<T> {
        if body.iter().all(u8::is_ascii_whitespace) {
            return Err(MessagingError::Deserialization(
                "message body is empty".to_string(),
            ));
        }

        let value: serde_json::Value = serde_json::from_slice(body)
            .map_err(|e| MessagingError::Deserialization(e.to_string()))?;
        if value.is_null() {
            return Err(MessagingError::Deserialization(
                "message body deserialized to null".to_string(),
            ));
        }

        serde_json::from_value(value).map_err(|e| MessagingError::Deserialization(e.to_string()))
    }
}
