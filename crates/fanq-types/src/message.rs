//! Message types for FanQ
//!
//! A message is an opaque byte payload plus optional metadata. The routing
//! key is ignored by fanout exchanges.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use utoipa::ToSchema;
use uuid::Uuid;

/// Unique identifier for a message
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
pub struct MessageId(pub Uuid);

impl MessageId {
    /// Create a new random MessageId
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A published message
///
/// Fan-out clones the message once per target queue; `Bytes` keeps those
/// copies cheap and every copy shares the same id.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Message {
    /// Unique message identifier
    pub id: MessageId,

    /// Message body: UTF-8 text as a string, other bytes as `{"base64": ...}`
    #[serde(with = "bytes_serde")]
    #[schema(value_type = String)]
    pub body: Bytes,

    /// Routing key, used by direct exchanges only
    #[serde(default)]
    pub routing_key: Option<String>,

    /// Content type (e.g., "application/json")
    pub content_type: Option<String>,

    /// Custom attributes/headers
    #[serde(default)]
    pub attributes: HashMap<String, String>,

    /// Number of times this copy has been handed to a consumer
    #[serde(default)]
    pub delivery_count: u32,

    /// When the message was created
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Create a new message with the given body
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            id: MessageId::new(),
            body: body.into(),
            routing_key: None,
            content_type: None,
            attributes: HashMap::new(),
            delivery_count: 0,
            created_at: Utc::now(),
        }
    }

    /// Create a new message with JSON content
    pub fn json<T: Serialize>(data: &T) -> Result<Self, serde_json::Error> {
        let body = serde_json::to_vec(data)?;
        let mut msg = Self::new(body);
        msg.content_type = Some("application/json".to_string());
        Ok(msg)
    }

    /// Set routing key
    pub fn with_routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.routing_key = Some(routing_key.into());
        self
    }

    /// Set content type
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// Add an attribute
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Routing key, or the empty key when none was set
    pub fn routing_key_or_default(&self) -> &str {
        self.routing_key.as_deref().unwrap_or("")
    }

    /// Whether this copy was delivered before and handed back to the queue
    pub fn is_redelivery(&self) -> bool {
        self.delivery_count > 1
    }

    /// Get the body as a string (if valid UTF-8)
    pub fn body_as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }

    /// Deserialize the body as JSON
    pub fn body_as_json<T: for<'de> Deserialize<'de>>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

/// Custom serialization for Bytes
///
/// UTF-8 bodies are written as a plain string, anything else as
/// `{"base64": "..."}`, so both forms read back to the same bytes.
mod bytes_serde {
    use base64::Engine;
    use bytes::Bytes;
    use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Serialize, Deserialize)]
    #[serde(untagged)]
    enum Body {
        Text(String),
        Binary { base64: String },
    }

    pub fn serialize<S>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let body = match std::str::from_utf8(bytes) {
            Ok(s) => Body::Text(s.to_string()),
            Err(_) => Body::Binary {
                base64: base64::engine::general_purpose::STANDARD.encode(bytes),
            },
        };
        body.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Bytes, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Body::deserialize(deserializer)? {
            Body::Text(s) => Ok(Bytes::from(s)),
            Body::Binary { base64 } => base64::engine::general_purpose::STANDARD
                .decode(base64)
                .map(Bytes::from)
                .map_err(de::Error::custom),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_creation() {
        let msg = Message::new("Hello, World!");
        assert_eq!(msg.body_as_str(), Some("Hello, World!"));
        assert_eq!(msg.routing_key, None);
        assert_eq!(msg.routing_key_or_default(), "");
        assert_eq!(msg.delivery_count, 0);
        assert!(!msg.is_redelivery());
    }

    #[test]
    fn test_message_builder() {
        let msg = Message::new("test")
            .with_routing_key("error")
            .with_content_type("text/plain")
            .with_attribute("key", "value");

        assert_eq!(msg.routing_key_or_default(), "error");
        assert_eq!(msg.content_type, Some("text/plain".to_string()));
        assert_eq!(msg.attributes.get("key"), Some(&"value".to_string()));
    }

    #[test]
    fn test_json_message() {
        #[derive(Serialize, Deserialize, PartialEq, Debug)]
        struct LogLine {
            level: String,
            text: String,
        }

        let line = LogLine {
            level: "info".to_string(),
            text: "disk ok".to_string(),
        };

        let msg = Message::json(&line).unwrap();
        assert_eq!(msg.content_type, Some("application/json".to_string()));

        let parsed: LogLine = msg.body_as_json().unwrap();
        assert_eq!(parsed, line);
    }

    #[test]
    fn test_binary_body_serializes_as_base64() {
        let msg = Message::new(vec![0xff, 0xfe]);
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["body"]["base64"], "//4=");

        let parsed: Message = serde_json::from_value(value).unwrap();
        assert_eq!(&parsed.body[..], &[0xff, 0xfe]);
        assert_eq!(parsed.id, msg.id);
    }

    #[test]
    fn test_text_body_stays_plain() {
        let msg = Message::new("//4=");
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""body":"//4=""#));

        let parsed: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.body_as_str(), Some("//4="));
    }
}
