//! # Message Model
//!
//! The backend-agnostic unit of publish and delivery: a string header map plus
//! an opaque byte body.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Header map plus opaque body
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Header keys are unique; later inserts replace earlier values
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl Message {
    /// Create a message with the given body and no headers
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            headers: HashMap::new(),
            body: body.into(),
        }
    }

    /// Create a message whose body is the JSON encoding of `value`
    pub fn json<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        Ok(Self::new(serde_json::to_vec(value)?))
    }

    /// Add a header
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Add several headers
    pub fn with_headers<K, V, I>(mut self, headers: I) -> Self
    where
        K: Into<String>,
        V: Into<String>,
        I: IntoIterator<Item = (K, V)>,
    {
        self.headers
            .extend(headers.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    /// Body as UTF-8, if it is valid UTF-8
    pub fn body_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }

    /// Deserialize the body as JSON
    pub fn parse_json<T: for<'de> Deserialize<'de>>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

/// Opaque message identifier assigned by a backend on publish
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageId(pub String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for MessageId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for MessageId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Backend handle used to acknowledge one polled message
///
/// - AMQP: not used (delivery tags stay inside the acker)
/// - Long-poll: the receipt handle returned with each polled message
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReceiptHandle(pub String);

impl ReceiptHandle {
    pub fn new(handle: impl Into<String>) -> Self {
        Self(handle.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ReceiptHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ReceiptHandle {
    fn from(handle: String) -> Self {
        Self(handle)
    }
}

impl From<&str> for ReceiptHandle {
    fn from(handle: &str) -> Self {
        Self(handle.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_builder_headers_replace_existing_keys() {
        let message = Message::new("payload")
            .with_header("trace", "a")
            .with_headers([("trace", "b"), ("tenant", "acme")]);

        assert_eq!(message.headers.len(), 2);
        assert_eq!(message.header("trace"), Some("b"));
        assert_eq!(message.header("tenant"), Some("acme"));
        assert_eq!(message.body_str(), Some("payload"));
    }

    #[test]
    fn test_json_body() {
        let message = Message::json(&json!({"order_id": 42})).unwrap();
        let value: serde_json::Value = message.parse_json().unwrap();
        assert_eq!(value["order_id"], 42);
    }

    #[test]
    fn test_non_utf8_body() {
        let message = Message::new(vec![0xff, 0xfe]);
        assert!(message.body_str().is_none());
    }
}
