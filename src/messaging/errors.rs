//! # Messaging Error Types
//!
//! Structured error handling for the broker facade using thiserror.
//!
//! Only synchronous calls (`connect`, `publish`, the setup half of
//! `subscribe`) hand these back to callers. Everything raised inside a
//! subscriber's background task is retried or logged instead.

use thiserror::Error;

/// Broker error taxonomy
#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("Connection error: {message}")]
    Connection { message: String },

    #[error("Not connected: {operation} requires a successful connect() first")]
    NotConnected { operation: String },

    #[error("Consumer setup failed for topic {topic}: {message}")]
    ConsumeSetup { topic: String, message: String },

    #[error("Failed to decode delivery on topic {topic}: {message}")]
    DeliveryDecode { topic: String, message: String },

    #[error("Backend poll failed for topic {topic}: {message}")]
    BackendPoll { topic: String, message: String },

    #[error("Publish failed for topic {topic}: {message}")]
    Publish { topic: String, message: String },

    #[error("Producer creation failed for topic {topic}: {message}")]
    ProducerCreation { topic: String, message: String },

    #[error("Acknowledgement failed: {operation}: {message}")]
    Acknowledgement { operation: String, message: String },

    #[error("Operation {operation} is not supported by the {provider} provider")]
    Unsupported {
        provider: String,
        operation: String,
    },

    #[error("Configuration error: {component}: {message}")]
    Configuration { component: String, message: String },

    #[error("Serialization error: {message}")]
    Serialization { message: String },

    #[error("Broker has been disconnected")]
    Shutdown,

    #[error("Internal broker error: {message}")]
    Internal { message: String },
}

impl BrokerError {
    /// Create a connection error
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Create a not-connected error for the named operation
    pub fn not_connected(operation: impl Into<String>) -> Self {
        Self::NotConnected {
            operation: operation.into(),
        }
    }

    /// Create a consumer setup error
    pub fn consume_setup(topic: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ConsumeSetup {
            topic: topic.into(),
            message: message.into(),
        }
    }

    /// Create a delivery decode error
    pub fn delivery_decode(topic: impl Into<String>, message: impl Into<String>) -> Self {
        Self::DeliveryDecode {
            topic: topic.into(),
            message: message.into(),
        }
    }

    /// Create a backend poll error
    pub fn backend_poll(topic: impl Into<String>, message: impl Into<String>) -> Self {
        Self::BackendPoll {
            topic: topic.into(),
            message: message.into(),
        }
    }

    /// Create a publish error
    pub fn publish(topic: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Publish {
            topic: topic.into(),
            message: message.into(),
        }
    }

    /// Create a producer creation error
    pub fn producer_creation(topic: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ProducerCreation {
            topic: topic.into(),
            message: message.into(),
        }
    }

    /// Create an ack error
    pub fn ack(message: impl Into<String>) -> Self {
        Self::Acknowledgement {
            operation: "ack".to_string(),
            message: message.into(),
        }
    }

    /// Create a nack error
    pub fn nack(requeue: bool, message: impl Into<String>) -> Self {
        Self::Acknowledgement {
            operation: format!("nack(requeue={})", requeue),
            message: message.into(),
        }
    }

    /// Create an unsupported-operation error
    pub fn unsupported(provider: impl Into<String>, operation: impl Into<String>) -> Self {
        Self::Unsupported {
            provider: provider.into(),
            operation: operation.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Configuration {
            component: component.into(),
            message: message.into(),
        }
    }

    /// Create a serialization error
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Whether the error reports a lost or missing transport
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::NotConnected { .. })
    }
}

/// Conversion from serde_json::Error to BrokerError
impl From<serde_json::Error> for BrokerError {
    fn from(err: serde_json::Error) -> Self {
        BrokerError::serialization(err.to_string())
    }
}

/// Result type alias for broker operations
pub type BrokerResult<T> = Result<T, BrokerError>;
