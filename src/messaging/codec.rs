//! # Payload Codecs
//!
//! Pluggable body transformation applied on publish (encode) and delivery
//! (decode). A decode failure never drops a delivery: the raw body is kept
//! and the error travels on the publication.

use super::errors::{BrokerError, BrokerResult};

/// Body encoder/decoder
pub trait Codec: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn encode(&self, body: &[u8]) -> BrokerResult<Vec<u8>>;

    fn decode(&self, body: &[u8]) -> BrokerResult<Vec<u8>>;
}

/// Pass-through codec
#[derive(Debug, Clone, Copy, Default)]
pub struct RawCodec;

impl Codec for RawCodec {
    fn name(&self) -> &'static str {
        "raw"
    }

    fn encode(&self, body: &[u8]) -> BrokerResult<Vec<u8>> {
        Ok(body.to_vec())
    }

    fn decode(&self, body: &[u8]) -> BrokerResult<Vec<u8>> {
        Ok(body.to_vec())
    }
}

/// Requires bodies to be well-formed JSON documents
///
/// Bodies are validated, then normalized to compact JSON.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn name(&self) -> &'static str {
        "json"
    }

    fn encode(&self, body: &[u8]) -> BrokerResult<Vec<u8>> {
        let value: serde_json::Value = serde_json::from_slice(body)?;
        Ok(serde_json::to_vec(&value)?)
    }

    fn decode(&self, body: &[u8]) -> BrokerResult<Vec<u8>> {
        let value: serde_json::Value = serde_json::from_slice(body)
            .map_err(|e| BrokerError::serialization(format!("invalid JSON body: {e}")))?;
        Ok(serde_json::to_vec(&value)?)
    }
}
