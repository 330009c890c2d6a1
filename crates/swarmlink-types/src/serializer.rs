//! Payload serialization seam.

use crate::error::{SwarmError, SwarmResult};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Converts typed payloads to and from an envelope's text blob.
///
/// Implementations must round-trip open-ended shapes; with serde that means
/// tagged enums carry their variant name inside the blob.
pub trait PayloadSerializer: Send + Sync + 'static {
    fn serialize<T: Serialize>(&self, value: &T) -> SwarmResult<String>;

    fn deserialize<T: DeserializeOwned>(&self, blob: &str) -> SwarmResult<T>;
}

/// Default serializer: compact JSON via serde_json.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl PayloadSerializer for JsonSerializer {
    fn serialize<T: Serialize>(&self, value: &T) -> SwarmResult<String> {
        serde_json::to_string(value)
            .map_err(|e| SwarmError::Serialization(format!("JSON error: {e}")))
    }

    fn deserialize<T: DeserializeOwned>(&self, blob: &str) -> SwarmResult<T> {
        serde_json::from_str(blob)
            .map_err(|e| SwarmError::Serialization(format!("JSON error: {e}")))
    }
}
