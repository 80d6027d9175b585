use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use super::JsonMap;
use crate::Result;

/// Domain event envelope published to the events exchange.
///
/// `event_type` doubles as the default routing key when the publisher
/// supplies none explicitly. `timestamp` is seconds since the Unix epoch
/// at publish time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMessage {
    pub event_type: String,
    #[serde(default)]
    pub data: JsonMap,
    pub timestamp: f64,
}

impl EventMessage {
    // ---
    /// Build an event stamped with the current wall-clock time.
    pub fn now(event_type: impl Into<String>, data: JsonMap) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);

        Self {
            event_type: event_type.into(),
            data,
            timestamp,
        }
    }

    /// Encode to UTF-8 JSON bytes for publishing.
    pub fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    /// Decode from a received message body.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
