use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::JsonMap;
use crate::{Error, Result};

/// Command payload published to a service's command queue.
///
/// `command` selects the remote operation (e.g. `"get_user"`); `data` is
/// operation-specific and opaque to the messaging layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandRequest {
    pub command: String,
    #[serde(default)]
    pub data: JsonMap,
}

impl CommandRequest {
    // ---
    pub fn new(command: impl Into<String>, data: JsonMap) -> Self {
        Self {
            command: command.into(),
            data,
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

/// Reply payload published back to a caller's reply queue.
///
/// Exactly one of `data` (when `success`) or `error` (when not) is
/// meaningfully populated; the constructors below enforce this. On the
/// wire the error category field is spelled `error_type`, matching the
/// service fleet's existing replies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResponse {
    pub success: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<JsonMap>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(
        default,
        rename = "error_type",
        skip_serializing_if = "Option::is_none"
    )]
    pub error_kind: Option<String>,
}

impl CommandResponse {
    // ---
    /// Successful reply carrying the handler's result.
    pub fn ok(data: JsonMap) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            error_kind: None,
        }
    }

    /// Structured error reply.
    pub fn failure(error: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
            error_kind: Some(kind.into()),
        }
    }

    /// Build the error reply for a failed handler invocation.
    pub fn from_error(err: &Error) -> Self {
        Self::failure(err.to_string(), err.kind())
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

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use serde_json::json;

    fn sample_data() -> JsonMap {
        json!({"id": 42, "username": "alice"})
            .as_object()
            .unwrap()
            .clone()
    }

    #[test]
    fn test_request_round_trip() {
        // ---
        let req = CommandRequest::new("get_user", sample_data());
        let bytes = req.encode().unwrap();
        let back = CommandRequest::decode(&bytes).unwrap();

        assert_eq!(back.command, "get_user");
        assert_eq!(back.data["id"], json!(42));
    }

    #[test]
    fn test_request_data_defaults_to_empty() {
        // ---
        let back = CommandRequest::decode(br#"{"command": "ping"}"#).unwrap();
        assert_eq!(back.command, "ping");
        assert!(back.data.is_empty());
    }

    #[test]
    fn test_success_response_omits_error_fields() {
        // ---
        let resp = CommandResponse::ok(sample_data());
        let text = String::from_utf8(resp.encode().unwrap().to_vec()).unwrap();

        assert!(text.contains("\"success\":true"));
        assert!(!text.contains("error"));
    }

    #[test]
    fn test_error_kind_wire_spelling() {
        // ---
        let resp = CommandResponse::failure("task 7 missing", "TaskNotFound");
        let text = String::from_utf8(resp.encode().unwrap().to_vec()).unwrap();

        // The wire field is `error_type`, not `error_kind`.
        assert!(text.contains("\"error_type\":\"TaskNotFound\""));
        assert!(text.contains("\"success\":false"));

        let back = CommandResponse::decode(text.as_bytes()).unwrap();
        assert_eq!(back.error_kind.as_deref(), Some("TaskNotFound"));
        assert_eq!(back.error.as_deref(), Some("task 7 missing"));
        assert!(back.data.is_none());
    }

    #[test]
    fn test_from_error_uses_handler_kind() {
        // ---
        let err = Error::handler("ValidationError", "title must not be empty");
        let resp = CommandResponse::from_error(&err);

        assert!(!resp.success);
        assert_eq!(resp.error_kind.as_deref(), Some("ValidationError"));
        assert_eq!(
            resp.error.as_deref(),
            Some("ValidationError: title must not be empty")
        );
    }

    #[test]
    fn test_decode_garbage_fails() {
        // ---
        assert!(matches!(
            CommandResponse::decode(b"not json at all"),
            Err(Error::Serialization(_))
        ));
    }
}
