use thiserror::Error;

/// Errors surfaced by the messaging client.
///
/// Remote handler failures are deliberately *not* represented here: a
/// service that fails while processing a command replies with a
/// `CommandResponse { success: false, .. }` value, and the caller inspects
/// `success`. This enum covers local failures only — misconfiguration,
/// timeouts, codec errors, and broker trouble.
#[derive(Error, Debug)]
pub enum Error {
    /// Operation invoked before the required setup call (e.g. `call()`
    /// before `setup_rpc_client()`, or anything before `connect()`).
    #[error("configuration error: {0}")]
    Config(String),

    /// No reply arrived within the caller's timeout window.
    #[error("call timed out waiting for reply")]
    Timeout,

    /// JSON encode/decode failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Business-logic failure raised by a command handler.
    ///
    /// `kind` becomes the `error_type` field of the structured error reply.
    #[error("{kind}: {message}")]
    Handler { kind: String, message: String },

    /// The broker connection dropped while work was outstanding.
    #[error("connection lost")]
    ConnectionLost,

    /// Broker-side failure (publish, declare, bind, consume).
    #[error("transport error: {0}")]
    Transport(String),
}

impl Error {
    /// Convenience constructor for handler-raised business failures.
    pub fn handler(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Handler {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// Short category string carried as `error_type` in error replies.
    pub fn kind(&self) -> String {
        // ---
        match self {
            Error::Config(_) => "ConfigurationError".to_string(),
            Error::Timeout => "TimeoutError".to_string(),
            Error::Serialization(_) => "DecodeError".to_string(),
            Error::Handler { kind, .. } => kind.clone(),
            Error::ConnectionLost => "ConnectionError".to_string(),
            Error::Transport(_) => "TransportError".to_string(),
        }
    }
}

/// Result type alias for messaging operations
pub type Result<T> = std::result::Result<T, Error>;
