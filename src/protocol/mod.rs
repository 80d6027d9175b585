//! Wire payload types and routing-key semantics.
//!
//! Everything in this module is pure: encode/decode of the JSON documents
//! carried as message bodies, and the topic-pattern matching rules used
//! for event routing. No I/O happens here.

mod command;
mod event;
mod routing;

pub use command::{CommandRequest, CommandResponse};
pub use event::EventMessage;
pub use routing::topic_matches;

/// JSON object type used for operation-specific payload fields.
///
/// The transport layer treats these as opaque; only the named envelope
/// fields around them are interpreted.
pub type JsonMap = serde_json::Map<String, serde_json::Value>;
