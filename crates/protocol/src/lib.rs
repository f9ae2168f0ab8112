//! Wire envelope for the collaboration protocol.
//!
//! The server speaks length-prefixed JSON documents. Every document is one of
//! three shapes:
//!
//! - [`Query`]: an outbound request carrying a correlation `id`. The server
//!   answers each query with exactly one reply bearing the same `id`.
//! - [`Reply`]: an inbound answer to a previously sent query. Carries either
//!   a `result` or an `error`, never both.
//! - [`Event`]: an unsolicited inbound message (no `id`), pushed by the
//!   server to all interested clients.
//!
//! Payloads are intentionally opaque [`Value`]s: the concrete packet schema
//! belongs to the application layer, the envelope only carries enough
//! structure for correlation and dispatch.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A packet as handed to the session by application code.
///
/// The correlation id is assigned by the connection handler at transmit time,
/// so callers only name the method and its parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Packet {
    /// Method name understood by the server.
    pub method: String,
    /// Method parameters as a JSON object.
    pub params: Value,
}

impl Packet {
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            method: method.into(),
            params,
        }
    }
}

/// Outbound request envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Query {
    /// Unique correlation id for matching the reply.
    pub id: u64,
    /// Method name to invoke on the server.
    pub method: String,
    /// Method parameters as a JSON object.
    pub params: Value,
}

/// Inbound reply envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reply {
    /// Correlation id of the query this reply answers.
    pub id: u64,
    /// Success payload (mutually exclusive with `error`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Failure payload (mutually exclusive with `result`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
}

/// Server-side error details attached to a failed reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Human-readable error message.
    pub message: String,
    /// Error type name, when the server provides one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Inbound server-push envelope. No correlation id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Event method name.
    pub method: String,
    /// Event parameters as a JSON object.
    pub params: Value,
}

/// Discriminated union of inbound messages.
///
/// Replies carry an `id` field, events do not; serde's untagged
/// representation picks the right variant from that. Anything else falls
/// through to `Unknown` so protocol additions never break the dispatch loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Frame {
    /// Reply to a query (has an `id` field).
    Reply(Reply),
    /// Server-push event (no `id` field).
    Event(Event),
    /// Forward-compatible catch-all.
    Unknown(Value),
}
