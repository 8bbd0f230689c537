//! Real-time channel envelopes.
//!
//! Inbound events are a closed sum type discriminated by the JSON `type`
//! field, so handling a new event kind is a compile-time decision. Event
//! types the engine does not know about are carried verbatim as
//! [`Envelope::Unknown`] and forwarded to a generic handler rather than
//! dropped.

use serde::{Deserialize, Serialize};

use crate::message::MessageId;

/// Metadata merged into a message when the backend reports completion.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_time_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cached: Option<bool>,
}

/// An event received on the real-time channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Informational: the channel is established. No state change.
    Connection {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    /// Incremental answer text for the addressed message.
    Chunk { message_id: MessageId, content: String },
    /// Replaces the addressed message's source list.
    Sources {
        message_id: MessageId,
        sources: Vec<String>,
    },
    /// Informational: the backend started working on the addressed message.
    ProcessingStarted {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<MessageId>,
    },
    /// The addressed message is complete; metadata may be merged.
    ProcessingCompleted {
        message_id: MessageId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<CompletionMetadata>,
    },
    /// The addressed message failed. A missing `message_id` means a
    /// channel-level error with no message to mark.
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<MessageId>,
        error: String,
    },
    /// Presence indicator; never persisted.
    Typing { user_id: String, is_typing: bool },
    /// Heartbeat acknowledgment. No state change.
    Pong,
}

impl ServerEvent {
    /// The `type` discriminants this engine recognizes.
    pub const KNOWN_TYPES: &'static [&'static str] = &[
        "connection",
        "chunk",
        "sources",
        "processing_started",
        "processing_completed",
        "error",
        "typing",
        "pong",
    ];
}

/// Result of parsing one inbound channel frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    /// A recognized, well-formed event.
    Known(ServerEvent),
    /// A syntactically valid envelope whose `type` the engine does not
    /// recognize. Forwarded unopinionated with its full payload.
    Unknown(serde_json::Value),
}

/// Errors parsing an inbound channel frame.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    /// The frame was not valid JSON or a recognized type had a malformed
    /// payload.
    #[error("malformed event: {0}")]
    Malformed(#[from] serde_json::Error),
    /// The frame had no string `type` field.
    #[error("event envelope has no type field")]
    MissingType,
}

/// Parses one inbound frame into an [`Envelope`].
///
/// A recognized `type` with a malformed payload is an error; an
/// unrecognized `type` is [`Envelope::Unknown`], never an error.
///
/// # Errors
///
/// Returns [`ParseError`] for invalid JSON, a missing `type` field, or a
/// recognized event whose required fields are absent.
pub fn parse_event(text: &str) -> Result<Envelope, ParseError> {
    let value: serde_json::Value = serde_json::from_str(text).map_err(ParseError::Malformed)?;
    let Some(kind) = value.get("type").and_then(serde_json::Value::as_str) else {
        return Err(ParseError::MissingType);
    };

    if ServerEvent::KNOWN_TYPES.contains(&kind) {
        serde_json::from_value(value)
            .map(Envelope::Known)
            .map_err(ParseError::Malformed)
    } else {
        Ok(Envelope::Unknown(value))
    }
}

/// An event sent by the client on the real-time channel.
///
/// Only the heartbeat is in scope; full send capability lives elsewhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    Ping,
}
