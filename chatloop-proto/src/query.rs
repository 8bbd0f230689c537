//! Request and response bodies for the query endpoint.

use serde::{Deserialize, Serialize};

use crate::message::{Chunk, ConversationId, MessageId};

/// How the backend should deliver the answer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseMode {
    /// Incremental delivery over the real-time channel, final answer in the
    /// HTTP response either way.
    #[default]
    Streaming,
    /// Answer only in the HTTP response.
    Complete,
}

/// Body of `POST /query`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryRequest {
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<ConversationId>,
    pub response_mode: ResponseMode,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub file_attachments: Vec<String>,
}

/// Successful `POST /query` response body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResponse {
    pub conversation_id: ConversationId,
    pub message_id: MessageId,
    pub answer: String,
    #[serde(default)]
    pub sources: Vec<String>,
    #[serde(default)]
    pub chunks: Vec<Chunk>,
    #[serde(default)]
    pub tokens_used: u64,
    #[serde(default)]
    pub processing_time_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_used: Option<String>,
    #[serde(default)]
    pub context_used: u64,
    #[serde(default)]
    pub cached: bool,
}

/// Error body the backend may attach to a non-200 response.
///
/// Different backend layers use `error` or `detail`; both are accepted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ErrorBody {
    /// The displayable message, preferring `error` over `detail`.
    #[must_use]
    pub fn message(&self) -> Option<&str> {
        self.error.as_deref().or(self.detail.as_deref())
    }
}
