//! One-shot query dispatch and response reconciliation.
//!
//! The authoritative request/response path for answering a query. It works
//! with the real-time channel down: the exchange is created optimistically,
//! the HTTP request runs with its own timeout, and whatever the outcome,
//! the placeholder reaches a terminal status. Multiple exchanges may be in
//! flight; each response is routed by the placeholder id captured at
//! dispatch time, so completion order does not matter.

use std::sync::Arc;

use reqwest::StatusCode;

use chatloop_proto::message::{Attachment, Conversation, ConversationId};
use chatloop_proto::query::{ErrorBody, QueryRequest, QueryResponse, ResponseMode};

use crate::http::{ApiClient, HttpError};
use crate::store::MessageStore;

/// Conversation titles derived from the first query are cut at this many
/// characters.
const TITLE_LIMIT: usize = 60;

/// Failure classes for an exchange. Each maps to a distinct user-facing
/// message and always leaves the placeholder `failed`, never `processing`.
#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    /// No response within the configured budget.
    #[error("query timed out")]
    Timeout,

    /// The backend reported it is not ready (503).
    #[error("service unavailable")]
    ServiceUnavailable,

    /// The backend reported no upstream response (504).
    #[error("gateway timeout")]
    GatewayTimeout,

    /// The backend returned a structured error body.
    #[error("backend error: {0}")]
    Application(String),

    /// Anything else: transport failure, unparsable body, unexpected
    /// status.
    #[error("query failed: {0}")]
    Unknown(String),
}

impl QueryError {
    /// The explanation rendered inline in place of an answer.
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Self::Timeout => {
                "The assistant took too long to respond. Please try again.".to_string()
            }
            Self::ServiceUnavailable => {
                "The assistant is starting up. Please try again in a moment.".to_string()
            }
            Self::GatewayTimeout => {
                "The assistant did not respond. Please try again.".to_string()
            }
            Self::Application(detail) => detail.clone(),
            Self::Unknown(_) => {
                "Something went wrong while sending your message. Please try again.".to_string()
            }
        }
    }
}

/// Issues query requests and reconciles their responses into the store.
pub struct QueryDispatcher {
    api: Arc<ApiClient>,
    store: Arc<MessageStore>,
}

impl QueryDispatcher {
    /// Creates a dispatcher over the shared HTTP client and store.
    #[must_use]
    pub fn new(api: Arc<ApiClient>, store: Arc<MessageStore>) -> Self {
        Self { api, store }
    }

    /// Dispatches one query: appends the optimistic exchange, sends the
    /// request, and finalizes or fails the placeholder.
    ///
    /// Only attachments that finished uploading (carry an object key) are
    /// referenced in the request; the rest still render locally on the user
    /// message.
    ///
    /// # Errors
    ///
    /// Returns the failure class; the placeholder has already been marked
    /// `failed` with the matching user-facing message. Errors are per
    /// exchange and safe to swallow by the caller.
    pub async fn send(
        &self,
        query: &str,
        conversation: Option<ConversationId>,
        attachments: Vec<Attachment>,
    ) -> Result<QueryResponse, QueryError> {
        let file_attachments = attachments
            .iter()
            .filter_map(|a| a.object_key.clone())
            .collect();
        let placeholder = self
            .store
            .create_exchange(conversation.clone(), query, attachments);

        let request = QueryRequest {
            query: query.to_string(),
            conversation_id: conversation,
            response_mode: ResponseMode::Streaming,
            file_attachments,
        };

        match self.dispatch(&request).await {
            Ok(response) => {
                self.ensure_conversation(&response, query);
                self.store.finalize(&placeholder, &response);
                tracing::info!(
                    conversation = %response.conversation_id,
                    message = %response.message_id,
                    tokens = response.tokens_used,
                    "query answered"
                );
                Ok(response)
            }
            Err(err) => {
                tracing::warn!(err = %err, "query failed");
                self.store.fail(&placeholder, &err.user_message());
                Err(err)
            }
        }
    }

    /// Runs the whole exchange within the configured timeout and
    /// classifies the outcome. The budget covers the body read as well,
    /// so a backend that answers with headers and then stalls still
    /// counts as a timeout.
    async fn dispatch(&self, request: &QueryRequest) -> Result<QueryResponse, QueryError> {
        let cfg = self.api.config();
        let url = cfg.query_url();
        let exchange = async {
            let send = self.api.send_authorized(|http| http.post(&url).json(request));
            let response = match send.await {
                Err(HttpError::AuthLost | HttpError::NotAuthenticated) => {
                    return Err(QueryError::Application(
                        "Your session has expired. Please sign in again.".to_string(),
                    ));
                }
                Err(HttpError::Transport(e)) => return Err(QueryError::Unknown(e.to_string())),
                Ok(response) => response,
            };

            let status = response.status();
            if status.is_success() {
                return response
                    .json()
                    .await
                    .map_err(|e| QueryError::Unknown(format!("malformed response: {e}")));
            }
            match status {
                StatusCode::SERVICE_UNAVAILABLE => Err(QueryError::ServiceUnavailable),
                StatusCode::GATEWAY_TIMEOUT => Err(QueryError::GatewayTimeout),
                status => {
                    let body: ErrorBody = response.json().await.unwrap_or_default();
                    body.message().map_or_else(
                        || Err(QueryError::Unknown(format!("unexpected status {status}"))),
                        |detail| Err(QueryError::Application(detail.to_string())),
                    )
                }
            }
        };

        match tokio::time::timeout(cfg.query_timeout, exchange).await {
            Err(_) => Err(QueryError::Timeout),
            Ok(outcome) => outcome,
        }
    }

    /// Registers the conversation summary for a first exchange, before
    /// finalize bumps its counters.
    fn ensure_conversation(&self, response: &QueryResponse, query: &str) {
        let known = self
            .store
            .conversations()
            .iter()
            .any(|c| c.id == response.conversation_id);
        if !known {
            self.store.upsert_conversation(Conversation {
                id: response.conversation_id.clone(),
                title: derive_title(query),
                message_count: 0,
                is_pinned: false,
                is_archived: false,
                last_message_at: None,
            });
        }
    }
}

/// First `TITLE_LIMIT` characters of the query, on a char boundary.
fn derive_title(query: &str) -> String {
    match query.char_indices().nth(TITLE_LIMIT) {
        Some((idx, _)) => format!("{}…", &query[..idx]),
        None => query.to_string(),
    }
}
