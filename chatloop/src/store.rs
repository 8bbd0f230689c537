//! Local message state and the optimistic message lifecycle.
//!
//! [`MessageStore`] is the single shared source of local truth: an ordered,
//! append-only-by-default collection of messages plus lightweight
//! conversation summaries. All mutation is addressed by message id through
//! the operations here — channel events and query responses race freely on
//! the same exchange, and the id-addressed, terminal-status-guarded
//! operations make every interleaving safe.
//!
//! The store is an explicit object constructed once and shared by `Arc`,
//! never module-level state, so tests can run isolated instances.

use std::collections::HashMap;

use parking_lot::RwLock;
use tokio::sync::broadcast;

use chatloop_proto::event::ServerEvent;
use chatloop_proto::message::{
    Attachment, Conversation, ConversationId, Message, MessageId, MessageStatus, Role, Timestamp,
};
use chatloop_proto::query::QueryResponse;

/// Buffer size for the update broadcast channel. Lagging subscribers drop
/// old notifications instead of blocking the engine.
const UPDATE_BUFFER: usize = 256;

/// Notification that some store content changed. Subscribers re-read the
/// store; updates carry ids, not data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreUpdate {
    /// A message was appended or mutated in place.
    MessageChanged { id: MessageId },
    /// A placeholder's temporary id was replaced by a backend-issued id.
    MessageReplaced { old: MessageId, new: MessageId },
    /// A conversation summary was added, updated, or removed.
    ConversationChanged { id: ConversationId },
}

#[derive(Default)]
struct StoreInner {
    /// All messages in arrival order, across conversations.
    messages: Vec<Message>,
    /// Maps an in-flight placeholder id to its paired user message id, so
    /// finalize can assign the backend conversation id to both halves of
    /// the exchange.
    exchanges: HashMap<MessageId, MessageId>,
    conversations: Vec<Conversation>,
}

impl StoreInner {
    fn message_mut(&mut self, id: &MessageId) -> Option<&mut Message> {
        self.messages.iter_mut().find(|m| &m.id == id)
    }
}

/// Ordered message collection with the optimistic exchange lifecycle.
pub struct MessageStore {
    inner: RwLock<StoreInner>,
    updates: broadcast::Sender<StoreUpdate>,
}

impl Default for MessageStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        let (updates, _) = broadcast::channel(UPDATE_BUFFER);
        Self {
            inner: RwLock::new(StoreInner::default()),
            updates,
        }
    }

    /// Subscribe to change notifications.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<StoreUpdate> {
        self.updates.subscribe()
    }

    fn notify(&self, update: StoreUpdate) {
        // No subscribers is fine; send only fails when there are none.
        let _ = self.updates.send(update);
    }

    /// Appends an optimistic exchange: the user message (already "sent"
    /// from the UI's perspective, so `completed`) and an assistant
    /// placeholder in `processing`. Both carry client-generated temporary
    /// ids; the placeholder id is returned so later events and the query
    /// response can address it before the backend id is known.
    pub fn create_exchange(
        &self,
        conversation: Option<ConversationId>,
        content: &str,
        attachments: Vec<Attachment>,
    ) -> MessageId {
        let now = Timestamp::now();
        let user_id = MessageId::local();
        let placeholder_id = MessageId::local();

        let user = Message {
            id: user_id.clone(),
            conversation_id: conversation.clone(),
            role: Role::User,
            content: content.to_string(),
            status: MessageStatus::Completed,
            sources: vec![],
            chunks: vec![],
            attachments,
            tokens: 0,
            processing_time_ms: 0,
            cached: false,
            error_message: None,
            created_at: now,
            updated_at: now,
        };
        let placeholder = Message {
            id: placeholder_id.clone(),
            conversation_id: conversation,
            role: Role::Assistant,
            content: String::new(),
            status: MessageStatus::Processing,
            sources: vec![],
            chunks: vec![],
            attachments: vec![],
            tokens: 0,
            processing_time_ms: 0,
            cached: false,
            error_message: None,
            created_at: now,
            updated_at: now,
        };

        {
            let mut inner = self.inner.write();
            inner.messages.push(user);
            inner.messages.push(placeholder);
            inner
                .exchanges
                .insert(placeholder_id.clone(), user_id.clone());
        }
        self.notify(StoreUpdate::MessageChanged { id: user_id });
        self.notify(StoreUpdate::MessageChanged {
            id: placeholder_id.clone(),
        });
        placeholder_id
    }

    /// Applies one channel event to the addressed message.
    ///
    /// Returns `true` if a message was mutated. Events addressing an
    /// unknown id are no-ops — late or duplicate events after an exchange
    /// was finalized or a conversation deleted are expected and harmless.
    /// Terminal statuses are never overwritten.
    pub fn apply_event(&self, event: &ServerEvent) -> bool {
        match event {
            ServerEvent::Chunk {
                message_id,
                content,
            } => self.mutate(message_id, |msg| {
                msg.content.push_str(content);
            }),
            ServerEvent::Sources {
                message_id,
                sources,
            } => self.mutate(message_id, |msg| {
                msg.sources.clone_from(sources);
            }),
            ServerEvent::ProcessingCompleted {
                message_id,
                metadata,
            } => self.mutate(message_id, |msg| {
                msg.status = MessageStatus::Completed;
                if let Some(meta) = metadata {
                    if let Some(tokens) = meta.tokens {
                        msg.tokens = tokens;
                    }
                    if let Some(ms) = meta.processing_time_ms {
                        msg.processing_time_ms = ms;
                    }
                    if let Some(cached) = meta.cached {
                        msg.cached = cached;
                    }
                }
            }),
            ServerEvent::Error {
                message_id: Some(message_id),
                error,
            } => self.mutate(message_id, |msg| {
                msg.status = MessageStatus::Failed;
                msg.error_message = Some(error.clone());
            }),
            // Channel-level error with no message to mark.
            ServerEvent::Error {
                message_id: None,
                error,
            } => {
                tracing::warn!(error = %error, "channel error without message id");
                false
            }
            ServerEvent::Connection { .. }
            | ServerEvent::ProcessingStarted { .. }
            | ServerEvent::Typing { .. }
            | ServerEvent::Pong => false,
        }
    }

    /// Id-addressed mutation with the terminal-status guard.
    fn mutate(&self, id: &MessageId, apply: impl FnOnce(&mut Message)) -> bool {
        let mut inner = self.inner.write();
        let Some(msg) = inner.message_mut(id) else {
            tracing::debug!(message_id = %id, "event for unknown message, skipping");
            return false;
        };
        if msg.status.is_terminal() {
            tracing::debug!(
                message_id = %id,
                status = ?msg.status,
                "event for terminal message, skipping"
            );
            return false;
        }
        apply(msg);
        msg.updated_at = Timestamp::now();
        drop(inner);
        self.notify(StoreUpdate::MessageChanged { id: id.clone() });
        true
    }

    /// One-time replacement of a placeholder by the terminal query
    /// response: backend id, answer text, sources, chunks, and metadata,
    /// with status `completed`. The paired user message receives the
    /// backend conversation id as well.
    ///
    /// Idempotent: once the temporary id has been replaced it no longer
    /// resolves, so a second call is a no-op. A placeholder that already
    /// failed stays failed.
    ///
    /// Returns `true` if the placeholder was finalized.
    pub fn finalize(&self, temp_id: &MessageId, response: &QueryResponse) -> bool {
        let mut inner = self.inner.write();
        let Some(msg) = inner.message_mut(temp_id) else {
            tracing::debug!(message_id = %temp_id, "finalize for unknown id, skipping");
            return false;
        };
        if msg.status.is_terminal() {
            tracing::debug!(
                message_id = %temp_id,
                status = ?msg.status,
                "finalize for terminal message, skipping"
            );
            return false;
        }

        msg.id = response.message_id.clone();
        msg.conversation_id = Some(response.conversation_id.clone());
        msg.content.clone_from(&response.answer);
        msg.sources.clone_from(&response.sources);
        msg.chunks.clone_from(&response.chunks);
        msg.tokens = response.tokens_used;
        msg.processing_time_ms = response.processing_time_ms;
        msg.cached = response.cached;
        msg.status = MessageStatus::Completed;
        msg.updated_at = Timestamp::now();

        // Assign the backend conversation to the paired user message too.
        if let Some(user_id) = inner.exchanges.remove(temp_id)
            && let Some(user_msg) = inner.message_mut(&user_id)
        {
            user_msg.conversation_id = Some(response.conversation_id.clone());
        }
        if let Some(conv) = inner
            .conversations
            .iter_mut()
            .find(|c| c.id == response.conversation_id)
        {
            conv.last_message_at = Some(Timestamp::now());
            conv.message_count += 2;
        }
        drop(inner);

        self.notify(StoreUpdate::MessageReplaced {
            old: temp_id.clone(),
            new: response.message_id.clone(),
        });
        self.notify(StoreUpdate::ConversationChanged {
            id: response.conversation_id.clone(),
        });
        true
    }

    /// Marks a placeholder `failed` with the given user-facing message.
    ///
    /// Like [`finalize`](Self::finalize), a no-op when the id is unknown or
    /// the message already reached a terminal status.
    pub fn fail(&self, temp_id: &MessageId, error: &str) -> bool {
        let failed = self.mutate(temp_id, |msg| {
            msg.status = MessageStatus::Failed;
            msg.error_message = Some(error.to_string());
        });
        if failed {
            self.inner.write().exchanges.remove(temp_id);
        }
        failed
    }

    /// All messages of a conversation, in arrival order. Messages whose
    /// exchange has not been assigned a conversation yet are excluded.
    #[must_use]
    pub fn conversation_messages(&self, conversation: &ConversationId) -> Vec<Message> {
        self.inner
            .read()
            .messages
            .iter()
            .filter(|m| m.conversation_id.as_ref() == Some(conversation))
            .cloned()
            .collect()
    }

    /// All messages in arrival order, including not-yet-assigned exchanges.
    #[must_use]
    pub fn messages(&self) -> Vec<Message> {
        self.inner.read().messages.clone()
    }

    /// Snapshot of a single message.
    #[must_use]
    pub fn message(&self, id: &MessageId) -> Option<Message> {
        self.inner.read().messages.iter().find(|m| &m.id == id).cloned()
    }

    /// All conversation summaries in arrival order.
    #[must_use]
    pub fn conversations(&self) -> Vec<Conversation> {
        self.inner.read().conversations.clone()
    }

    /// Adds or updates a conversation summary, keyed by id.
    pub fn upsert_conversation(&self, conversation: Conversation) {
        let id = conversation.id.clone();
        {
            let mut inner = self.inner.write();
            match inner.conversations.iter_mut().find(|c| c.id == id) {
                Some(existing) => *existing = conversation,
                None => inner.conversations.push(conversation),
            }
        }
        self.notify(StoreUpdate::ConversationChanged { id });
    }

    /// Removes a conversation and its messages. Explicit user deletion is
    /// the only destroy path for messages.
    pub fn remove_conversation(&self, id: &ConversationId) {
        {
            let mut inner = self.inner.write();
            inner.conversations.retain(|c| &c.id != id);
            inner
                .messages
                .retain(|m| m.conversation_id.as_ref() != Some(id));
        }
        self.notify(StoreUpdate::ConversationChanged { id: id.clone() });
    }
}
