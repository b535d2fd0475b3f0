/// View events broadcast by a chat session (one JSON object per event)
use crate::task::Generation;
use crate::types::{ConversationId, Message, MessageId, OutboundQueueEntry};
use crate::view::ScrollAnchor;
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ViewEvent {
    /// A conversation was opened (or reopened) and its newest page shown
    Opened {
        user_code: String,
        /// None when the client has not made first contact yet
        conversation_id: Option<ConversationId>,
        generation: Generation,
        message_count: usize,
        has_more: bool,
    },
    /// Older history was prepended
    HistoryPrepended {
        count: usize,
        has_more: bool,
        anchor: Option<ScrollAnchor>,
    },
    /// New messages were merged from a poll
    MessagesArrived { messages: Vec<Message> },
    /// A provisional row was replaced by its stored copy
    OptimisticConfirmed { local_id: Uuid, message_id: MessageId },
    /// An outbound entry was queued and shown optimistically
    Queued {
        local_id: Uuid,
        entry: OutboundQueueEntry,
    },
    /// Polling has failed repeatedly; the view shows stale data
    SyncDegraded {
        consecutive_failures: u32,
        error: String,
    },
    /// Polling recovered after a degraded period
    SyncRecovered,
    /// A recoverable error from pagination or a send
    Error { message: String },
    Closed,
}
