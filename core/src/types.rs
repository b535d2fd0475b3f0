/// Shared types for conversations, messages and the outbound queue
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Conversation identifier assigned by the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(pub i64);

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Message identifier assigned by the store. Strictly increasing within a
/// conversation, so it doubles as the pagination cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub i64);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Outbound queue entry identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueueEntryId(pub i64);

impl fmt::Display for QueueEntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One conversation per end client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    /// Stable client code the console looks conversations up by
    pub user_code: String,
    /// End client's user id, the delivery target for outbound entries
    pub client_user_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthorRole {
    Client,
    Operator,
    Assistant,
}

impl fmt::Display for AuthorRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AuthorRole::Client => "client",
            AuthorRole::Operator => "operator",
            AuthorRole::Assistant => "assistant",
        };
        f.write_str(s)
    }
}

/// A persisted, immutable chat message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub role: AuthorRole,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A message before the store assigns its id and timestamp
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMessage {
    pub conversation_id: ConversationId,
    pub role: AuthorRole,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment_url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    UserMessage,
    OperatorMessage,
    AssistantReply,
}

impl MessageType {
    /// Client-authored is a user message; an operator with an originating
    /// operator id is an operator message; everything else is an assistant reply.
    pub fn derive(role: AuthorRole, originating_operator: Option<&str>) -> Self {
        match (role, originating_operator) {
            (AuthorRole::Client, _) => MessageType::UserMessage,
            (AuthorRole::Operator, Some(_)) => MessageType::OperatorMessage,
            _ => MessageType::AssistantReply,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Sent,
    Failed,
}

impl DeliveryStatus {
    /// Status only moves forward: `pending -> sent | failed`.
    pub fn can_transition_to(self, next: DeliveryStatus) -> bool {
        matches!(
            (self, next),
            (DeliveryStatus::Pending, DeliveryStatus::Sent)
                | (DeliveryStatus::Pending, DeliveryStatus::Failed)
        )
    }

    pub fn is_settled(self) -> bool {
        self != DeliveryStatus::Pending
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Time span in which the dispatcher may deliver an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Free-form context the dispatcher carries along
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct QueueContext {
    pub conversation_id: Option<ConversationId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment_url: Option<String>,
}

/// A validated outbound entry, ready for insertion
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewOutboundEntry {
    pub target_user_id: String,
    pub message_type: MessageType,
    pub content: String,
    pub priority: i32,
    pub scheduled_for: DateTime<Utc>,
    pub delivery_window: DeliveryWindow,
    pub context: QueueContext,
}

/// A persisted delivery obligation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundQueueEntry {
    pub id: QueueEntryId,
    pub target_user_id: String,
    pub message_type: MessageType,
    pub content: String,
    pub priority: i32,
    pub scheduled_for: DateTime<Utc>,
    pub delivery_window: DeliveryWindow,
    pub status: DeliveryStatus,
    pub context: QueueContext,
    pub created_at: DateTime<Utc>,
}

impl OutboundQueueEntry {
    pub fn from_new(id: QueueEntryId, entry: NewOutboundEntry, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            target_user_id: entry.target_user_id,
            message_type: entry.message_type,
            content: entry.content,
            priority: entry.priority,
            scheduled_for: entry.scheduled_for,
            delivery_window: entry.delivery_window,
            status: DeliveryStatus::Pending,
            context: entry.context,
            created_at,
        }
    }
}

/// Who drives the session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Actor {
    HumanOperator,
    Automation,
}

/// Explicit session context handed to the session and the queue writer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionContext {
    pub operator_id: Option<String>,
    pub actor: Actor,
}

impl SessionContext {
    pub fn human(operator_id: impl Into<String>) -> Self {
        Self {
            operator_id: Some(operator_id.into()),
            actor: Actor::HumanOperator,
        }
    }

    pub fn automation(operator_id: Option<String>) -> Self {
        Self {
            operator_id,
            actor: Actor::Automation,
        }
    }
}
