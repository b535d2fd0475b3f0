/// Outbound queue writer: records the intent to deliver a reply to an end
/// client. Delivery itself belongs to the dispatcher that drains `pending` rows.
use crate::config::Config;
use crate::error::{Result, SyncError};
use crate::store::OutboundQueue;
use crate::types::{
    Actor, AuthorRole, ConversationId, DeliveryWindow, MessageType, NewOutboundEntry,
    OutboundQueueEntry, QueueContext, SessionContext,
};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// What an author wants delivered. Optional fields are checked by the writer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutboundRequest {
    pub target_user_id: Option<String>,
    pub conversation: Option<ConversationId>,
    pub author: Option<AuthorRole>,
    /// Originating author id; falls back to the session's operator
    pub author_id: Option<String>,
    pub content: String,
    pub attachment_url: Option<String>,
    /// Defaults to now
    pub scheduled_for: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueuePolicy {
    pub default_priority: i32,
    pub operator_priority: i32,
    pub delivery_window: Duration,
}

impl From<&Config> for QueuePolicy {
    fn from(config: &Config) -> Self {
        Self {
            default_priority: config.default_priority,
            operator_priority: config.operator_priority,
            delivery_window: config.delivery_window,
        }
    }
}

#[derive(Clone)]
pub struct OutboundQueueWriter {
    queue: Arc<dyn OutboundQueue>,
    policy: QueuePolicy,
}

fn required<T>(value: Option<T>, what: &str) -> Result<T> {
    value.ok_or_else(|| SyncError::Validation(format!("missing {}", what)))
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.trim().is_empty())
}

impl OutboundQueueWriter {
    pub fn new(queue: Arc<dyn OutboundQueue>, policy: QueuePolicy) -> Self {
        Self { queue, policy }
    }

    /// Validate a request and build the row. Nothing is written.
    pub fn prepare(&self, ctx: &SessionContext, request: OutboundRequest) -> Result<NewOutboundEntry> {
        let target_user_id = required(non_blank(request.target_user_id), "target user identifier")?;
        let conversation = required(request.conversation, "conversation reference")?;
        let author = required(request.author, "author role")?;
        if request.content.trim().is_empty() {
            return Err(SyncError::Validation("missing content".to_string()));
        }

        let author_id = non_blank(request.author_id).or_else(|| non_blank(ctx.operator_id.clone()));
        let operator_id = match author {
            AuthorRole::Client => None,
            // a reply nobody can be traced to cannot be dispatched
            AuthorRole::Operator | AuthorRole::Assistant => {
                Some(required(author_id.clone(), "originating operator id")?)
            }
        };

        let message_type = MessageType::derive(author, operator_id.as_deref());
        let priority = if ctx.actor == Actor::HumanOperator && author == AuthorRole::Operator {
            self.policy.operator_priority
        } else {
            self.policy.default_priority
        };

        let scheduled_for = request.scheduled_for.unwrap_or_else(Utc::now);
        let window = chrono::Duration::from_std(self.policy.delivery_window)
            .map_err(|e| SyncError::Config(format!("delivery window out of range: {}", e)))?;

        Ok(NewOutboundEntry {
            target_user_id,
            message_type,
            content: request.content,
            priority,
            scheduled_for,
            delivery_window: DeliveryWindow {
                start: scheduled_for,
                end: scheduled_for + window,
            },
            context: QueueContext {
                conversation_id: Some(conversation),
                author_id,
                attachment_url: request.attachment_url,
            },
        })
    }

    /// Validate and persist. Errors reach the caller unchanged so the
    /// compose box can keep its content.
    pub async fn enqueue(
        &self,
        ctx: &SessionContext,
        request: OutboundRequest,
    ) -> Result<OutboundQueueEntry> {
        let entry = match self.prepare(ctx, request) {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Rejected outbound entry: {}", e);
                return Err(e);
            }
        };
        let stored = self.queue.insert(entry).await?;
        info!(
            "Queued {:?} {} for {} (priority {})",
            stored.message_type, stored.id, stored.target_user_id, stored.priority
        );
        Ok(stored)
    }
}
