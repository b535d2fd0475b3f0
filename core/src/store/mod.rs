/// Store boundary: typed operations against the conversation, message and
/// outbound queue tables. No business logic lives here.
pub mod rest_store;
pub mod sled_store;

#[cfg(test)]
pub(crate) mod fake;

pub use rest_store::RestStore;
pub use sled_store::SledStore;

use crate::config::{Config, StoreBackend};
use crate::error::Result;
use crate::types::{
    Conversation, ConversationId, DeliveryStatus, Message, MessageId, NewMessage,
    NewOutboundEntry, OutboundQueueEntry, QueueEntryId,
};
use async_trait::async_trait;
use std::sync::Arc;

/// "N most recent before cursor"; `before: None` means the most recent page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub limit: usize,
    pub before: Option<MessageId>,
}

impl PageRequest {
    pub fn newest(limit: usize) -> Self {
        Self {
            limit,
            before: None,
        }
    }

    pub fn older_than(cursor: MessageId, limit: usize) -> Self {
        Self {
            limit,
            before: Some(cursor),
        }
    }
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Resolve the conversation for a client code. `SyncError::NotFound` when
    /// the client has not made first contact yet.
    async fn conversation_by_user_code(&self, user_code: &str) -> Result<Conversation>;

    /// Messages strictly older than `page.before`, newest first.
    async fn list_by_conversation(
        &self,
        conversation: ConversationId,
        page: PageRequest,
    ) -> Result<Vec<Message>>;

    /// Messages strictly newer than `after`, oldest first.
    async fn list_after(
        &self,
        conversation: ConversationId,
        after: MessageId,
        limit: usize,
    ) -> Result<Vec<Message>>;

    /// Persist a message; the store assigns id and timestamp.
    async fn create(&self, message: NewMessage) -> Result<Message>;
}

#[async_trait]
pub trait OutboundQueue: Send + Sync {
    /// Insert a pending entry
    async fn insert(&self, entry: NewOutboundEntry) -> Result<OutboundQueueEntry>;

    /// Pending entries, most urgent first (priority, then scheduled time)
    async fn pending(&self, limit: usize) -> Result<Vec<OutboundQueueEntry>>;

    /// Settle a pending entry. Settled entries never change again.
    async fn settle(&self, id: QueueEntryId, status: DeliveryStatus) -> Result<OutboundQueueEntry>;
}

/// Both halves of a backend, shared by pager, scheduler and queue writer
#[derive(Clone)]
pub struct Stores {
    pub messages: Arc<dyn MessageStore>,
    pub queue: Arc<dyn OutboundQueue>,
}

impl Stores {
    pub fn from_backend<S>(backend: Arc<S>) -> Self
    where
        S: MessageStore + OutboundQueue + 'static,
    {
        Self {
            messages: backend.clone(),
            queue: backend,
        }
    }
}

/// Open the backend named by the config
pub fn open_stores(config: &Config) -> Result<Stores> {
    match &config.store {
        StoreBackend::Sled { data_dir } => {
            let store = SledStore::new(data_dir)?;
            Ok(Stores::from_backend(Arc::new(store)))
        }
        StoreBackend::Rest { base_url, api_key } => {
            let store = RestStore::new(base_url, api_key, config.request_timeout)?;
            Ok(Stores::from_backend(Arc::new(store)))
        }
    }
}
