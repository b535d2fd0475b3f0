/// Embedded persistence: conversations, messages and the outbound queue in sled DB
/// Keys are zero-padded so lexicographic order equals id order.
use super::{MessageStore, OutboundQueue, PageRequest};
use crate::error::{Result, SyncError};
use crate::types::{
    Conversation, ConversationId, DeliveryStatus, Message, MessageId, NewMessage,
    NewOutboundEntry, OutboundQueueEntry, QueueEntryId,
};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Clone)]
pub struct SledStore {
    db: Arc<sled::Db>,
}

fn conversation_key(user_code: &str) -> String {
    format!("conv:{}", user_code)
}

fn message_key(conversation: ConversationId, id: MessageId) -> String {
    format!("msg:{:020}:{:020}", conversation.0, id.0)
}

fn message_prefix(conversation: ConversationId) -> String {
    format!("msg:{:020}:", conversation.0)
}

fn queue_key(id: QueueEntryId) -> String {
    format!("queue:{:020}", id.0)
}

impl SledStore {
    /// Open (or create) the store in the given data directory
    pub fn new(data_dir: &Path) -> Result<Self> {
        let db_path = data_dir.join("nutrisync.db");
        debug!("Opening chat store at {:?}", db_path);

        let db = sled::open(&db_path)
            .map_err(|e| SyncError::Storage(format!("Failed to open chat store: {}", e)))?;

        info!("Chat store initialized at {:?}", db_path);
        Ok(Self { db: Arc::new(db) })
    }

    fn next_id(&self) -> Result<i64> {
        // generate_id starts at 0; ids start at 1
        let raw = self.db.generate_id()?;
        i64::try_from(raw + 1)
            .map_err(|_| SyncError::Storage("id space exhausted".to_string()))
    }

    /// Create the conversation for a client on first contact. Returns the
    /// existing conversation if one is already there.
    pub fn create_conversation(
        &self,
        user_code: &str,
        client_user_id: Option<String>,
    ) -> Result<Conversation> {
        let key = conversation_key(user_code);
        if let Some(existing) = self.db.get(key.as_bytes())? {
            return Ok(serde_json::from_slice(&existing)?);
        }

        let conversation = Conversation {
            id: ConversationId(self.next_id()?),
            user_code: user_code.to_string(),
            client_user_id,
        };
        let value = serde_json::to_vec(&conversation)?;
        self.db
            .insert(key.as_bytes(), value)
            .map_err(|e| SyncError::Storage(format!("Failed to save conversation: {}", e)))?;
        info!("Created conversation {} for {}", conversation.id, user_code);
        Ok(conversation)
    }

    /// Number of messages in a conversation
    pub fn message_count(&self, conversation: ConversationId) -> usize {
        self.db.scan_prefix(message_prefix(conversation).as_bytes()).count()
    }

    fn decode_messages<I>(iter: I, limit: usize) -> Result<Vec<Message>>
    where
        I: Iterator<Item = sled::Result<(sled::IVec, sled::IVec)>>,
    {
        let mut messages = Vec::new();
        for entry in iter.take(limit) {
            let (_, value) = entry?;
            messages.push(serde_json::from_slice::<Message>(&value)?);
        }
        Ok(messages)
    }
}

#[async_trait]
impl MessageStore for SledStore {
    async fn conversation_by_user_code(&self, user_code: &str) -> Result<Conversation> {
        match self.db.get(conversation_key(user_code).as_bytes())? {
            Some(value) => Ok(serde_json::from_slice(&value)?),
            None => Err(SyncError::NotFound(format!(
                "no conversation for user code {}",
                user_code
            ))),
        }
    }

    async fn list_by_conversation(
        &self,
        conversation: ConversationId,
        page: PageRequest,
    ) -> Result<Vec<Message>> {
        let start = message_prefix(conversation);
        let end = match page.before {
            Some(cursor) => message_key(conversation, cursor),
            // ';' sorts right after ':', closing the prefix range
            None => format!("msg:{:020};", conversation.0),
        };
        let iter = self.db.range(start.into_bytes()..end.into_bytes()).rev();
        Self::decode_messages(iter, page.limit)
    }

    async fn list_after(
        &self,
        conversation: ConversationId,
        after: MessageId,
        limit: usize,
    ) -> Result<Vec<Message>> {
        let start = message_key(conversation, MessageId(after.0.saturating_add(1)));
        let end = format!("msg:{:020};", conversation.0);
        let iter = self.db.range(start.into_bytes()..end.into_bytes());
        Self::decode_messages(iter, limit)
    }

    async fn create(&self, message: NewMessage) -> Result<Message> {
        let stored = Message {
            id: MessageId(self.next_id()?),
            conversation_id: message.conversation_id,
            role: message.role,
            content: message.content,
            attachment_url: message.attachment_url,
            created_at: chrono::Utc::now(),
        };
        let value = serde_json::to_vec(&stored)?;
        self.db
            .insert(message_key(stored.conversation_id, stored.id).as_bytes(), value)
            .map_err(|e| SyncError::Storage(format!("Failed to save message: {}", e)))?;
        debug!("Stored message {} in conversation {}", stored.id, stored.conversation_id);
        Ok(stored)
    }
}

#[async_trait]
impl OutboundQueue for SledStore {
    async fn insert(&self, entry: NewOutboundEntry) -> Result<OutboundQueueEntry> {
        let stored = OutboundQueueEntry::from_new(
            QueueEntryId(self.next_id()?),
            entry,
            chrono::Utc::now(),
        );
        let value = serde_json::to_vec(&stored)?;
        self.db
            .insert(queue_key(stored.id).as_bytes(), value)
            .map_err(|e| SyncError::Storage(format!("Failed to enqueue entry: {}", e)))?;
        self.db
            .flush()
            .map_err(|e| SyncError::Storage(format!("Failed to flush queue: {}", e)))?;
        Ok(stored)
    }

    async fn pending(&self, limit: usize) -> Result<Vec<OutboundQueueEntry>> {
        let mut entries = Vec::new();
        for entry in self.db.scan_prefix(b"queue:") {
            let (_, value) = entry?;
            let e = serde_json::from_slice::<OutboundQueueEntry>(&value)?;
            if e.status == DeliveryStatus::Pending {
                entries.push(e);
            }
        }
        entries.sort_by(|a, b| {
            (a.priority, a.scheduled_for, a.id).cmp(&(b.priority, b.scheduled_for, b.id))
        });
        entries.truncate(limit);
        Ok(entries)
    }

    async fn settle(&self, id: QueueEntryId, status: DeliveryStatus) -> Result<OutboundQueueEntry> {
        let key = queue_key(id);
        loop {
            let current = self
                .db
                .get(key.as_bytes())?
                .ok_or_else(|| SyncError::NotFound(format!("queue entry {}", id)))?;
            let mut entry = serde_json::from_slice::<OutboundQueueEntry>(&current)?;
            if !entry.status.can_transition_to(status) {
                return Err(SyncError::Validation(format!(
                    "queue entry {} cannot move from {} to {}",
                    id, entry.status, status
                )));
            }
            entry.status = status;
            let updated = serde_json::to_vec(&entry)?;
            // Another settler may have raced us; re-read and re-check on conflict
            match self
                .db
                .compare_and_swap(key.as_bytes(), Some(current), Some(updated))?
            {
                Ok(()) => return Ok(entry),
                Err(_) => continue,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AuthorRole, DeliveryWindow, MessageType, QueueContext};
    use chrono::Utc;

    fn open() -> (tempfile::TempDir, SledStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SledStore::new(dir.path()).unwrap();
        (dir, store)
    }

    async fn seed(store: &SledStore, conversation: ConversationId, n: usize) -> Vec<Message> {
        let mut out = Vec::new();
        for i in 0..n {
            let msg = store
                .create(NewMessage {
                    conversation_id: conversation,
                    role: AuthorRole::Client,
                    content: format!("m{}", i),
                    attachment_url: None,
                })
                .await
                .unwrap();
            out.push(msg);
        }
        out
    }

    fn entry(priority: i32) -> NewOutboundEntry {
        let now = Utc::now();
        NewOutboundEntry {
            target_user_id: "u1".to_string(),
            message_type: MessageType::AssistantReply,
            content: "hi".to_string(),
            priority,
            scheduled_for: now,
            delivery_window: DeliveryWindow {
                start: now,
                end: now + chrono::Duration::hours(1),
            },
            context: QueueContext::default(),
        }
    }

    #[tokio::test]
    async fn test_conversation_lookup() {
        let (_dir, store) = open();
        assert!(matches!(
            store.conversation_by_user_code("c1").await,
            Err(SyncError::NotFound(_))
        ));
        let created = store.create_conversation("c1", Some("u1".to_string())).unwrap();
        let again = store.create_conversation("c1", None).unwrap();
        assert_eq!(created, again);
        assert_eq!(store.conversation_by_user_code("c1").await.unwrap(), created);
    }

    #[tokio::test]
    async fn test_pages_are_newest_first_and_scoped() {
        let (_dir, store) = open();
        let a = store.create_conversation("a", None).unwrap().id;
        let b = store.create_conversation("b", None).unwrap().id;
        let msgs = seed(&store, a, 5).await;
        seed(&store, b, 3).await;

        let newest = store
            .list_by_conversation(a, PageRequest::newest(2))
            .await
            .unwrap();
        assert_eq!(newest.len(), 2);
        assert_eq!(newest[0].id, msgs[4].id);
        assert_eq!(newest[1].id, msgs[3].id);

        let older = store
            .list_by_conversation(a, PageRequest::older_than(msgs[3].id, 10))
            .await
            .unwrap();
        let ids: Vec<_> = older.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![msgs[2].id, msgs[1].id, msgs[0].id]);
        assert_eq!(store.message_count(b), 3);
    }

    #[tokio::test]
    async fn test_list_after_is_oldest_first() {
        let (_dir, store) = open();
        let a = store.create_conversation("a", None).unwrap().id;
        let msgs = seed(&store, a, 4).await;

        let after = store.list_after(a, msgs[1].id, 10).await.unwrap();
        let ids: Vec<_> = after.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![msgs[2].id, msgs[3].id]);

        let capped = store.list_after(a, MessageId(0), 3).await.unwrap();
        assert_eq!(capped.len(), 3);
        assert_eq!(capped[0].id, msgs[0].id);
    }

    #[tokio::test]
    async fn test_pending_order_and_settle() {
        let (_dir, store) = open();
        let low = store.insert(entry(5)).await.unwrap();
        let urgent = store.insert(entry(1)).await.unwrap();

        let pending = store.pending(10).await.unwrap();
        assert_eq!(pending[0].id, urgent.id);
        assert_eq!(pending[1].id, low.id);

        let sent = store.settle(urgent.id, DeliveryStatus::Sent).await.unwrap();
        assert_eq!(sent.status, DeliveryStatus::Sent);
        assert_eq!(store.pending(10).await.unwrap().len(), 1);

        let regress = store.settle(urgent.id, DeliveryStatus::Pending).await;
        assert!(matches!(regress, Err(SyncError::Validation(_))));
        let flip = store.settle(urgent.id, DeliveryStatus::Failed).await;
        assert!(matches!(flip, Err(SyncError::Validation(_))));
    }
}
