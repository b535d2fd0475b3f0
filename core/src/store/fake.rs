/// Scripted in-memory store for unit tests: failure injection and fetch gating
use super::{MessageStore, OutboundQueue, PageRequest};
use crate::error::{Result, SyncError};
use crate::types::{
    AuthorRole, Conversation, ConversationId, DeliveryStatus, Message, MessageId, NewMessage,
    NewOutboundEntry, OutboundQueueEntry, QueueEntryId,
};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;

#[derive(Default)]
struct Inner {
    conversations: Vec<Conversation>,
    messages: BTreeMap<(ConversationId, MessageId), Message>,
    queue: Vec<OutboundQueueEntry>,
    next_id: i64,
}

#[derive(Default)]
pub(crate) struct FakeStore {
    inner: Mutex<Inner>,
    gate: Mutex<Option<(Option<ConversationId>, Arc<Semaphore>)>>,
    fail_fetches: AtomicU32,
    fail_inserts: AtomicU32,
    pub fetch_calls: AtomicU64,
}

impl FakeStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn next_id(inner: &mut Inner) -> i64 {
        inner.next_id += 1;
        inner.next_id
    }

    pub fn add_conversation(&self, user_code: &str, client_user_id: Option<&str>) -> ConversationId {
        let mut inner = self.inner.lock().unwrap();
        let id = ConversationId(Self::next_id(&mut inner));
        inner.conversations.push(Conversation {
            id,
            user_code: user_code.to_string(),
            client_user_id: client_user_id.map(str::to_string),
        });
        id
    }

    /// Insert a message with a chosen id (ids must still grow per conversation)
    pub fn put_message(&self, conversation: ConversationId, id: i64, role: AuthorRole, content: &str) -> Message {
        let mut inner = self.inner.lock().unwrap();
        inner.next_id = inner.next_id.max(id);
        let msg = Message {
            id: MessageId(id),
            conversation_id: conversation,
            role,
            content: content.to_string(),
            attachment_url: None,
            created_at: Utc::now(),
        };
        inner.messages.insert((conversation, msg.id), msg.clone());
        msg
    }

    pub fn seed(&self, conversation: ConversationId, n: usize) -> Vec<Message> {
        (0..n)
            .map(|i| {
                let id = {
                    let mut inner = self.inner.lock().unwrap();
                    Self::next_id(&mut inner)
                };
                self.put_message(conversation, id, AuthorRole::Client, &format!("m{}", i))
            })
            .collect()
    }

    pub fn queued(&self) -> Vec<OutboundQueueEntry> {
        self.inner.lock().unwrap().queue.clone()
    }

    /// Fail the next `n` fetches with a transient error
    pub fn fail_next_fetches(&self, n: u32) {
        self.fail_fetches.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_inserts(&self, n: u32) {
        self.fail_inserts.store(n, Ordering::SeqCst);
    }

    /// Park fetches (for one conversation, or all with `None`) until `release_fetches`
    pub fn hold_fetches(&self, only: Option<ConversationId>) {
        *self.gate.lock().unwrap() = Some((only, Arc::new(Semaphore::new(0))));
    }

    pub fn release_fetches(&self) {
        if let Some((_, sem)) = self.gate.lock().unwrap().take() {
            sem.add_permits(Semaphore::MAX_PERMITS / 2);
        }
    }

    async fn before_fetch(&self, conversation: ConversationId) -> Result<()> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        let gate = self
            .gate
            .lock()
            .unwrap()
            .as_ref()
            .filter(|(only, _)| only.map_or(true, |c| c == conversation))
            .map(|(_, sem)| sem.clone());
        if let Some(sem) = gate {
            let _permit = sem
                .acquire()
                .await
                .map_err(|_| SyncError::TransientFetch("gate closed".to_string()))?;
        }
        take_failure(&self.fail_fetches, "store unavailable")
    }
}

fn take_failure(counter: &AtomicU32, msg: &str) -> Result<()> {
    let failed = counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok();
    if failed {
        Err(SyncError::TransientFetch(msg.to_string()))
    } else {
        Ok(())
    }
}

#[async_trait]
impl MessageStore for FakeStore {
    async fn conversation_by_user_code(&self, user_code: &str) -> Result<Conversation> {
        let inner = self.inner.lock().unwrap();
        inner
            .conversations
            .iter()
            .find(|c| c.user_code == user_code)
            .cloned()
            .ok_or_else(|| SyncError::NotFound(user_code.to_string()))
    }

    async fn list_by_conversation(
        &self,
        conversation: ConversationId,
        page: PageRequest,
    ) -> Result<Vec<Message>> {
        self.before_fetch(conversation).await?;
        let inner = self.inner.lock().unwrap();
        let upper = page.before.unwrap_or(MessageId(i64::MAX));
        Ok(inner
            .messages
            .range((conversation, MessageId(i64::MIN))..(conversation, upper))
            .rev()
            .take(page.limit)
            .map(|(_, m)| m.clone())
            .collect())
    }

    async fn list_after(
        &self,
        conversation: ConversationId,
        after: MessageId,
        limit: usize,
    ) -> Result<Vec<Message>> {
        self.before_fetch(conversation).await?;
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .messages
            .range((conversation, after)..=(conversation, MessageId(i64::MAX)))
            .filter(|(k, _)| k.1 > after)
            .take(limit)
            .map(|(_, m)| m.clone())
            .collect())
    }

    async fn create(&self, message: NewMessage) -> Result<Message> {
        let mut inner = self.inner.lock().unwrap();
        let id = MessageId(Self::next_id(&mut inner));
        let stored = Message {
            id,
            conversation_id: message.conversation_id,
            role: message.role,
            content: message.content,
            attachment_url: message.attachment_url,
            created_at: Utc::now(),
        };
        inner.messages.insert((stored.conversation_id, id), stored.clone());
        Ok(stored)
    }
}

#[async_trait]
impl OutboundQueue for FakeStore {
    async fn insert(&self, entry: NewOutboundEntry) -> Result<OutboundQueueEntry> {
        take_failure(&self.fail_inserts, "queue unavailable")?;
        let mut inner = self.inner.lock().unwrap();
        let id = QueueEntryId(Self::next_id(&mut inner));
        let stored = OutboundQueueEntry::from_new(id, entry, Utc::now());
        inner.queue.push(stored.clone());
        Ok(stored)
    }

    async fn pending(&self, limit: usize) -> Result<Vec<OutboundQueueEntry>> {
        let inner = self.inner.lock().unwrap();
        let mut out: Vec<_> = inner
            .queue
            .iter()
            .filter(|e| e.status == DeliveryStatus::Pending)
            .cloned()
            .collect();
        out.sort_by_key(|e| (e.priority, e.scheduled_for, e.id));
        out.truncate(limit);
        Ok(out)
    }

    async fn settle(&self, id: QueueEntryId, status: DeliveryStatus) -> Result<OutboundQueueEntry> {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner
            .queue
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or_else(|| SyncError::NotFound(id.to_string()))?;
        if !entry.status.can_transition_to(status) {
            return Err(SyncError::Validation(format!("{} -> {}", entry.status, status)));
        }
        entry.status = status;
        Ok(entry.clone())
    }
}
