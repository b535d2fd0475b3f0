/// Cursor pager: backward pagination over "N most recent before cursor"
use crate::error::Result;
use crate::store::{MessageStore, PageRequest};
use crate::types::{ConversationId, Message, MessageId};
use std::sync::Arc;
use tracing::debug;

/// One page, ordered oldest -> newest
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    pub messages: Vec<Message>,
    /// True iff the store returned exactly `page_size` rows. A heuristic:
    /// a short page ends backward pagination.
    pub has_more: bool,
}

impl Page {
    fn from_newest_first(mut messages: Vec<Message>, page_size: usize) -> Self {
        let has_more = messages.len() == page_size;
        messages.reverse();
        Self { messages, has_more }
    }

    /// Cursor for the next older page
    pub fn oldest_id(&self) -> Option<MessageId> {
        self.messages.first().map(|m| m.id)
    }

    pub fn newest_id(&self) -> Option<MessageId> {
        self.messages.last().map(|m| m.id)
    }
}

#[derive(Clone)]
pub struct CursorPager {
    store: Arc<dyn MessageStore>,
    page_size: usize,
}

impl CursorPager {
    pub fn new(store: Arc<dyn MessageStore>, page_size: usize) -> Self {
        Self {
            store,
            page_size: page_size.max(1),
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Newest page of a conversation
    pub async fn load_newest(&self, conversation: ConversationId) -> Result<Page> {
        let rows = self
            .store
            .list_by_conversation(conversation, PageRequest::newest(self.page_size))
            .await?;
        debug!("Loaded newest page of {}: {} messages", conversation, rows.len());
        Ok(Page::from_newest_first(rows, self.page_size))
    }

    /// Page of messages strictly older than `cursor`
    pub async fn load_older_than(
        &self,
        conversation: ConversationId,
        cursor: MessageId,
    ) -> Result<Page> {
        let rows = self
            .store
            .list_by_conversation(conversation, PageRequest::older_than(cursor, self.page_size))
            .await?;
        debug!(
            "Loaded page of {} older than {}: {} messages",
            conversation,
            cursor,
            rows.len()
        );
        Ok(Page::from_newest_first(rows, self.page_size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::fake::FakeStore;

    #[tokio::test]
    async fn test_backward_pagination_is_gap_free() {
        let store = FakeStore::new();
        let conv = store.add_conversation("c1", Some("u1"));
        let all = store.seed(conv, 23);
        let pager = CursorPager::new(store.clone(), 5);

        let mut page = pager.load_newest(conv).await.unwrap();
        let mut collected = page.messages.clone();
        let mut calls = 1;
        while page.has_more {
            let cursor = page.oldest_id().unwrap();
            page = pager.load_older_than(conv, cursor).await.unwrap();
            let mut older = page.messages.clone();
            older.extend(collected);
            collected = older;
            calls += 1;
        }

        assert_eq!(collected, all);
        // 5 + 5 + 5 + 5 + 3: the short page stops the loop
        assert_eq!(calls, 5);
    }

    #[tokio::test]
    async fn test_exact_multiple_needs_one_empty_page() {
        let store = FakeStore::new();
        let conv = store.add_conversation("c1", None);
        store.seed(conv, 4);
        let pager = CursorPager::new(store.clone(), 2);

        let newest = pager.load_newest(conv).await.unwrap();
        assert!(newest.has_more);
        let second = pager
            .load_older_than(conv, newest.oldest_id().unwrap())
            .await
            .unwrap();
        assert!(second.has_more);
        let third = pager
            .load_older_than(conv, second.oldest_id().unwrap())
            .await
            .unwrap();
        assert!(third.messages.is_empty());
        assert!(!third.has_more);
    }

    #[tokio::test]
    async fn test_page_is_oldest_first() {
        let store = FakeStore::new();
        let conv = store.add_conversation("c1", None);
        let all = store.seed(conv, 3);
        let pager = CursorPager::new(store.clone(), 10);

        let page = pager.load_newest(conv).await.unwrap();
        assert_eq!(page.messages, all);
        assert!(!page.has_more);
        assert_eq!(page.newest_id(), Some(all[2].id));
    }

    #[tokio::test]
    async fn test_load_newest_is_idempotent() {
        let store = FakeStore::new();
        let conv = store.add_conversation("c1", None);
        store.seed(conv, 8);
        let pager = CursorPager::new(store.clone(), 5);

        let first = pager.load_newest(conv).await.unwrap();
        let second = pager.load_newest(conv).await.unwrap();
        assert_eq!(first, second);
    }
}
