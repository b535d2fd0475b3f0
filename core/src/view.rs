/// Local view state: the ordered, de-duplicated message window the UI renders
///
/// Confirmed rows are kept sorted by message id, unique per id. Optimistic
/// rows sit after them in insertion order until their authoritative copy
/// arrives. Merges are union-only, so the high-water mark never moves back.
use crate::pager::Page;
use crate::types::{AuthorRole, ConversationId, Message, MessageId, QueueEntryId};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ViewPhase {
    Empty,
    Loading,
    Ready,
    LoadingMore,
    Polling,
    Sending,
    Closed,
}

impl ViewPhase {
    pub fn is_busy(self) -> bool {
        matches!(
            self,
            ViewPhase::Loading | ViewPhase::LoadingMore | ViewPhase::Polling | ViewPhase::Sending
        )
    }
}

/// De-duplication key of a visible row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ViewKey {
    Id(MessageId),
    Pending(Uuid),
}

/// A provisional row for a message that has not round-tripped through storage
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingMessage {
    pub local_id: Uuid,
    pub role: AuthorRole,
    pub content: String,
    pub attachment_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub queue_entry: Option<QueueEntryId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewRow<'a> {
    Confirmed(&'a Message),
    Pending(&'a PendingMessage),
}

impl ViewRow<'_> {
    pub fn key(&self) -> ViewKey {
        match self {
            ViewRow::Confirmed(m) => ViewKey::Id(m.id),
            ViewRow::Pending(p) => ViewKey::Pending(p.local_id),
        }
    }

    pub fn content(&self) -> &str {
        match self {
            ViewRow::Confirmed(m) => &m.content,
            ViewRow::Pending(p) => &p.content,
        }
    }

    pub fn role(&self) -> AuthorRole {
        match self {
            ViewRow::Confirmed(m) => m.role,
            ViewRow::Pending(p) => p.role,
        }
    }
}

/// Where the previously topmost row ended up after a prepend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ScrollAnchor {
    pub key: ViewKey,
    pub index: usize,
}

/// What a merge changed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    pub added: Vec<MessageId>,
    /// Optimistic rows superseded by their authoritative copy
    pub confirmed: Vec<(Uuid, MessageId)>,
}

impl MergeOutcome {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.confirmed.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct LocalViewState {
    conversation: Option<ConversationId>,
    phase: ViewPhase,
    confirmed: Vec<Message>,
    pending: Vec<PendingMessage>,
    oldest_loaded: Option<MessageId>,
    high_water: Option<MessageId>,
    has_more: bool,
    last_error: Option<String>,
    match_window: chrono::Duration,
}

impl LocalViewState {
    pub fn new(match_window: Duration) -> Self {
        Self {
            conversation: None,
            phase: ViewPhase::Empty,
            confirmed: Vec::new(),
            pending: Vec::new(),
            oldest_loaded: None,
            high_water: None,
            has_more: false,
            last_error: None,
            match_window: chrono::Duration::from_std(match_window)
                .unwrap_or_else(|_| chrono::Duration::seconds(120)),
        }
    }

    pub fn conversation(&self) -> Option<ConversationId> {
        self.conversation
    }

    pub fn phase(&self) -> ViewPhase {
        self.phase
    }

    pub fn oldest_loaded(&self) -> Option<MessageId> {
        self.oldest_loaded
    }

    pub fn high_water_mark(&self) -> Option<MessageId> {
        self.high_water
    }

    pub fn has_more(&self) -> bool {
        self.has_more
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn len(&self) -> usize {
        self.confirmed.len() + self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn messages(&self) -> &[Message] {
        &self.confirmed
    }

    pub fn pending(&self) -> &[PendingMessage] {
        &self.pending
    }

    pub fn contains(&self, id: MessageId) -> bool {
        self.confirmed.binary_search_by_key(&id, |m| m.id).is_ok()
    }

    /// Rows in display order
    pub fn rows(&self) -> impl Iterator<Item = ViewRow<'_>> {
        self.confirmed
            .iter()
            .map(ViewRow::Confirmed)
            .chain(self.pending.iter().map(ViewRow::Pending))
    }

    /// Drop everything and start over for `conversation` (or an unresolved one)
    pub fn reset(&mut self, conversation: Option<ConversationId>) {
        self.conversation = conversation;
        self.phase = ViewPhase::Loading;
        self.confirmed.clear();
        self.pending.clear();
        self.oldest_loaded = None;
        self.high_water = None;
        self.has_more = false;
        self.last_error = None;
    }

    pub fn close(&mut self) {
        self.reset(None);
        self.phase = ViewPhase::Closed;
    }

    /// Enter a busy sub-state. Only allowed from `Ready`.
    pub fn begin(&mut self, busy: ViewPhase) -> bool {
        if self.phase != ViewPhase::Ready || !busy.is_busy() {
            return false;
        }
        self.phase = busy;
        true
    }

    /// Back to `Ready`, recording (or clearing) the error of the operation
    pub fn finish(&mut self, error: Option<String>) {
        if self.phase == ViewPhase::Closed {
            return;
        }
        self.phase = ViewPhase::Ready;
        self.last_error = error;
    }

    /// Back to `Ready`, leaving `last_error` alone
    pub fn settle(&mut self) {
        if self.phase != ViewPhase::Closed {
            self.phase = ViewPhase::Ready;
        }
    }

    /// Surface or clear an error without changing phase
    pub fn set_error(&mut self, error: Option<String>) {
        self.last_error = error;
    }

    /// Initial page after `reset`
    pub fn apply_newest(&mut self, page: Page) -> MergeOutcome {
        self.has_more = page.has_more;
        let outcome = self.merge(page.messages, true);
        self.oldest_loaded = self.confirmed.first().map(|m| m.id);
        outcome
    }

    /// Prepend an older page. Returns where the old top row now sits so the
    /// viewer can keep it visually fixed.
    pub fn prepend_older(&mut self, page: Page) -> Option<ScrollAnchor> {
        let anchor_key = self.rows().next().map(|r| r.key());
        self.has_more = page.has_more;

        let before = self.confirmed.len();
        // history is older than any provisional row
        let outcome = self.merge(page.messages, false);
        if let Some(first) = self.confirmed.first() {
            self.oldest_loaded = Some(first.id);
        }
        debug!(
            "Prepended {} older messages ({} rows before)",
            outcome.added.len(),
            before
        );

        let key = anchor_key?;
        let index = self.rows().position(|r| r.key() == key)?;
        Some(ScrollAnchor { key, index })
    }

    /// Merge newer messages from a poll. Never removes a confirmed row.
    pub fn merge_newer(&mut self, messages: Vec<Message>) -> MergeOutcome {
        let outcome = self.merge(messages, true);
        if self.oldest_loaded.is_none() {
            self.oldest_loaded = self.confirmed.first().map(|m| m.id);
        }
        outcome
    }

    fn merge(&mut self, incoming: Vec<Message>, match_pending: bool) -> MergeOutcome {
        let mut outcome = MergeOutcome::default();
        for msg in incoming {
            if self.conversation.is_some() && Some(msg.conversation_id) != self.conversation {
                continue;
            }
            let pos = match self.confirmed.binary_search_by_key(&msg.id, |m| m.id) {
                Ok(_) => continue,
                Err(pos) => pos,
            };
            if match_pending {
                if let Some(local_id) = self.take_matching_pending(&msg) {
                    outcome.confirmed.push((local_id, msg.id));
                }
            }
            if self.high_water.map_or(true, |hw| msg.id > hw) {
                self.high_water = Some(msg.id);
            }
            outcome.added.push(msg.id);
            self.confirmed.insert(pos, msg);
        }
        outcome
    }

    fn take_matching_pending(&mut self, msg: &Message) -> Option<Uuid> {
        let window = self.match_window;
        let idx = self.pending.iter().position(|p| {
            p.role == msg.role
                && p.content == msg.content
                && (msg.created_at - p.created_at).abs() <= window
        })?;
        Some(self.pending.remove(idx).local_id)
    }

    /// Show a provisional row right away
    pub fn insert_optimistic(
        &mut self,
        role: AuthorRole,
        content: String,
        attachment_url: Option<String>,
        queue_entry: Option<QueueEntryId>,
    ) -> Uuid {
        let local_id = Uuid::new_v4();
        self.pending.push(PendingMessage {
            local_id,
            role,
            content,
            attachment_url,
            created_at: Utc::now(),
            queue_entry,
        });
        local_id
    }

    /// Replace a provisional row with its authoritative copy
    pub fn confirm_pending(&mut self, local_id: Uuid, message: Message) -> bool {
        let Some(idx) = self.pending.iter().position(|p| p.local_id == local_id) else {
            return false;
        };
        self.pending.remove(idx);
        self.merge(vec![message], false);
        true
    }

    pub fn discard_pending(&mut self, local_id: Uuid) -> bool {
        let before = self.pending.len();
        self.pending.retain(|p| p.local_id != local_id);
        self.pending.len() != before
    }
}
