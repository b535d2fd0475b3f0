/// Chat session: owns the view state for one open conversation and
/// serializes every mutation of it.
///
/// Pagination and sends are awaited in place (`&mut self` keeps them from
/// interleaving with each other); poll ticks run on their own task and
/// arrive as tagged reports that `next_update` / `drain_ready` apply. Every
/// result is checked against the current (conversation, generation) key
/// before it may touch the view.
use crate::config::Config;
use crate::error::SyncError;
use crate::events::ViewEvent;
use crate::outbound::{OutboundQueueWriter, OutboundRequest, QueuePolicy};
use crate::pager::{CursorPager, Page};
use crate::scheduler::{
    PollHandle, PollReport, PollResult, PollScheduler, PollSettings, REPORT_CAPACITY,
};
use crate::store::{MessageStore, Stores};
use crate::task::{Applied, Generation, Tagged, TaskKey};
use crate::types::{AuthorRole, Conversation, OutboundQueueEntry, SessionContext};
use crate::view::{LocalViewState, MergeOutcome, ScrollAnchor, ViewPhase};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Text (and optional attachment) typed into the compose box
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Draft {
    pub content: String,
    pub attachment_url: Option<String>,
}

impl Draft {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            attachment_url: None,
        }
    }
}

/// A send that did not reach the queue. The draft comes back for retry.
#[derive(Error, Debug)]
#[error("send failed: {error}")]
pub struct SendFailure {
    pub draft: Draft,
    #[source]
    pub error: SyncError,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub entry: OutboundQueueEntry,
    /// Key of the provisional row; None if the conversation changed mid-send
    pub local_id: Option<Uuid>,
}

/// Result of a `load_older` call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageLoad {
    Loaded {
        count: usize,
        anchor: Option<ScrollAnchor>,
    },
    /// No older history; nothing was fetched
    Exhausted,
    /// No conversation open, or the view is busy
    NotReady,
    /// Fetch failed; loaded history is untouched
    Failed(String),
}

/// Result of applying one poll report
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollApplied {
    Merged(MergeOutcome),
    Unchanged,
    Failed { consecutive_failures: u32 },
    /// Report belonged to a previous conversation or generation
    Stale,
}

struct ActiveConversation {
    user_code: String,
    conversation: Option<Conversation>,
    poller: Option<PollHandle>,
}

pub struct ChatSession {
    ctx: SessionContext,
    messages: Arc<dyn MessageStore>,
    pager: CursorPager,
    scheduler: PollScheduler,
    writer: OutboundQueueWriter,
    view: LocalViewState,
    generation: Generation,
    active: Option<ActiveConversation>,
    reports_tx: mpsc::Sender<PollReport>,
    reports_rx: mpsc::Receiver<PollReport>,
    events: broadcast::Sender<ViewEvent>,
    failure_threshold: u32,
    consecutive_failures: u32,
    degraded: bool,
}

impl ChatSession {
    pub fn new(config: &Config, stores: Stores, ctx: SessionContext) -> Self {
        let (reports_tx, reports_rx) = mpsc::channel(REPORT_CAPACITY);
        let (events, _) = broadcast::channel(256);
        Self {
            ctx,
            pager: CursorPager::new(stores.messages.clone(), config.page_size),
            scheduler: PollScheduler::new(stores.messages.clone(), PollSettings::from(config)),
            writer: OutboundQueueWriter::new(stores.queue, QueuePolicy::from(config)),
            messages: stores.messages,
            view: LocalViewState::new(config.optimistic_match_window),
            generation: Generation::default(),
            active: None,
            reports_tx,
            reports_rx,
            events,
            failure_threshold: config.failure_surface_threshold.max(1),
            consecutive_failures: 0,
            degraded: false,
        }
    }

    pub fn view(&self) -> &LocalViewState {
        &self.view
    }

    pub fn context(&self) -> &SessionContext {
        &self.ctx
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn conversation(&self) -> Option<&Conversation> {
        self.active.as_ref().and_then(|a| a.conversation.as_ref())
    }

    pub fn user_code(&self) -> Option<&str> {
        self.active.as_ref().map(|a| a.user_code.as_str())
    }

    /// Key that results must carry to be applied
    pub fn current_key(&self) -> Option<TaskKey> {
        self.conversation().map(|c| TaskKey {
            conversation: c.id,
            generation: self.generation,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ViewEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: ViewEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    fn accept<T>(&self, tagged: Tagged<T>) -> Applied<T> {
        let key = tagged.key;
        let applied = tagged.accept(self.current_key());
        if applied.is_stale() {
            debug!("Discarding stale result for {}", key);
        }
        applied
    }

    /// Stop polling and invalidate everything in flight
    async fn retire_current(&mut self) {
        self.generation = self.generation.next();
        self.consecutive_failures = 0;
        self.degraded = false;
        if let Some(active) = self.active.take() {
            if let Some(poller) = active.poller {
                poller.stop().await;
            }
        }
    }

    /// Open (or switch to) the conversation of a client. A client without a
    /// conversation yet shows as an empty, ready view. Only a failed lookup
    /// is returned as an error; a failed first page leaves the view ready
    /// and empty with the error recorded, and polling fills it in.
    pub async fn open(&mut self, user_code: &str) -> crate::Result<()> {
        self.retire_current().await;
        self.view.reset(None);
        info!("Opening conversation for {} ({})", user_code, self.generation);

        let conversation = match self.messages.conversation_by_user_code(user_code).await {
            Ok(c) => c,
            Err(SyncError::NotFound(_)) => {
                self.active = Some(ActiveConversation {
                    user_code: user_code.to_string(),
                    conversation: None,
                    poller: None,
                });
                self.view.finish(None);
                self.emit(ViewEvent::Opened {
                    user_code: user_code.to_string(),
                    conversation_id: None,
                    generation: self.generation,
                    message_count: 0,
                    has_more: false,
                });
                return Ok(());
            }
            Err(e) => {
                warn!("Conversation lookup for {} failed: {}", user_code, e);
                self.view.finish(Some(e.to_string()));
                self.emit(ViewEvent::Error {
                    message: e.to_string(),
                });
                return Err(e);
            }
        };

        self.view.reset(Some(conversation.id));
        self.active = Some(ActiveConversation {
            user_code: user_code.to_string(),
            conversation: Some(conversation.clone()),
            poller: None,
        });
        let key = TaskKey {
            conversation: conversation.id,
            generation: self.generation,
        };

        let page = self.pager.load_newest(conversation.id).await;
        match self.accept(Tagged::new(key, page)) {
            Applied::Fresh(Ok(page)) => {
                self.view.apply_newest(page);
                self.view.finish(None);
            }
            Applied::Fresh(Err(e)) => {
                warn!("Loading newest page of {} failed: {}", conversation.id, e);
                self.view.finish(Some(e.to_string()));
                self.emit(ViewEvent::Error {
                    message: e.to_string(),
                });
            }
            Applied::Stale => return Ok(()),
        }

        let poller = self
            .scheduler
            .start(key, self.view.high_water_mark(), self.reports_tx.clone());
        if let Some(active) = self.active.as_mut() {
            active.poller = Some(poller);
        }

        self.emit(ViewEvent::Opened {
            user_code: user_code.to_string(),
            conversation_id: Some(conversation.id),
            generation: self.generation,
            message_count: self.view.len(),
            has_more: self.view.has_more(),
        });
        Ok(())
    }

    /// Close the view; pending results for it are dropped on arrival
    pub async fn close(&mut self) {
        self.retire_current().await;
        self.view.close();
        self.emit(ViewEvent::Closed);
    }

    /// Load the next older page and prepend it
    pub async fn load_older(&mut self) -> PageLoad {
        let (Some(key), Some(cursor)) = (self.current_key(), self.view.oldest_loaded()) else {
            return if self.current_key().is_some() {
                PageLoad::Exhausted
            } else {
                PageLoad::NotReady
            };
        };
        if !self.view.has_more() {
            return PageLoad::Exhausted;
        }
        if !self.view.begin(ViewPhase::LoadingMore) {
            return PageLoad::NotReady;
        }

        let page = self.pager.load_older_than(key.conversation, cursor).await;
        match self.accept(Tagged::new(key, page)) {
            Applied::Fresh(Ok(page)) => {
                let count = page.messages.len();
                let anchor = self.view.prepend_older(page);
                self.view.finish(None);
                self.emit(ViewEvent::HistoryPrepended {
                    count,
                    has_more: self.view.has_more(),
                    anchor,
                });
                PageLoad::Loaded { count, anchor }
            }
            Applied::Fresh(Err(e)) => {
                warn!("Loading history older than {} failed: {}", cursor, e);
                self.view.finish(Some(e.to_string()));
                self.emit(ViewEvent::Error {
                    message: e.to_string(),
                });
                PageLoad::Failed(e.to_string())
            }
            Applied::Stale => PageLoad::NotReady,
        }
    }

    /// Queue an operator reply and show it right away
    pub async fn send(&mut self, draft: Draft) -> Result<SentMessage, SendFailure> {
        self.send_as(AuthorRole::Operator, draft).await
    }

    /// Queue a generated reply on behalf of the session's operator
    pub async fn send_assistant_reply(&mut self, draft: Draft) -> Result<SentMessage, SendFailure> {
        self.send_as(AuthorRole::Assistant, draft).await
    }

    async fn send_as(&mut self, role: AuthorRole, draft: Draft) -> Result<SentMessage, SendFailure> {
        let (Some(key), Some(conversation)) = (self.current_key(), self.conversation().cloned())
        else {
            return Err(SendFailure {
                draft,
                error: SyncError::Validation("no conversation open".to_string()),
            });
        };
        let busy = self.view.begin(ViewPhase::Sending);

        let request = OutboundRequest {
            target_user_id: conversation.client_user_id.clone(),
            conversation: Some(conversation.id),
            author: Some(role),
            author_id: None,
            content: draft.content.clone(),
            attachment_url: draft.attachment_url.clone(),
            scheduled_for: None,
        };
        let result = self.writer.enqueue(&self.ctx, request).await;

        match result {
            Ok(entry) => {
                if self.current_key() != Some(key) {
                    // queued for a conversation no longer on screen
                    debug!("Entry {} queued after {} was retired", entry.id, key);
                    return Ok(SentMessage {
                        entry,
                        local_id: None,
                    });
                }
                let local_id = self.view.insert_optimistic(
                    role,
                    draft.content,
                    draft.attachment_url,
                    Some(entry.id),
                );
                if busy {
                    self.view.finish(None);
                }
                self.emit(ViewEvent::Queued {
                    local_id,
                    entry: entry.clone(),
                });
                Ok(SentMessage {
                    entry,
                    local_id: Some(local_id),
                })
            }
            Err(error) => {
                warn!("Send to {} failed: {}", conversation.id, error);
                if busy {
                    self.view.finish(Some(error.to_string()));
                }
                self.emit(ViewEvent::Error {
                    message: error.to_string(),
                });
                Err(SendFailure { draft, error })
            }
        }
    }

    /// Run one poll now, outside the schedule. Its report arrives like any
    /// other tick and may race the periodic task.
    pub fn refresh_now(&self) -> bool {
        match self.current_key() {
            Some(key) => {
                self.scheduler
                    .spawn_once(key, self.view.high_water_mark(), self.reports_tx.clone());
                true
            }
            None => false,
        }
    }

    /// Wait for the next poll report and apply it
    pub async fn next_update(&mut self) -> PollApplied {
        match self.reports_rx.recv().await {
            Some(report) => self.apply_report(report),
            // unreachable while the session holds a sender
            None => PollApplied::Stale,
        }
    }

    /// Apply every report that has already arrived
    pub fn drain_ready(&mut self) -> Vec<PollApplied> {
        let mut applied = Vec::new();
        while let Ok(report) = self.reports_rx.try_recv() {
            applied.push(self.apply_report(report));
        }
        applied
    }

    #[cfg(test)]
    pub(crate) fn inject_report(&self, report: PollReport) {
        let _ = self.reports_tx.try_send(report);
    }

    fn apply_report(&mut self, report: PollReport) -> PollApplied {
        let PollResult { since, result } = match self.accept(report) {
            Applied::Fresh(r) => r,
            Applied::Stale => return PollApplied::Stale,
        };
        let busy = self.view.begin(ViewPhase::Polling);

        let applied = match result {
            Ok(messages) => {
                self.note_poll_success();
                let incoming = messages.clone();
                let outcome = if since.is_none() && self.view.oldest_loaded().is_none() {
                    // no page has been shown yet: this tick is the newest page
                    let has_more = messages.len() >= self.pager.page_size();
                    self.view.apply_newest(Page { messages, has_more })
                } else {
                    self.view.merge_newer(messages)
                };
                if outcome.is_empty() {
                    PollApplied::Unchanged
                } else {
                    debug!(
                        "Poll since {:?} merged {} messages",
                        since,
                        outcome.added.len()
                    );
                    let arrived: Vec<_> = incoming
                        .into_iter()
                        .filter(|m| outcome.added.contains(&m.id))
                        .collect();
                    if !arrived.is_empty() {
                        self.emit(ViewEvent::MessagesArrived { messages: arrived });
                    }
                    for (local_id, message_id) in &outcome.confirmed {
                        self.emit(ViewEvent::OptimisticConfirmed {
                            local_id: *local_id,
                            message_id: *message_id,
                        });
                    }
                    PollApplied::Merged(outcome)
                }
            }
            Err(e) => self.note_poll_failure(e),
        };

        if busy {
            self.view.settle();
        }
        applied
    }

    fn note_poll_success(&mut self) {
        self.consecutive_failures = 0;
        if self.degraded {
            self.degraded = false;
            self.view.set_error(None);
            info!("Polling recovered");
            self.emit(ViewEvent::SyncRecovered);
        }
    }

    fn note_poll_failure(&mut self, e: SyncError) -> PollApplied {
        self.consecutive_failures += 1;
        let n = self.consecutive_failures;
        if n >= self.failure_threshold {
            if !self.degraded {
                error!("Polling failed {} times in a row: {}", n, e);
                self.emit(ViewEvent::SyncDegraded {
                    consecutive_failures: n,
                    error: e.to_string(),
                });
            }
            self.degraded = true;
            self.view.set_error(Some(e.to_string()));
        } else {
            debug!("Poll failure {} of {} tolerated: {}", n, self.failure_threshold, e);
        }
        PollApplied::Failed {
            consecutive_failures: n,
        }
    }
}
