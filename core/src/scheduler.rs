/// Poll scheduler: one cancellable poll task per open conversation
///
/// Each tick fetches messages newer than the task's high-water mark (or the
/// newest page while nothing has been seen) and reports them, tagged with the
/// task key, over a channel. The session decides whether the report is
/// still current. Ticks run back to back, never queued: a slow fetch delays
/// the next tick instead of stacking one behind it, and a report the session
/// has no room for is dropped without advancing the mark.
use crate::config::Config;
use crate::error::Result;
use crate::store::{MessageStore, PageRequest};
use crate::task::{Tagged, TaskKey};
use crate::types::{ConversationId, Message, MessageId};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    pub interval: Duration,
    pub max_backoff: Duration,
    pub page_size: usize,
}

impl From<&Config> for PollSettings {
    fn from(config: &Config) -> Self {
        Self {
            interval: config.poll_interval,
            max_backoff: config.max_poll_backoff,
            page_size: config.page_size,
        }
    }
}

/// Result of one tick
#[derive(Debug)]
pub struct PollResult {
    /// High-water mark the fetch was issued with
    pub since: Option<MessageId>,
    /// Messages oldest -> newest
    pub result: Result<Vec<Message>>,
}

pub type PollReport = Tagged<PollResult>;

/// Reports buffered between the poll tasks and the session
pub const REPORT_CAPACITY: usize = 16;

/// Exponential backoff over empty or failed ticks
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            current: base,
        }
    }

    /// Tick found messages: back to the base interval
    pub fn reset(&mut self) {
        self.current = self.base;
    }

    /// Tick was empty or failed: double, capped
    pub fn grow(&mut self) {
        self.current = (self.current * 2).min(self.max);
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    /// Current delay with +/-10% jitter, never above the cap
    pub fn jittered(&self) -> Duration {
        let factor = rand::thread_rng().gen_range(0.9..=1.1);
        self.current.mul_f64(factor).min(self.max)
    }
}

/// Handle to a running poll task. Dropping it stops the task.
pub struct PollHandle {
    key: TaskKey,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl PollHandle {
    pub fn key(&self) -> TaskKey {
        self.key
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, |t| t.is_finished())
    }

    /// Stop the task and wait for it to exit
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for PollHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[derive(Clone)]
pub struct PollScheduler {
    store: Arc<dyn MessageStore>,
    settings: PollSettings,
}

impl PollScheduler {
    pub fn new(store: Arc<dyn MessageStore>, settings: PollSettings) -> Self {
        Self { store, settings }
    }

    pub fn settings(&self) -> PollSettings {
        self.settings
    }

    /// Start the periodic task for `key`, continuing from `since`
    pub fn start(
        &self,
        key: TaskKey,
        since: Option<MessageId>,
        reports: mpsc::Sender<PollReport>,
    ) -> PollHandle {
        let cancel = CancellationToken::new();
        let stop = cancel.child_token();
        let scheduler = self.clone();
        let task = tokio::spawn(async move {
            scheduler.run(key, since, reports, stop).await;
        });
        info!("Polling {} every {:?}", key, self.settings.interval);
        PollHandle {
            key,
            cancel,
            task: Some(task),
        }
    }

    /// One extra tick outside the schedule (explicit user refresh)
    pub fn spawn_once(
        &self,
        key: TaskKey,
        since: Option<MessageId>,
        reports: mpsc::Sender<PollReport>,
    ) -> JoinHandle<()> {
        let scheduler = self.clone();
        tokio::spawn(async move {
            let result = scheduler.fetch(key.conversation, since).await;
            if reports.try_send(Tagged::new(key, PollResult { since, result })).is_err() {
                debug!("Refresh report for {} dropped", key);
            }
        })
    }

    async fn run(
        &self,
        key: TaskKey,
        mut since: Option<MessageId>,
        reports: mpsc::Sender<PollReport>,
        stop: CancellationToken,
    ) {
        let mut backoff = Backoff::new(self.settings.interval, self.settings.max_backoff);
        let mut delay = backoff.jittered();

        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = sleep(delay) => {}
            }

            let issued = since;
            let result = tokio::select! {
                _ = stop.cancelled() => break,
                r = self.fetch(key.conversation, issued) => r,
            };

            let mut advanced = since;
            delay = match &result {
                Ok(messages) if !messages.is_empty() => {
                    backoff.reset();
                    advanced = messages.iter().map(|m| m.id).max().max(since);
                    if messages.len() >= self.settings.page_size {
                        // more are waiting behind this page
                        Duration::ZERO
                    } else {
                        backoff.jittered()
                    }
                }
                Ok(_) => {
                    backoff.grow();
                    backoff.jittered()
                }
                Err(e) => {
                    warn!("Poll tick for {} failed: {}", key, e);
                    backoff.grow();
                    backoff.jittered()
                }
            };

            let report = Tagged::new(key, PollResult { since: issued, result });
            match reports.try_send(report) {
                Ok(()) => since = advanced,
                Err(TrySendError::Full(_)) => {
                    // session is behind; skip this tick and refetch from the same mark
                    debug!("Poll report for {} skipped, session not draining", key);
                    backoff.grow();
                    delay = backoff.jittered();
                }
                Err(TrySendError::Closed(_)) => {
                    debug!("Poll reports for {} have no receiver, stopping", key);
                    break;
                }
            }
        }
        debug!("Poll task {} stopped", key);
    }

    async fn fetch(&self, conversation: ConversationId, since: Option<MessageId>) -> Result<Vec<Message>> {
        match since {
            Some(after) => {
                self.store
                    .list_after(conversation, after, self.settings.page_size)
                    .await
            }
            None => {
                let mut rows = self
                    .store
                    .list_by_conversation(conversation, PageRequest::newest(self.settings.page_size))
                    .await?;
                rows.reverse();
                Ok(rows)
            }
        }
    }
}
