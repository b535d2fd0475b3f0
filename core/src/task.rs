/// Task tagging: every fetch/send result carries the (conversation, generation)
/// it was dispatched for, so completions for a closed or switched
/// conversation can be recognised and dropped.
use crate::types::ConversationId;
use serde::Serialize;
use std::fmt;

/// Bumped every time the session opens, switches or closes a conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize)]
pub struct Generation(pub u64);

impl Generation {
    pub fn next(self) -> Self {
        Generation(self.0 + 1)
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "g{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct TaskKey {
    pub conversation: ConversationId,
    pub generation: Generation,
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.conversation, self.generation)
    }
}

/// A result tagged with the key it was dispatched under
#[derive(Debug)]
pub struct Tagged<T> {
    pub key: TaskKey,
    pub value: T,
}

impl<T> Tagged<T> {
    pub fn new(key: TaskKey, value: T) -> Self {
        Self { key, value }
    }

    /// Unwrap the value if it still belongs to `current`
    pub fn accept(self, current: Option<TaskKey>) -> Applied<T> {
        if current == Some(self.key) {
            Applied::Fresh(self.value)
        } else {
            Applied::Stale
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum Applied<T> {
    Fresh(T),
    /// Dispatched for a conversation/generation that is no longer current
    Stale,
}

impl<T> Applied<T> {
    pub fn is_stale(&self) -> bool {
        matches!(self, Applied::Stale)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(conversation: i64, generation: u64) -> TaskKey {
        TaskKey {
            conversation: ConversationId(conversation),
            generation: Generation(generation),
        }
    }

    #[test]
    fn test_accept_matching_key() {
        let tagged = Tagged::new(key(1, 3), "page");
        assert_eq!(tagged.accept(Some(key(1, 3))), Applied::Fresh("page"));
    }

    #[test]
    fn test_reject_old_generation_same_conversation() {
        // Reopening the same conversation still invalidates older work
        let tagged = Tagged::new(key(1, 3), ());
        assert!(tagged.accept(Some(key(1, 4))).is_stale());
    }

    #[test]
    fn test_reject_other_conversation_and_closed() {
        assert!(Tagged::new(key(1, 1), ()).accept(Some(key(2, 1))).is_stale());
        assert!(Tagged::new(key(1, 1), ()).accept(None).is_stale());
    }
}
