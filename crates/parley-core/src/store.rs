//! Message Store: the loop hands it every message whose status changed.

use crate::model::{Message, MessageStatus};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Receives messages for persistence or display.
///
/// The loop calls `record` when a message is created and again when it
/// becomes `done`. Implementations must tolerate repeated records of the
/// same id and keep the latest.
pub trait MessageStore: Send + Sync {
    fn record(&self, message: &Message);

    /// Drop everything (conversation reset).
    fn clear(&self);

    /// All messages in creation order.
    fn messages(&self) -> Vec<Message>;
}

/// Hot in-memory store keyed by message id.
#[derive(Clone, Default)]
pub struct InMemoryMessageStore {
    /// id -> (arrival sequence, latest version)
    entries: Arc<DashMap<Uuid, (u64, Message)>>,
    seq: Arc<AtomicU64>,
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &Uuid) -> Option<Message> {
        self.entries.get(id).map(|entry| entry.value().1.clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Messages still marked `streaming`.
    pub fn streaming_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.value().1.status() == MessageStatus::Streaming)
            .count()
    }
}

impl MessageStore for InMemoryMessageStore {
    fn record(&self, message: &Message) {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        self.entries
            .entry(message.id)
            .and_modify(|(_, existing)| *existing = message.clone())
            .or_insert_with(|| (seq, message.clone()));
        tracing::debug!(
            target: "parley::store",
            id = %message.id,
            status = ?message.status(),
            "message recorded"
        );
    }

    fn clear(&self) {
        self.entries.clear();
    }

    fn messages(&self) -> Vec<Message> {
        let mut all: Vec<(u64, Message)> = self
            .entries
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        all.sort_by_key(|(seq, _)| *seq);
        all.into_iter().map(|(_, m)| m).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Utterance;

    #[test]
    fn keeps_latest_version_in_creation_order() {
        let store = InMemoryMessageStore::new();
        let user = Message::from_utterance(&Utterance::typed("Hello"));
        let mut reply = Message::assistant_streaming();

        store.record(&user);
        store.record(&reply);
        assert_eq!(store.streaming_count(), 1);

        reply.apply_chunk("Hi there!").unwrap();
        reply.finish();
        store.record(&reply);

        let all = store.messages();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].text(), "Hello");
        assert_eq!(all[1].text(), "Hi there!");
        assert_eq!(all[1].status(), MessageStatus::Done);
        assert_eq!(store.streaming_count(), 0);
    }

    #[test]
    fn clear_empties_the_store() {
        let store = InMemoryMessageStore::new();
        store.record(&Message::error_notice("offline"));
        assert_eq!(store.len(), 1);
        store.clear();
        assert!(store.is_empty());
        assert!(store.messages().is_empty());
    }
}
