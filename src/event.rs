//! Structured events recorded by the pool on every coordination step.
//!
//! Consumers read the event log to build audit trails or to assert
//! ordering in tests. Events are the pool's voice; tracing output is the
//! operator's.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::model::{EpisodeId, ItemId, WorkerId};

/// A structured event emitted during an episode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Monotonic sequence number, starting at 1. Consumers can detect gaps.
    pub seq: u64,
    /// When this event occurred.
    pub timestamp: DateTime<Utc>,
    /// What happened.
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    EpisodeStarted {
        episode: EpisodeId,
        workers: usize,
        policy: String,
    },
    WorkerStarted {
        episode: EpisodeId,
        worker: WorkerId,
    },
    ItemClaimed {
        episode: EpisodeId,
        worker: WorkerId,
        item: ItemId,
    },
    ItemCommitted {
        episode: EpisodeId,
        worker: WorkerId,
        item: ItemId,
    },
    ItemFailed {
        episode: EpisodeId,
        worker: WorkerId,
        item: ItemId,
        error: String,
    },
    SignalSet {
        episode: EpisodeId,
        worker: WorkerId,
    },
    WorkerCancelled {
        episode: EpisodeId,
        worker: WorkerId,
        item: Option<ItemId>,
    },
    HandleReleased {
        episode: EpisodeId,
        worker: WorkerId,
    },
    WorkerFinished {
        episode: EpisodeId,
        worker: WorkerId,
        success: bool,
    },
    EpisodeFinished {
        episode: EpisodeId,
        success: bool,
    },
}

impl EventKind {
    /// The episode this event belongs to. Worker ids repeat across
    /// episodes, so filter on this before grouping by worker.
    pub fn episode(&self) -> EpisodeId {
        match self {
            EventKind::EpisodeStarted { episode, .. }
            | EventKind::WorkerStarted { episode, .. }
            | EventKind::ItemClaimed { episode, .. }
            | EventKind::ItemCommitted { episode, .. }
            | EventKind::ItemFailed { episode, .. }
            | EventKind::SignalSet { episode, .. }
            | EventKind::WorkerCancelled { episode, .. }
            | EventKind::HandleReleased { episode, .. }
            | EventKind::WorkerFinished { episode, .. }
            | EventKind::EpisodeFinished { episode, .. } => *episode,
        }
    }
}

/// Append-only, shareable event log. Cloning shares the same log.
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    inner: Arc<Mutex<Vec<Event>>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an event, assigning the next sequence number under the lock.
    pub fn record(&self, kind: EventKind) -> Event {
        let mut events = self.inner.lock();
        let event = Event {
            seq: events.len() as u64 + 1,
            timestamp: Utc::now(),
            kind,
        };
        events.push(event.clone());
        event
    }

    /// Events with `seq > since_seq`.
    pub fn get_events_since(&self, since_seq: u64) -> Vec<Event> {
        self.inner
            .lock()
            .iter()
            .filter(|e| e.seq > since_seq)
            .cloned()
            .collect()
    }

    /// Events recorded for one episode, in sequence order.
    pub fn for_episode(&self, episode: EpisodeId) -> Vec<Event> {
        self.inner
            .lock()
            .iter()
            .filter(|e| e.kind.episode() == episode)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_numbers_are_monotonic_and_gapless() {
        let log = EventLog::new();
        let episode = EpisodeId::new();
        for worker in 0..5 {
            log.record(EventKind::WorkerStarted {
                episode,
                worker: WorkerId(worker),
            });
        }

        let events = log.get_events_since(0);
        assert_eq!(events.len(), 5);
        for (i, event) in events.iter().enumerate() {
            assert_eq!(event.seq, i as u64 + 1);
        }
        assert_eq!(log.get_events_since(3).len(), 2);
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let log = EventLog::new();
        let event = log.record(EventKind::ItemCommitted {
            episode: EpisodeId::new(),
            worker: WorkerId(1),
            item: ItemId(7),
        });

        let json = serde_json::to_value(&event.kind).unwrap();
        assert_eq!(json["type"], "item_committed");
        assert_eq!(json["item"], 7);
    }

    #[test]
    fn for_episode_separates_reused_worker_ids() {
        let log = EventLog::new();
        let first = EpisodeId::new();
        let second = EpisodeId::new();
        for episode in [first, second, first] {
            log.record(EventKind::ItemCommitted {
                episode,
                worker: WorkerId(0),
                item: ItemId(1),
            });
        }

        assert_eq!(log.for_episode(first).len(), 2);
        let second_events = log.for_episode(second);
        assert_eq!(second_events.len(), 1);
        assert_eq!(second_events[0].seq, 2);
    }
}
