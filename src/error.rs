//! Error types for workpool.

use std::time::Duration;

use thiserror::Error;

use crate::model::{ItemId, WorkerFailure, WorkerState};

#[derive(Debug, Error)]
pub enum Error {
    #[error("queue is closed")]
    ClosedQueue,

    #[error("queue is full")]
    QueueFull,

    #[error("record not found for item {0}")]
    NotFound(ItemId),

    #[error("work failed on item {item}: {cause}")]
    Work { item: ItemId, cause: String },

    #[error("commit failed on item {item}: {cause}")]
    Commit { item: ItemId, cause: String },

    #[error("failed to acquire resource handle: {0}")]
    Acquire(String),

    #[error("cancelled")]
    Cancelled,

    #[error("episode deadline of {0:?} exceeded")]
    Timeout(Duration),

    #[error(transparent)]
    Aggregate(#[from] AggregateFailure),

    #[error("worker panicked: {0}")]
    WorkerPanic(String),

    #[error("invalid worker state transition: {from} -> {to}")]
    InvalidTransition { from: WorkerState, to: WorkerState },

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether this error is a cooperative cancellation rather than a root cause.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Every root-cause failure collected by a fail-fast group, in worker order.
///
/// Workers that merely observed the group's cancellation are listed in
/// `cancelled` and never appear in `failures`.
#[derive(Debug, Error)]
#[error("{} worker(s) failed: {}", failures.len(), summarize(failures))]
pub struct AggregateFailure {
    pub failures: Vec<WorkerFailure>,
    pub cancelled: Vec<crate::model::WorkerId>,
}

impl AggregateFailure {
    pub fn len(&self) -> usize {
        self.failures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }
}

fn summarize(failures: &[WorkerFailure]) -> String {
    failures
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}
