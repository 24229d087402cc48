//! Coordination groups: how a set of workers is joined.
//!
//! [`FanOut`] is the unstructured discipline. Workers run on detached
//! tasks and the caller decides how much of their outcome to look at,
//! including nothing at all.
//!
//! [`TaskGroup`] is the structured discipline. Workers run inside one
//! `JoinSet`; the first root-cause failure cancels every sibling, and the
//! group only returns once all of them have stopped.

use std::any::Any;
use std::collections::BTreeSet;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::FutureExt;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::error::{AggregateFailure, Error};
use crate::model::{EpisodeId, GroupResult, Summary, WorkerFailure, WorkerId, WorkerOutcome};
use crate::queue::WorkQueue;
use crate::signal::CompletionSignal;

/// Turn a panic that escaped the worker loop (outside any item) into a
/// failure outcome.
pub(crate) fn supervised<F>(worker: WorkerId, run: F) -> impl Future<Output = WorkerOutcome>
where
    F: Future<Output = WorkerOutcome>,
{
    AssertUnwindSafe(run).catch_unwind().map(move |result| {
        result.unwrap_or_else(|payload| {
            WorkerOutcome::Failure(WorkerFailure {
                worker,
                item: None,
                error: Error::WorkerPanic(panic_message(payload.as_ref())),
            })
        })
    })
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// A task that ended without reporting an outcome (aborted, or the
/// runtime shut down under it).
fn lost(worker: WorkerId) -> WorkerOutcome {
    WorkerOutcome::Failure(WorkerFailure {
        worker,
        item: None,
        error: Error::Cancelled,
    })
}

// ---------------------------------------------------------------------------
// Unstructured
// ---------------------------------------------------------------------------

/// Result of [`FanOut::join_first`].
#[derive(Debug)]
#[must_use = "a JoinResult may carry a worker failure"]
pub enum JoinResult {
    /// Every worker succeeded; items committed per worker, by worker id.
    AllSucceeded { processed: Vec<usize> },
    /// The first failure to arrive. Siblings were left running and their
    /// outcomes will never be delivered.
    FirstFailure(WorkerFailure),
}

/// Workers spawned on independent tasks.
///
/// The outcomes have to be consumed through one of the joining methods.
/// [`detach`](Self::detach) consumes them by throwing them away: failures
/// disappear without an error or a log line, and anything waiting on the
/// completion signal may wait forever.
#[must_use = "dropping a FanOut detaches its workers and loses their failures"]
pub struct FanOut {
    episode: EpisodeId,
    handles: Vec<(WorkerId, JoinHandle<WorkerOutcome>)>,
    queue: WorkQueue,
    signal: CompletionSignal,
}

impl FanOut {
    pub(crate) fn new(episode: EpisodeId, queue: WorkQueue, signal: CompletionSignal) -> Self {
        Self {
            episode,
            handles: Vec::new(),
            queue,
            signal,
        }
    }

    /// Spawn `run` immediately on its own task.
    pub(crate) fn spawn<F>(&mut self, worker: WorkerId, run: F)
    where
        F: Future<Output = WorkerOutcome> + Send + 'static,
    {
        let handle = tokio::spawn(supervised(worker, run));
        self.handles.push((worker, handle));
    }

    pub fn episode(&self) -> EpisodeId {
        self.episode
    }

    pub fn signal(&self) -> &CompletionSignal {
        &self.signal
    }

    pub fn queue(&self) -> &WorkQueue {
        &self.queue
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Wait until every worker succeeds or the first one fails, whichever
    /// comes first. On failure the remaining workers keep running detached.
    pub async fn join_first(self) -> JoinResult {
        let mut processed = vec![0; self.handles.len()];
        let mut pending: FuturesUnordered<_> = self
            .handles
            .into_iter()
            .map(|(worker, handle)| async move { (worker, handle.await) })
            .collect();

        while let Some((worker, joined)) = pending.next().await {
            let outcome = joined.unwrap_or_else(|_| lost(worker));
            match outcome {
                WorkerOutcome::Success { worker, processed: n } => {
                    if let Some(slot) = processed.get_mut(worker.0) {
                        *slot = n;
                    }
                }
                WorkerOutcome::Failure(failure) => {
                    error!(
                        episode = %self.episode,
                        worker = %failure.worker,
                        item = ?failure.item,
                        error = %failure.error,
                        still_running = pending.len(),
                        "worker failed"
                    );
                    return JoinResult::FirstFailure(failure);
                }
            }
        }
        JoinResult::AllSucceeded { processed }
    }

    /// Wait for every worker and return all outcomes in worker order.
    /// Nothing is logged; scanning for failures is up to the caller.
    pub async fn join_all(self) -> Vec<WorkerOutcome> {
        let mut outcomes = Vec::with_capacity(self.handles.len());
        for (worker, handle) in self.handles {
            outcomes.push(handle.await.unwrap_or_else(|_| lost(worker)));
        }
        outcomes
    }

    /// Drop every outcome unseen. The workers keep running.
    pub fn detach(self) {
        drop(self.handles);
    }
}

// ---------------------------------------------------------------------------
// Structured
// ---------------------------------------------------------------------------

/// Fail-fast group scope.
///
/// Dropping the group (for instance when the future awaiting
/// [`join`](Self::join) is itself cancelled) aborts every worker still in it.
pub struct TaskGroup {
    episode: EpisodeId,
    set: JoinSet<(WorkerId, WorkerOutcome)>,
    spawned: BTreeSet<WorkerId>,
    cancel: CancellationToken,
    deadline: Option<Duration>,
    started: Instant,
    /// Fed by the pool; aborted when the group finishes.
    producer: Option<JoinHandle<()>>,
}

impl TaskGroup {
    pub(crate) fn new(
        episode: EpisodeId,
        cancel: CancellationToken,
        deadline: Option<Duration>,
    ) -> Self {
        Self {
            episode,
            set: JoinSet::new(),
            spawned: BTreeSet::new(),
            cancel,
            deadline,
            started: Instant::now(),
            producer: None,
        }
    }

    pub(crate) fn spawn<F>(&mut self, worker: WorkerId, run: F)
    where
        F: Future<Output = WorkerOutcome> + Send + 'static,
    {
        let run = supervised(worker, run);
        self.set.spawn(async move { (worker, run.await) });
        self.spawned.insert(worker);
    }

    pub(crate) fn attach_producer(&mut self, producer: JoinHandle<()>) {
        self.producer = Some(producer);
    }

    /// Token shared with every worker in the group.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Wait for every worker to stop and aggregate their outcomes.
    ///
    /// The first root-cause failure cancels all siblings. If a deadline is
    /// set and elapses first, every worker is cancelled and the result is
    /// [`GroupResult::TimedOut`].
    pub async fn join(mut self) -> GroupResult {
        let deadline_at = self.deadline.map(|d| self.started + d);
        let mut timed_out = false;
        let mut outcomes = Vec::with_capacity(self.spawned.len());
        let mut unreported = self.spawned.clone();

        loop {
            let next = match deadline_at {
                Some(at) if !timed_out => {
                    match tokio::time::timeout_at(at, self.set.join_next()).await {
                        Ok(next) => next,
                        Err(_) => {
                            timed_out = true;
                            warn!(
                                episode = %self.episode,
                                running = self.set.len(),
                                "episode deadline exceeded, cancelling workers"
                            );
                            self.cancel.cancel();
                            continue;
                        }
                    }
                }
                _ => self.set.join_next().await,
            };

            let Some(joined) = next else { break };
            let (worker, outcome) = match joined {
                Ok(reported) => reported,
                Err(e) => {
                    warn!(episode = %self.episode, error = %e, "worker task ended without an outcome");
                    continue;
                }
            };
            unreported.remove(&worker);

            if let Some(failure) = outcome.failure() {
                if !failure.is_cancellation() && !self.cancel.is_cancelled() {
                    error!(
                        episode = %self.episode,
                        worker = %failure.worker,
                        item = ?failure.item,
                        error = %failure.error,
                        "worker failed, cancelling siblings"
                    );
                    self.cancel.cancel();
                }
            }
            outcomes.push(outcome);
        }

        outcomes.extend(unreported.into_iter().map(lost));
        if let Some(producer) = self.producer.take() {
            producer.abort();
        }

        let result = aggregate(self.episode, outcomes, self.spawned.len());
        if timed_out {
            let deadline = self.deadline.unwrap_or_default();
            let failures = match result {
                GroupResult::Failed(aggregate) => aggregate
                    .failures
                    .into_iter()
                    .filter(|f| !f.is_cancellation())
                    .collect(),
                _ => Vec::new(),
            };
            return GroupResult::TimedOut { deadline, failures };
        }
        result
    }
}

impl Drop for TaskGroup {
    fn drop(&mut self) {
        if let Some(producer) = self.producer.take() {
            producer.abort();
        }
        if !self.set.is_empty() {
            debug!(episode = %self.episode, running = self.set.len(), "aborting group workers");
        }
    }
}

/// Fold worker outcomes into a group result, sorted by worker id.
///
/// Cancellations count as failures only when nothing else failed (the
/// group was torn down from outside); otherwise they are listed apart.
fn aggregate(episode: EpisodeId, mut outcomes: Vec<WorkerOutcome>, workers: usize) -> GroupResult {
    outcomes.sort_by_key(WorkerOutcome::worker);

    let mut processed = vec![0; workers];
    let mut failures = Vec::new();
    let mut cancellations = Vec::new();
    for outcome in outcomes {
        match outcome {
            WorkerOutcome::Success { worker, processed: n } => {
                if let Some(slot) = processed.get_mut(worker.0) {
                    *slot = n;
                }
            }
            WorkerOutcome::Failure(f) if f.is_cancellation() => cancellations.push(f),
            WorkerOutcome::Failure(f) => failures.push(f),
        }
    }

    if failures.is_empty() && cancellations.is_empty() {
        return GroupResult::Success(Summary { episode, processed });
    }

    if failures.is_empty() {
        return GroupResult::Failed(AggregateFailure {
            failures: cancellations,
            cancelled: Vec::new(),
        });
    }

    GroupResult::Failed(AggregateFailure {
        failures,
        cancelled: cancellations.into_iter().map(|f| f.worker).collect(),
    })
}
