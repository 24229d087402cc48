//! The pool: one configured set of workers, run once per episode.
//!
//! An episode is a fresh queue, completion signal and cancellation token,
//! a producer task feeding the queue from the caller's items, and
//! `worker_count` workers joined under the configured policy.

use std::sync::Arc;
use std::time::Instant;

use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info};

use super::group::{FanOut, JoinResult, TaskGroup};
use super::worker::{Worker, WorkerContext};
use crate::error::AggregateFailure;
use crate::event::{EventKind, EventLog};
use crate::model::{
    EpisodeId, GroupResult, ItemId, JoinMode, Policy, Summary, WorkerId, WorkerOutcome,
};
use crate::queue::WorkQueue;
use crate::resource::ResourceProvider;
use crate::signal::CompletionSignal;
use crate::telemetry::metrics;
use crate::telemetry::work::{record_episode_result, start_episode_span};
use crate::work::UnitOfWork;

/// Configuration for a pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Number of concurrent workers (at least 1).
    pub worker_count: usize,
    /// Join discipline.
    pub policy: Policy,
    /// Bound on undelivered items; `None` for an unbounded queue.
    pub queue_capacity: Option<usize>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            policy: Policy::default(),
            queue_capacity: None,
        }
    }
}

impl PoolConfig {
    pub fn new(worker_count: usize, policy: Policy) -> Self {
        Self {
            worker_count: worker_count.max(1),
            policy,
            ..Default::default()
        }
    }

    /// Set the queue bound.
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = Some(capacity);
        self
    }
}

/// A worker pool over one resource provider and one unit of work.
pub struct Pool<P, W> {
    provider: Arc<P>,
    work: Arc<W>,
    config: PoolConfig,
    events: EventLog,
}

impl<P, W> Pool<P, W>
where
    P: ResourceProvider,
    W: UnitOfWork,
{
    pub fn new(provider: Arc<P>, work: Arc<W>, mut config: PoolConfig) -> Self {
        config.worker_count = config.worker_count.max(1);
        Self {
            provider,
            work,
            config,
            events: EventLog::new(),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Events from every episode this pool has run.
    pub fn events(&self) -> &EventLog {
        &self.events
    }

    /// Run one episode over `items` under the configured policy.
    ///
    /// With `Policy::Unstructured { join: JoinMode::Detach }` this waits on
    /// the completion signal without having looked at any worker outcome. If
    /// every worker that could have set the signal failed, it never returns.
    pub async fn run<I>(&self, items: I) -> GroupResult
    where
        I: IntoIterator<Item = ItemId>,
        I::IntoIter: Send + 'static,
    {
        let episode = EpisodeId::new();
        let policy = self.config.policy;
        let span = start_episode_span(&episode, policy.name(), self.config.worker_count);

        async {
            let started = Instant::now();
            self.events.record(EventKind::EpisodeStarted {
                episode,
                workers: self.config.worker_count,
                policy: policy.name().to_string(),
            });
            info!("episode started");

            let result = match policy {
                Policy::Structured { deadline } => {
                    let signal = CompletionSignal::new();
                    let group = self.start_scope(episode, items, signal.clone(), deadline);
                    let result = group.join().await;
                    if result.is_success() {
                        signal.wait().await;
                    }
                    result
                }
                Policy::Unstructured { join } => {
                    let fan = self.start_fan_out(episode, items);
                    self.join_fan_out(episode, fan, join).await
                }
            };

            let label = match &result {
                GroupResult::Success(_) => "success",
                GroupResult::Failed(_) => "failed",
                GroupResult::TimedOut { .. } => "timed_out",
            };
            record_episode_result(&tracing::Span::current(), label);
            metrics::episode_duration_ms().record(
                started.elapsed().as_secs_f64() * 1000.0,
                &[
                    KeyValue::new("policy", policy.name()),
                    KeyValue::new("result", label),
                ],
            );
            self.events.record(EventKind::EpisodeFinished {
                episode,
                success: result.is_success(),
            });
            info!(result = label, "episode finished");
            result
        }
        .instrument(span)
        .await
    }

    /// Start an unstructured episode: workers on detached tasks.
    pub fn fan_out<I>(&self, items: I) -> FanOut
    where
        I: IntoIterator<Item = ItemId>,
        I::IntoIter: Send + 'static,
    {
        self.start_fan_out(EpisodeId::new(), items)
    }

    /// Start a structured episode. The deadline comes from the configured
    /// policy when it is structured.
    pub fn scope<I>(&self, items: I) -> (TaskGroup, CompletionSignal)
    where
        I: IntoIterator<Item = ItemId>,
        I::IntoIter: Send + 'static,
    {
        let deadline = match self.config.policy {
            Policy::Structured { deadline } => deadline,
            Policy::Unstructured { .. } => None,
        };
        let signal = CompletionSignal::new();
        let group = self.start_scope(EpisodeId::new(), items, signal.clone(), deadline);
        (group, signal)
    }

    fn start_fan_out<I>(&self, episode: EpisodeId, items: I) -> FanOut
    where
        I: IntoIterator<Item = ItemId>,
        I::IntoIter: Send + 'static,
    {
        // Never cancelled: nothing in a fan-out tears its siblings down.
        let cancel = CancellationToken::new();
        let ctx = self.context(episode, "unstructured", CompletionSignal::new(), cancel.clone());
        let mut fan = FanOut::new(episode, ctx.queue.clone(), ctx.signal.clone());

        spawn_producer(ctx.queue.clone(), items.into_iter(), cancel);
        for i in 0..self.config.worker_count {
            let worker = Worker::new(WorkerId(i), ctx.clone());
            fan.spawn(worker.id(), worker.run());
        }
        debug!(%episode, workers = fan.len(), "fan-out spawned");
        fan
    }

    fn start_scope<I>(
        &self,
        episode: EpisodeId,
        items: I,
        signal: CompletionSignal,
        deadline: Option<std::time::Duration>,
    ) -> TaskGroup
    where
        I: IntoIterator<Item = ItemId>,
        I::IntoIter: Send + 'static,
    {
        let cancel = CancellationToken::new();
        let ctx = self.context(episode, "structured", signal, cancel.clone());
        let mut group = TaskGroup::new(episode, cancel.clone(), deadline);

        group.attach_producer(spawn_producer(ctx.queue.clone(), items.into_iter(), cancel));
        for i in 0..self.config.worker_count {
            let worker = Worker::new(WorkerId(i), ctx.clone());
            group.spawn(worker.id(), worker.run());
        }
        debug!(%episode, workers = self.config.worker_count, ?deadline, "task group spawned");
        group
    }

    async fn join_fan_out(
        &self,
        episode: EpisodeId,
        fan: FanOut,
        join: JoinMode,
    ) -> GroupResult {
        let signal = fan.signal().clone();
        let processed = match join {
            JoinMode::First => match fan.join_first().await {
                JoinResult::AllSucceeded { processed } => Some(processed),
                JoinResult::FirstFailure(failure) => {
                    return GroupResult::Failed(AggregateFailure {
                        failures: vec![failure],
                        cancelled: Vec::new(),
                    });
                }
            },
            JoinMode::All => {
                let mut processed = vec![0; self.config.worker_count];
                let mut failures = Vec::new();
                for outcome in fan.join_all().await {
                    match outcome {
                        WorkerOutcome::Success { worker, processed: n } => {
                            if let Some(slot) = processed.get_mut(worker.0) {
                                *slot = n;
                            }
                        }
                        WorkerOutcome::Failure(failure) => failures.push(failure),
                    }
                }
                if !failures.is_empty() {
                    return GroupResult::Failed(AggregateFailure {
                        failures,
                        cancelled: Vec::new(),
                    });
                }
                Some(processed)
            }
            JoinMode::Detach => {
                fan.detach();
                None
            }
        };

        signal.wait().await;

        // A detached fan-out has no outcomes to count from.
        let processed = processed.unwrap_or_else(|| self.committed_per_worker(episode));
        GroupResult::Success(Summary { episode, processed })
    }

    /// Items each worker of `episode` committed, by worker id. Workers left
    /// running by earlier detached episodes share ids but not the episode.
    fn committed_per_worker(&self, episode: EpisodeId) -> Vec<usize> {
        let mut processed = vec![0; self.config.worker_count];
        for event in self.events.for_episode(episode) {
            if let EventKind::ItemCommitted { worker, .. } = event.kind {
                if let Some(slot) = processed.get_mut(worker.0) {
                    *slot += 1;
                }
            }
        }
        processed
    }

    fn context(
        &self,
        episode: EpisodeId,
        policy: &'static str,
        signal: CompletionSignal,
        cancel: CancellationToken,
    ) -> WorkerContext<P, W> {
        let queue = match self.config.queue_capacity {
            Some(capacity) => WorkQueue::bounded(capacity),
            None => WorkQueue::unbounded(),
        };
        WorkerContext {
            episode,
            policy,
            queue,
            signal,
            cancel,
            provider: Arc::clone(&self.provider),
            work: Arc::clone(&self.work),
            events: self.events.clone(),
        }
    }
}

/// Feed `items` into `queue`, then close it. Stops early (and still
/// closes) if `cancel` fires or the queue is closed under it.
fn spawn_producer<I>(queue: WorkQueue, items: I, cancel: CancellationToken) -> JoinHandle<()>
where
    I: Iterator<Item = ItemId> + Send + 'static,
{
    tokio::spawn(async move {
        let feed = async {
            let mut fed = 0usize;
            for item in items {
                if let Err(e) = queue.enqueue(item).await {
                    debug!(error = %e, fed, "producer stopped early");
                    return;
                }
                fed += 1;
            }
            debug!(fed, "producer finished");
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => debug!("producer cancelled"),
            _ = feed => {}
        }
        queue.close();
    })
}
