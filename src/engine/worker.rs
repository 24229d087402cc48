//! Worker run loop: pull, lookup, process, commit, repeat until exhausted.
//!
//! Every suspension point (acquire, dequeue, lookup, process, commit) is
//! raced against the episode's cancellation token, so a cancelled worker
//! stops at its next await and drops its lease. Dequeue checks the token
//! first: a cancelled worker never takes a new item.
//!
//! A worker never logs its own failure. The failure travels in the outcome
//! and the event log; whether anyone logs it is up to the joining group.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use opentelemetry::KeyValue;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, info, warn};

use super::group::panic_message;
use crate::error::{Error, Result};
use crate::event::{EventKind, EventLog};
use crate::model::{EpisodeId, ItemId, WorkerFailure, WorkerId, WorkerOutcome, WorkerState};
use crate::queue::{Dequeued, WorkQueue};
use crate::resource::{Lease, ResourceHandle, ResourceProvider};
use crate::signal::CompletionSignal;
use crate::telemetry::metrics;
use crate::telemetry::work::{record_state_transition, start_worker_span};
use crate::work::UnitOfWork;

/// Everything a worker shares with its siblings for one episode.
pub struct WorkerContext<P, W> {
    pub episode: EpisodeId,
    pub policy: &'static str,
    pub queue: WorkQueue,
    pub signal: CompletionSignal,
    pub cancel: CancellationToken,
    pub provider: Arc<P>,
    pub work: Arc<W>,
    pub events: EventLog,
}

impl<P, W> Clone for WorkerContext<P, W> {
    fn clone(&self) -> Self {
        Self {
            episode: self.episode,
            policy: self.policy,
            queue: self.queue.clone(),
            signal: self.signal.clone(),
            cancel: self.cancel.clone(),
            provider: Arc::clone(&self.provider),
            work: Arc::clone(&self.work),
            events: self.events.clone(),
        }
    }
}

/// Race `fut` against `cancel`. A step that is already complete reports its
/// own result; cancellation wins whenever the step would suspend.
async fn cancellable<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        result = fut => result,
        _ = cancel.cancelled() => Err(Error::Cancelled),
    }
}

/// One queue consumer.
pub struct Worker<P, W> {
    id: WorkerId,
    ctx: WorkerContext<P, W>,
    state: WorkerState,
    processed: usize,
    span: Span,
}

impl<P, W> Worker<P, W>
where
    P: ResourceProvider,
    W: UnitOfWork,
{
    pub fn new(id: WorkerId, ctx: WorkerContext<P, W>) -> Self {
        let span = start_worker_span(&ctx.episode, id);
        Self {
            id,
            ctx,
            state: WorkerState::Idle,
            processed: 0,
            span,
        }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// Run the loop to completion and report how it ended.
    pub async fn run(mut self) -> WorkerOutcome {
        let span = self.span.clone();
        async move { self.run_inner().await }.instrument(span).await
    }

    async fn run_inner(&mut self) -> WorkerOutcome {
        self.ctx.events.record(EventKind::WorkerStarted {
            episode: self.ctx.episode,
            worker: self.id,
        });

        let acquired = cancellable(
            &self.ctx.cancel,
            Lease::acquire(self.ctx.provider.as_ref(), self.id),
        )
        .await;

        let result = match acquired {
            Ok(mut lease) => {
                let result = self.drain(&mut lease).await;
                drop(lease);
                self.ctx.events.record(EventKind::HandleReleased {
                    episode: self.ctx.episode,
                    worker: self.id,
                });
                result
            }
            Err(e) => Err((None, e)),
        };

        let outcome = match result {
            Ok(()) => {
                info!(processed = self.processed, "worker finished");
                metrics::worker_outcomes().add(
                    1,
                    &[
                        KeyValue::new("policy", self.ctx.policy),
                        KeyValue::new("result", "success"),
                    ],
                );
                WorkerOutcome::Success {
                    worker: self.id,
                    processed: self.processed,
                }
            }
            Err((item, error)) => self.fail(item, error),
        };

        self.settle(WorkerState::Terminated);
        self.ctx.events.record(EventKind::WorkerFinished {
            episode: self.ctx.episode,
            worker: self.id,
            success: outcome.is_success(),
        });
        outcome
    }

    /// Pull and process items until the queue is exhausted or the signal is
    /// set. Errors carry the item held at the time, if any.
    async fn drain(
        &mut self,
        lease: &mut Lease<P::Handle>,
    ) -> std::result::Result<(), (Option<ItemId>, Error)> {
        self.transition(WorkerState::Pulling)
            .map_err(|e| (None, e))?;

        loop {
            if self.ctx.signal.is_set() {
                debug!("completion signal already set, stopping");
                return Ok(());
            }

            let delivery = match self.ctx.queue.dequeue_or_cancel(&self.ctx.cancel).await {
                Ok(Dequeued::Item(delivery)) => delivery,
                Ok(Dequeued::Exhausted) => {
                    self.signal_done().map_err(|e| (None, e))?;
                    return Ok(());
                }
                Err(e) => return Err((None, e)),
            };

            let item = delivery.item();
            self.transition(WorkerState::Processing)
                .map_err(|e| (Some(item), e))?;
            self.ctx.events.record(EventKind::ItemClaimed {
                episode: self.ctx.episode,
                worker: self.id,
                item,
            });

            // A panic in a collaborator fails this item like any other error.
            AssertUnwindSafe(self.process_item(lease, item))
                .catch_unwind()
                .await
                .unwrap_or_else(|payload| {
                    Err(Error::WorkerPanic(panic_message(payload.as_ref())))
                })
                .map_err(|e| (Some(item), e))?;

            self.processed += 1;
            self.ctx.events.record(EventKind::ItemCommitted {
                episode: self.ctx.episode,
                worker: self.id,
                item,
            });
            // Settle before checking exhaustion so our own delivery counts.
            drop(delivery);
            metrics::items_processed().add(1, &[KeyValue::new("result", "committed")]);
            debug!(%item, "item committed");

            if self.ctx.queue.is_exhausted() {
                self.signal_done().map_err(|e| (Some(item), e))?;
                return Ok(());
            }
            self.transition(WorkerState::Pulling)
                .map_err(|e| (Some(item), e))?;
        }
    }

    async fn process_item(&self, lease: &mut Lease<P::Handle>, item: ItemId) -> Result<()> {
        let cancel = &self.ctx.cancel;
        let record = cancellable(cancel, lease.lookup(item)).await?;
        let record = cancellable(cancel, self.ctx.work.process(record)).await?;
        cancellable(cancel, lease.commit(record)).await
    }

    fn signal_done(&mut self) -> Result<()> {
        self.transition(WorkerState::SignalingDone)?;
        if self.ctx.signal.set() {
            self.ctx.events.record(EventKind::SignalSet {
                episode: self.ctx.episode,
                worker: self.id,
            });
            info!("queue exhausted, completion signal set");
        }
        Ok(())
    }

    /// Build the failure outcome. Never touches the completion signal.
    fn fail(&mut self, item: Option<ItemId>, error: Error) -> WorkerOutcome {
        if error.is_cancelled() {
            self.settle(WorkerState::Cancelled);
            self.ctx.events.record(EventKind::WorkerCancelled {
                episode: self.ctx.episode,
                worker: self.id,
                item,
            });
            if item.is_some() {
                metrics::items_processed().add(1, &[KeyValue::new("result", "cancelled")]);
            }
            debug!(?item, "worker cancelled");
        } else {
            self.settle(WorkerState::Failed);
            if let Some(item) = item {
                self.ctx.events.record(EventKind::ItemFailed {
                    episode: self.ctx.episode,
                    worker: self.id,
                    item,
                    error: error.to_string(),
                });
                metrics::items_processed().add(1, &[KeyValue::new("result", "failed")]);
            }
        }

        let result = if error.is_cancelled() {
            "cancelled"
        } else {
            "failure"
        };
        metrics::worker_outcomes().add(
            1,
            &[
                KeyValue::new("policy", self.ctx.policy),
                KeyValue::new("result", result),
            ],
        );

        WorkerOutcome::Failure(WorkerFailure {
            worker: self.id,
            item,
            error,
        })
    }

    fn transition(&mut self, to: WorkerState) -> Result<()> {
        if !self.state.can_transition_to(to) {
            return Err(Error::InvalidTransition {
                from: self.state,
                to,
            });
        }
        record_state_transition(&self.span, self.state, to);
        self.state = to;
        Ok(())
    }

    /// Move to a terminal-path state, logging rather than failing if the
    /// move is not allowed from where the loop stopped.
    fn settle(&mut self, to: WorkerState) {
        if self.state == to {
            return;
        }
        if let Err(e) = self.transition(to) {
            warn!(error = %e, "forcing worker state");
            self.state = to;
        }
    }
}
