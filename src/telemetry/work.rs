//! Episode and worker span helpers.
//!
//! Provides span creation and state-transition recording for workers
//! running inside a coordination episode.

use tracing::Span;

use crate::model::{EpisodeId, WorkerId, WorkerState};

/// Start a span covering one coordination episode.
///
/// The `pool.result` field is declared empty and filled once the group
/// has joined via [`record_episode_result`].
pub fn start_episode_span(episode: &EpisodeId, policy: &str, workers: usize) -> Span {
    tracing::info_span!(
        "pool.episode",
        "pool.episode" = %episode,
        "pool.policy" = policy,
        "pool.workers" = workers,
        "pool.result" = tracing::field::Empty,
    )
}

/// Record the episode's final result on its span.
pub fn record_episode_result(span: &Span, result: &str) {
    span.record("pool.result", result);
}

/// Start a span for one worker's run loop.
pub fn start_worker_span(episode: &EpisodeId, worker: WorkerId) -> Span {
    tracing::info_span!(
        "pool.worker",
        "pool.episode" = %episode,
        "worker.id" = worker.0,
        "worker.state" = tracing::field::Empty,
    )
}

/// Record a worker state transition on the given span.
///
/// Emits a tracing `debug` event scoped to the span and updates the span's
/// `worker.state` field.
pub fn record_state_transition(span: &Span, from: WorkerState, to: WorkerState) {
    span.record("worker.state", tracing::field::display(to));
    span.in_scope(|| {
        tracing::debug!(%from, %to, "state_transition");
    });
}
