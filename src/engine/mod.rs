//! Coordination engine: workers, join disciplines, and the pool that ties
//! them to a queue and a completion signal.

pub mod group;
pub mod pool;
pub mod worker;

use std::sync::Arc;

pub use group::{FanOut, JoinResult, TaskGroup};
pub use pool::{Pool, PoolConfig};
pub use worker::{Worker, WorkerContext};

use crate::model::{GroupResult, ItemId, Policy};
use crate::resource::ResourceProvider;
use crate::work::UnitOfWork;

/// Drain `items` with `worker_count` workers under `policy`.
///
/// Shorthand for building a [`Pool`] with an unbounded queue and running a
/// single episode on it.
pub async fn run_pool<I, P, W>(
    items: I,
    worker_count: usize,
    policy: Policy,
    provider: Arc<P>,
    work: Arc<W>,
) -> GroupResult
where
    I: IntoIterator<Item = ItemId>,
    I::IntoIter: Send + 'static,
    P: ResourceProvider,
    W: UnitOfWork,
{
    Pool::new(provider, work, PoolConfig::new(worker_count, policy))
        .run(items)
        .await
}
