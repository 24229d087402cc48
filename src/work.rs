//! The unit of work run against each record.
//!
//! The pool treats the work as opaque: it may suspend for any length of
//! time and may fail. [`SimulatedWork`] stands in for a variable-latency
//! remote call and backs the CLI and tests.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::model::{ItemId, Record};

/// Transforms one record.
#[async_trait]
pub trait UnitOfWork: Send + Sync + 'static {
    async fn process(&self, record: Record) -> Result<Record>;
}

/// Adapts an async closure into a [`UnitOfWork`].
pub struct FnWork<F>(pub F);

#[async_trait]
impl<F, Fut> UnitOfWork for FnWork<F>
where
    F: Fn(Record) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Record>> + Send + 'static,
{
    async fn process(&self, record: Record) -> Result<Record> {
        (self.0)(record).await
    }
}

/// Sleeps for a configurable latency, then stamps the payload.
///
/// Items listed with [`fail_on`](Self::fail_on) fail with [`Error::Work`]
/// after the latency has elapsed.
#[derive(Debug, Clone, Default)]
pub struct SimulatedWork {
    latency: Duration,
    per_item: HashMap<ItemId, Duration>,
    failing: HashSet<ItemId>,
}

impl SimulatedWork {
    pub fn new(latency: Duration) -> Self {
        Self {
            latency,
            ..Default::default()
        }
    }

    pub fn fail_on(mut self, items: impl IntoIterator<Item = ItemId>) -> Self {
        self.failing.extend(items);
        self
    }

    /// Override the latency for one item.
    pub fn latency_for(mut self, item: ItemId, latency: Duration) -> Self {
        self.per_item.insert(item, latency);
        self
    }
}

#[async_trait]
impl UnitOfWork for SimulatedWork {
    async fn process(&self, mut record: Record) -> Result<Record> {
        let latency = self
            .per_item
            .get(&record.item)
            .copied()
            .unwrap_or(self.latency);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        if self.failing.contains(&record.item) {
            return Err(Error::Work {
                item: record.item,
                cause: "simulated failure".to_string(),
            });
        }

        record.payload = serde_json::json!({
            "processed": true,
            "previous": record.payload,
        });
        Ok(record)
    }
}
