//! In-memory resource provider.
//!
//! Records live in a shared map keyed by item. `commit` writes straight
//! through and bumps the record's version. A missing record makes lookup
//! fail; commit and acquire faults can be injected. The store counts every
//! acquire and release so callers can check that no session leaked.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{ResourceHandle, ResourceProvider};
use crate::error::{Error, Result};
use crate::model::{ItemId, Record, WorkerId};

#[derive(Debug, Default)]
struct Faults {
    commit: HashSet<ItemId>,
    acquire: bool,
}

#[derive(Debug, Default)]
struct StoreInner {
    records: Mutex<HashMap<ItemId, Record>>,
    faults: Mutex<Faults>,
    acquired: AtomicUsize,
    released: AtomicUsize,
}

/// Shared in-memory store. Cloning shares the same records and counters.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<StoreInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store holding one empty-payload record per item.
    pub fn seeded(items: impl IntoIterator<Item = ItemId>) -> Self {
        let store = Self::new();
        {
            let mut records = store.inner.records.lock();
            for item in items {
                records.insert(item, Record::new(item, serde_json::Value::Null));
            }
        }
        store
    }

    pub fn insert(&self, record: Record) {
        self.inner.records.lock().insert(record.item, record);
    }

    pub fn remove(&self, item: ItemId) -> Option<Record> {
        self.inner.records.lock().remove(&item)
    }

    pub fn get(&self, item: ItemId) -> Option<Record> {
        self.inner.records.lock().get(&item).cloned()
    }

    /// Make every commit of `item` fail.
    pub fn fail_commit_on(&self, item: ItemId) {
        self.inner.faults.lock().commit.insert(item);
    }

    /// Make every subsequent `acquire` fail.
    pub fn fail_acquire(&self, fail: bool) {
        self.inner.faults.lock().acquire = fail;
    }

    /// Handles handed out so far.
    pub fn acquired(&self) -> usize {
        self.inner.acquired.load(Ordering::Acquire)
    }

    /// Handles given back so far.
    pub fn released(&self) -> usize {
        self.inner.released.load(Ordering::Acquire)
    }

    /// Handles currently out.
    pub fn active(&self) -> usize {
        self.acquired().saturating_sub(self.released())
    }
}

#[async_trait]
impl ResourceProvider for MemoryStore {
    type Handle = MemorySession;

    async fn acquire(&self, worker: WorkerId) -> Result<MemorySession> {
        if self.inner.faults.lock().acquire {
            return Err(Error::Acquire(format!("store refused session for {worker}")));
        }
        self.inner.acquired.fetch_add(1, Ordering::AcqRel);
        Ok(MemorySession {
            store: Arc::clone(&self.inner),
            worker,
            commits: 0,
            released: false,
        })
    }
}

/// One worker's session against a [`MemoryStore`].
#[derive(Debug)]
pub struct MemorySession {
    store: Arc<StoreInner>,
    worker: WorkerId,
    commits: usize,
    released: bool,
}

impl MemorySession {
    pub fn worker(&self) -> WorkerId {
        self.worker
    }

    /// Successful commits through this session.
    pub fn commits(&self) -> usize {
        self.commits
    }
}

#[async_trait]
impl ResourceHandle for MemorySession {
    async fn lookup(&mut self, item: ItemId) -> Result<Record> {
        self.store
            .records
            .lock()
            .get(&item)
            .cloned()
            .ok_or(Error::NotFound(item))
    }

    async fn commit(&mut self, mut record: Record) -> Result<()> {
        if self.store.faults.lock().commit.contains(&record.item) {
            return Err(Error::Commit {
                item: record.item,
                cause: "injected commit fault".to_string(),
            });
        }
        let mut records = self.store.records.lock();
        record.version = records.get(&record.item).map_or(0, |r| r.version) + 1;
        records.insert(record.item, record);
        self.commits += 1;
        Ok(())
    }

    fn release(&mut self) {
        if !std::mem::replace(&mut self.released, true) {
            self.store.released.fetch_add(1, Ordering::AcqRel);
        }
    }
}
