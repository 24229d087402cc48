//! Per-worker resource handles.
//!
//! Each worker acquires exactly one handle (a database session, say) for
//! its whole run loop. Handles are never shared between workers; using one
//! handle from two workers is outside the contract of every provider.
//!
//! The pool never holds a bare handle: it wraps it in a [`Lease`], whose
//! `Drop` calls [`ResourceHandle::release`]. Success, failure, cancellation
//! and task abort all run that drop, so every acquired handle is released
//! exactly once.

pub mod memory;

use std::ops::{Deref, DerefMut};

use async_trait::async_trait;
use tracing::debug;

use crate::error::Result;
use crate::model::{ItemId, Record, WorkerId};

pub use memory::{MemorySession, MemoryStore};

/// Hands out one exclusive handle per worker.
#[async_trait]
pub trait ResourceProvider: Send + Sync + 'static {
    type Handle: ResourceHandle;

    async fn acquire(&self, worker: WorkerId) -> Result<Self::Handle>;
}

/// An exclusively-owned session against the backing store.
#[async_trait]
pub trait ResourceHandle: Send + 'static {
    /// Fetch the record for `item`, or [`Error::NotFound`](crate::error::Error::NotFound).
    async fn lookup(&mut self, item: ItemId) -> Result<Record>;

    /// Persist a mutated record, or fail with
    /// [`Error::Commit`](crate::error::Error::Commit).
    async fn commit(&mut self, record: Record) -> Result<()>;

    /// Give the handle back. Called exactly once per acquired handle.
    fn release(&mut self);
}

/// Scoped ownership of a handle; releases it on drop.
pub struct Lease<H: ResourceHandle> {
    handle: H,
    worker: WorkerId,
}

impl<H: ResourceHandle> Lease<H> {
    /// Acquire a handle from `provider` for `worker`.
    pub async fn acquire<P>(provider: &P, worker: WorkerId) -> Result<Self>
    where
        P: ResourceProvider<Handle = H> + ?Sized,
    {
        let handle = provider.acquire(worker).await?;
        debug!(%worker, "resource handle acquired");
        Ok(Self { handle, worker })
    }

    pub fn worker(&self) -> WorkerId {
        self.worker
    }
}

impl<H: ResourceHandle> Deref for Lease<H> {
    type Target = H;

    fn deref(&self) -> &H {
        &self.handle
    }
}

impl<H: ResourceHandle> DerefMut for Lease<H> {
    fn deref_mut(&mut self) -> &mut H {
        &mut self.handle
    }
}

impl<H: ResourceHandle> Drop for Lease<H> {
    fn drop(&mut self) {
        self.handle.release();
        debug!(worker = %self.worker, "resource handle released");
    }
}
