//! Level-triggered completion signal.
//!
//! A single flag that transitions false→true exactly once per episode. The
//! transition is an atomic compare-and-set, so any number of racing workers
//! may call [`CompletionSignal::set`] and exactly one of them wins.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::telemetry::metrics;

#[derive(Debug, Default)]
struct Inner {
    set: AtomicBool,
    notify: Notify,
}

/// Shared "no more work will ever arrive" flag. Cloning shares the flag.
#[derive(Debug, Clone, Default)]
pub struct CompletionSignal {
    inner: Arc<Inner>,
}

impl CompletionSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the signal. Returns `true` only for the call that performed the
    /// transition; later calls are no-ops.
    pub fn set(&self) -> bool {
        let won = self
            .inner
            .set
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if won {
            self.inner.notify.notify_waiters();
            metrics::signal_transitions().add(1, &[]);
        }
        won
    }

    pub fn is_set(&self) -> bool {
        self.inner.set.load(Ordering::Acquire)
    }

    /// Suspend until the signal is set. Returns immediately if it already is.
    pub async fn wait(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_set() {
                return;
            }
            notified.await;
        }
    }

    /// Like [`wait`](Self::wait), but returns [`Error::Cancelled`] if
    /// `cancel` fires first.
    pub async fn wait_or_cancel(&self, cancel: &CancellationToken) -> Result<()> {
        tokio::select! {
            biased;
            _ = self.wait() => Ok(()),
            _ = cancel.cancelled() => Err(Error::Cancelled),
        }
    }
}
