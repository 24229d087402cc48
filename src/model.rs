//! Core data model.
//!
//! Work items are opaque integer keys. Workers are numbered by spawn order,
//! and that order is what every aggregated result is sorted by.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AggregateFailure, Error};

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Newtype for work item keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ItemId(pub u64);

impl std::fmt::Display for ItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl From<u64> for ItemId {
    fn from(n: u64) -> Self {
        Self(n)
    }
}

/// Index of a worker within its episode (spawn order, zero-based).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WorkerId(pub usize);

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// Identifies one coordination episode (one `Pool::run`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EpisodeId(pub Uuid);

impl EpisodeId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EpisodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EpisodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Short display: first 8 chars of UUID
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

// ---------------------------------------------------------------------------
// Record
// ---------------------------------------------------------------------------

/// State associated with a work item, looked up and committed through a
/// resource handle. The payload is opaque to the pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub item: ItemId,
    pub payload: serde_json::Value,
    /// Bumped by the store on every successful commit.
    pub version: u64,
}

impl Record {
    pub fn new(item: ItemId, payload: serde_json::Value) -> Self {
        Self {
            item,
            payload,
            version: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Worker state
// ---------------------------------------------------------------------------

/// Lifecycle state of a worker's run loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Spawned, handle not yet acquired.
    Idle,
    /// Waiting on the queue.
    Pulling,
    /// Holding an item: lookup, unit of work, commit.
    Processing,
    /// Observed exhaustion, setting the completion signal.
    SignalingDone,
    /// Lookup, work or commit failed.
    Failed,
    /// Observed group cancellation or deadline.
    Cancelled,
    /// Loop exited. Terminal.
    Terminated,
}

impl WorkerState {
    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: WorkerState) -> bool {
        use WorkerState::*;
        matches!(
            (self, to),
            (Idle, Pulling)
                | (Idle, Failed)            // acquire failed
                | (Idle, Cancelled)
                | (Idle, Terminated)        // signal already set
                | (Pulling, Processing)
                | (Pulling, SignalingDone)
                | (Pulling, Cancelled)
                | (Pulling, Terminated)     // sibling set the signal
                | (Processing, Pulling)
                | (Processing, SignalingDone)
                | (Processing, Failed)
                | (Processing, Cancelled)
                | (SignalingDone, Terminated)
                | (Failed, Terminated)
                | (Cancelled, Terminated)
        )
    }

    /// Is this a terminal state?
    pub fn is_terminal(self) -> bool {
        matches!(self, WorkerState::Terminated)
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkerState::Idle => "idle",
            WorkerState::Pulling => "pulling",
            WorkerState::Processing => "processing",
            WorkerState::SignalingDone => "signaling_done",
            WorkerState::Failed => "failed",
            WorkerState::Cancelled => "cancelled",
            WorkerState::Terminated => "terminated",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// Why a worker's loop ended unsuccessfully.
#[derive(Debug)]
pub struct WorkerFailure {
    pub worker: WorkerId,
    /// The item held when the failure happened, if any.
    pub item: Option<ItemId>,
    pub error: Error,
}

impl std::fmt::Display for WorkerFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.item {
            Some(item) => write!(f, "{} on {}: {}", self.worker, item, self.error),
            None => write!(f, "{}: {}", self.worker, self.error),
        }
    }
}

impl WorkerFailure {
    pub fn is_cancellation(&self) -> bool {
        self.error.is_cancelled()
    }
}

/// What a worker reports when its loop exits.
#[derive(Debug)]
pub enum WorkerOutcome {
    Success { worker: WorkerId, processed: usize },
    Failure(WorkerFailure),
}

impl WorkerOutcome {
    pub fn worker(&self) -> WorkerId {
        match self {
            WorkerOutcome::Success { worker, .. } => *worker,
            WorkerOutcome::Failure(f) => f.worker,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, WorkerOutcome::Success { .. })
    }

    pub fn failure(&self) -> Option<&WorkerFailure> {
        match self {
            WorkerOutcome::Failure(f) => Some(f),
            WorkerOutcome::Success { .. } => None,
        }
    }

    pub fn into_failure(self) -> Option<WorkerFailure> {
        match self {
            WorkerOutcome::Failure(f) => Some(f),
            WorkerOutcome::Success { .. } => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

/// How an unstructured fan-out is joined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinMode {
    /// Return at the first failure; sibling outcomes are never delivered.
    #[default]
    First,
    /// Wait for every worker and hand back every outcome.
    All,
    /// Drop every outcome unseen.
    Detach,
}

impl std::str::FromStr for JoinMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "first" => Ok(JoinMode::First),
            "all" => Ok(JoinMode::All),
            "detach" => Ok(JoinMode::Detach),
            other => Err(Error::Config(format!("unknown join mode: {other}"))),
        }
    }
}

/// Join discipline for a coordination group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Policy {
    /// Independent workers; failures are only seen if the caller looks.
    Unstructured { join: JoinMode },
    /// Fail-fast group: first failure cancels siblings, all failures surface.
    Structured {
        #[serde(default, with = "optional_millis")]
        deadline: Option<Duration>,
    },
}

impl Policy {
    pub fn structured() -> Self {
        Policy::Structured { deadline: None }
    }

    pub fn structured_with_deadline(deadline: Duration) -> Self {
        Policy::Structured {
            deadline: Some(deadline),
        }
    }

    pub fn unstructured(join: JoinMode) -> Self {
        Policy::Unstructured { join }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Policy::Unstructured { .. } => "unstructured",
            Policy::Structured { .. } => "structured",
        }
    }
}

impl Default for Policy {
    fn default() -> Self {
        Policy::structured()
    }
}

mod optional_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}

// ---------------------------------------------------------------------------
// Group result
// ---------------------------------------------------------------------------

/// What a successful episode did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Summary {
    pub episode: EpisodeId,
    /// Items committed per worker, indexed by worker id.
    pub processed: Vec<usize>,
}

impl Summary {
    pub fn total_processed(&self) -> usize {
        self.processed.iter().sum()
    }
}

/// The outcome of one coordination episode.
#[derive(Debug)]
#[must_use = "a GroupResult may carry worker failures"]
pub enum GroupResult {
    Success(Summary),
    Failed(AggregateFailure),
    /// The structured deadline elapsed. `failures` holds any root-cause
    /// failures that landed before the deadline.
    TimedOut {
        deadline: Duration,
        failures: Vec<WorkerFailure>,
    },
}

impl GroupResult {
    pub fn is_success(&self) -> bool {
        matches!(self, GroupResult::Success(_))
    }

    /// Convert into a `Result`, mapping failures to [`Error::Aggregate`] and
    /// an elapsed deadline to [`Error::Timeout`].
    pub fn into_result(self) -> crate::error::Result<Summary> {
        match self {
            GroupResult::Success(summary) => Ok(summary),
            GroupResult::Failed(aggregate) => Err(Error::Aggregate(aggregate)),
            GroupResult::TimedOut { deadline, .. } => Err(Error::Timeout(deadline)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminated_is_final() {
        use WorkerState::*;
        for to in [Idle, Pulling, Processing, SignalingDone, Failed, Cancelled] {
            assert!(!Terminated.can_transition_to(to), "terminated -> {to}");
        }
        assert!(Terminated.is_terminal());
    }

    #[test]
    fn failure_is_only_reachable_while_holding_work() {
        assert!(WorkerState::Processing.can_transition_to(WorkerState::Failed));
        assert!(!WorkerState::Pulling.can_transition_to(WorkerState::Failed));
        assert!(!WorkerState::SignalingDone.can_transition_to(WorkerState::Failed));
    }

    #[test]
    fn join_mode_parses() {
        assert_eq!("detach".parse::<JoinMode>().unwrap(), JoinMode::Detach);
        assert!("later".parse::<JoinMode>().is_err());
    }

    #[test]
    fn into_result_maps_failures() {
        let result = GroupResult::TimedOut {
            deadline: Duration::from_secs(1),
            failures: Vec::new(),
        };
        assert!(matches!(result.into_result(), Err(Error::Timeout(_))));

        let result = GroupResult::Failed(AggregateFailure {
            failures: vec![WorkerFailure {
                worker: WorkerId(0),
                item: Some(ItemId(3)),
                error: Error::NotFound(ItemId(3)),
            }],
            cancelled: vec![WorkerId(1)],
        });
        let err = result.into_result().unwrap_err();
        assert_eq!(
            err.to_string(),
            "1 worker(s) failed: worker-0 on #3: record not found for item #3"
        );
    }
}
