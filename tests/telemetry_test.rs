//! Integration tests for telemetry initialization, span helpers and what
//! the pool writes to the log.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Barrier;
use tokio::time::timeout;
use tracing::subscriber::DefaultGuard;
use tracing_subscriber::fmt::MakeWriter;
use workpool::engine::{Pool, PoolConfig};
use workpool::error::Error;
use workpool::event::EventKind;
use workpool::model::{EpisodeId, ItemId, JoinMode, Policy, Record, WorkerId, WorkerState};
use workpool::resource::MemoryStore;
use workpool::telemetry::work::{
    record_episode_result, record_state_transition, start_episode_span, start_worker_span,
};
use workpool::work::{FnWork, UnitOfWork};

/// Collects formatted log output in memory.
#[derive(Clone, Default)]
struct Captured(Arc<Mutex<Vec<u8>>>);

impl Captured {
    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }
}

impl io::Write for Captured {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for Captured {
    type Writer = Captured;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Install a TRACE-level subscriber for the current thread. Tests using it
/// run on the current-thread runtime so spawned workers log into it too.
fn capture() -> (Captured, DefaultGuard) {
    let captured = Captured::default();
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .with_ansi(false)
        .with_writer(captured.clone())
        .finish();
    (captured, tracing::subscriber::set_default(subscriber))
}

/// Every worker claims one item, then all of them fail together.
fn failing_together(workers: usize) -> impl UnitOfWork {
    let barrier = Arc::new(Barrier::new(workers));
    FnWork(move |record: Record| {
        let barrier = Arc::clone(&barrier);
        async move {
            barrier.wait().await;
            Err::<Record, _>(Error::Work {
                item: record.item,
                cause: "systematic bug".to_string(),
            })
        }
    })
}

#[test]
fn telemetry_initializes_without_endpoint() {
    // The global subscriber can only be set once per process; a second
    // init in the same binary returns Err, which is fine here.
    let config = workpool::telemetry::TelemetryConfig::local("workpool-test");
    let _guard = workpool::telemetry::init_telemetry(config);
}

#[test]
fn episode_span_records_result() {
    let (captured, _guard) = capture();

    let span = start_episode_span(&EpisodeId::new(), "structured", 4);
    record_episode_result(&span, "success");
    span.in_scope(|| tracing::info!("inside episode"));

    let logs = captured.contents();
    assert!(logs.contains("pool.episode"));
    assert!(logs.contains("pool.policy"));
    assert!(logs.contains("pool.workers=4"));
    assert!(logs.contains("pool.result"));
    assert!(logs.contains("success"));
}

#[test]
fn worker_span_records_transitions() {
    let (captured, _guard) = capture();

    let span = start_worker_span(&EpisodeId::new(), WorkerId(2));
    record_state_transition(&span, WorkerState::Idle, WorkerState::Pulling);
    record_state_transition(&span, WorkerState::Pulling, WorkerState::Processing);

    let logs = captured.contents();
    assert_eq!(logs.matches("state_transition").count(), 2);
    assert!(logs.contains("from=idle"));
    assert!(logs.contains("to=pulling"));
    assert!(logs.contains("from=pulling"));
    assert!(logs.contains("to=processing"));
    assert!(logs.contains("worker.id=2"));
}

#[test]
fn metric_instruments_are_usable_without_a_provider() {
    use opentelemetry::KeyValue;
    use workpool::telemetry::metrics;

    metrics::queue_operations().add(1, &[KeyValue::new("operation", "enqueue")]);
    metrics::episode_duration_ms().record(12.5, &[KeyValue::new("policy", "structured")]);
}

#[tokio::test]
async fn detached_failures_leave_no_trace_in_the_log() {
    let (captured, _guard) = capture();
    let store = MemoryStore::seeded((1..=3).map(ItemId));
    let pool = Pool::new(
        Arc::new(store.clone()),
        Arc::new(failing_together(3)),
        PoolConfig::new(3, Policy::unstructured(JoinMode::Detach)),
    );

    let fan = pool.fan_out((1..=3).map(ItemId));
    fan.detach();

    timeout(Duration::from_secs(10), async {
        loop {
            let finished = pool
                .events()
                .get_events_since(0)
                .iter()
                .filter(|e| matches!(e.kind, EventKind::WorkerFinished { .. }))
                .count();
            if finished == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    // The failures exist, but only in the event log.
    let failed = pool
        .events()
        .get_events_since(0)
        .iter()
        .filter(|e| matches!(e.kind, EventKind::ItemFailed { .. }))
        .count();
    assert_eq!(failed, 3);

    let logs = captured.contents();
    assert!(!logs.contains("systematic bug"), "{logs}");
    assert!(!logs.contains("ERROR"), "{logs}");
    assert!(!logs.contains("WARN"), "{logs}");
}

#[tokio::test]
async fn structured_failure_is_logged_by_the_group() {
    let (captured, _guard) = capture();
    let store = MemoryStore::seeded((1..=3).map(ItemId));
    let pool = Pool::new(
        Arc::new(store.clone()),
        Arc::new(failing_together(3)),
        PoolConfig::new(3, Policy::structured()),
    );

    let result = timeout(Duration::from_secs(10), pool.run((1..=3).map(ItemId)))
        .await
        .unwrap();
    assert!(!result.is_success());

    let logs = captured.contents();
    assert!(logs.contains("ERROR"), "{logs}");
    assert!(logs.contains("systematic bug"), "{logs}");
}
