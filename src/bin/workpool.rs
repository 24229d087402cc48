//! workpool CLI: drive a coordination episode against the in-memory store.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use workpool::config::Config;
use workpool::engine::Pool;
use workpool::model::{GroupResult, ItemId, JoinMode};
use workpool::resource::MemoryStore;
use workpool::telemetry::{TelemetryConfig, init_telemetry};
use workpool::work::SimulatedWork;

#[derive(Parser)]
#[command(name = "workpool", about = "Bounded worker pool over a shared queue")]
struct Cli {
    /// TOML config file (otherwise read from the environment)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one episode over simulated work
    Run {
        /// Number of items to enqueue (keys 1..=N)
        #[arg(long, default_value_t = 20)]
        items: u64,
        /// Worker count (overrides config)
        #[arg(long)]
        workers: Option<usize>,
        /// "structured" or "unstructured" (overrides config)
        #[arg(long)]
        policy: Option<String>,
        /// Unstructured join mode: first, all, detach (overrides config)
        #[arg(long)]
        join: Option<JoinMode>,
        /// Structured episode deadline in milliseconds (overrides config)
        #[arg(long)]
        deadline_ms: Option<u64>,
        /// Simulated per-item latency in milliseconds
        #[arg(long, default_value_t = 50)]
        latency_ms: u64,
        /// Item keys whose unit of work fails (repeatable)
        #[arg(long = "fail-on")]
        fail_on: Vec<u64>,
        /// Give up waiting after this many milliseconds
        #[arg(long)]
        wait_timeout_ms: Option<u64>,
        /// Print the episode event log as JSON lines
        #[arg(long)]
        events: bool,
    },
    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::from_env()?,
    };

    match cli.command {
        Command::Config => {
            println!("{config:#?}");
            Ok(())
        }
        Command::Run {
            items,
            workers,
            policy,
            join,
            deadline_ms,
            latency_ms,
            fail_on,
            wait_timeout_ms,
            events,
        } => {
            let mut config = config;
            if let Some(workers) = workers {
                config.workers = workers;
            }
            if let Some(policy) = policy {
                config.policy = policy;
            }
            if let Some(join) = join {
                config.join = join;
            }
            if deadline_ms.is_some() {
                config.deadline_ms = deadline_ms;
            }
            let opts = RunOptions {
                items,
                latency: Duration::from_millis(latency_ms),
                fail_on,
                wait_timeout: wait_timeout_ms.map(Duration::from_millis),
                events,
            };
            cmd_run(config, opts).await
        }
    }
}

struct RunOptions {
    items: u64,
    latency: Duration,
    fail_on: Vec<u64>,
    wait_timeout: Option<Duration>,
    events: bool,
}

async fn cmd_run(config: Config, opts: RunOptions) -> anyhow::Result<()> {
    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "workpool".to_string(),
        log_level: config.log_level.clone(),
    })?;

    let keys: Vec<ItemId> = (1..=opts.items).map(ItemId).collect();
    let store = MemoryStore::seeded(keys.iter().copied());
    let work = SimulatedWork::new(opts.latency).fail_on(opts.fail_on.into_iter().map(ItemId));
    let pool = Pool::new(Arc::new(store.clone()), Arc::new(work), config.pool_config()?);

    let run = pool.run(keys);
    let result = tokio::select! {
        result = run => Some(result),
        _ = wait_or_forever(opts.wait_timeout) => None,
        _ = tokio::signal::ctrl_c() => None,
    };

    if opts.events {
        for event in pool.events().get_events_since(0) {
            println!("{}", serde_json::to_string(&event)?);
        }
    }

    let Some(result) = result else {
        println!(
            "Episode still pending: completion signal never set ({} handle(s) still out)",
            store.active()
        );
        anyhow::bail!("episode did not finish");
    };

    match result {
        GroupResult::Success(summary) => {
            println!(
                "Success: {} item(s) committed across {} worker(s)",
                summary.total_processed(),
                summary.processed.len()
            );
            for (worker, n) in summary.processed.iter().enumerate() {
                println!("  worker-{worker}: {n}");
            }
            Ok(())
        }
        GroupResult::Failed(aggregate) => {
            println!("Failed: {} root cause(s)", aggregate.len());
            for failure in &aggregate.failures {
                println!("  {failure}");
            }
            if !aggregate.cancelled.is_empty() {
                let cancelled: Vec<String> =
                    aggregate.cancelled.iter().map(|w| w.to_string()).collect();
                println!("  cancelled: {}", cancelled.join(", "));
            }
            Err(aggregate.into())
        }
        GroupResult::TimedOut { deadline, failures } => {
            println!("Timed out after {deadline:?}");
            for failure in &failures {
                println!("  {failure}");
            }
            anyhow::bail!("episode deadline exceeded")
        }
    }
}

async fn wait_or_forever(timeout: Option<Duration>) {
    match timeout {
        Some(timeout) => tokio::time::sleep(timeout).await,
        None => std::future::pending().await,
    }
}
