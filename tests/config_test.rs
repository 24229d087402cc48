use std::time::Duration;

use workpool::config::Config;
use workpool::engine::PoolConfig;
use workpool::model::{JoinMode, Policy};

const VARS: [&str; 5] = [
    "WORKPOOL_WORKERS",
    "WORKPOOL_POLICY",
    "WORKPOOL_JOIN",
    "WORKPOOL_DEADLINE_MS",
    "WORKPOOL_QUEUE_CAPACITY",
];

fn clear_env() {
    unsafe {
        for var in VARS {
            std::env::remove_var(var);
        }
    }
}

// Environment variables are process-global, so every env case lives in
// this one test.
#[test]
fn config_from_env() {
    clear_env();
    let config = Config::from_env().unwrap();
    assert_eq!(config.workers, 4);
    assert_eq!(config.to_policy().unwrap(), Policy::structured());

    unsafe {
        std::env::set_var("WORKPOOL_WORKERS", "8");
        std::env::set_var("WORKPOOL_POLICY", "unstructured");
        std::env::set_var("WORKPOOL_JOIN", "all");
        std::env::set_var("WORKPOOL_QUEUE_CAPACITY", "16");
    }
    let config = Config::from_env().unwrap();
    assert_eq!(
        config.pool_config().unwrap(),
        PoolConfig {
            worker_count: 8,
            policy: Policy::unstructured(JoinMode::All),
            queue_capacity: Some(16),
        }
    );

    unsafe {
        std::env::set_var("WORKPOOL_WORKERS", "many");
    }
    assert!(Config::from_env().is_err());

    unsafe {
        std::env::set_var("WORKPOOL_WORKERS", "0");
    }
    assert!(Config::from_env().is_err());

    unsafe {
        std::env::set_var("WORKPOOL_WORKERS", "2");
        std::env::set_var("WORKPOOL_JOIN", "sometimes");
    }
    assert!(Config::from_env().is_err());

    unsafe {
        std::env::set_var("WORKPOOL_JOIN", "all");
        std::env::set_var("WORKPOOL_QUEUE_CAPACITY", "0");
    }
    assert!(Config::from_env().is_err());

    clear_env();
}

#[test]
fn config_from_toml_fills_defaults() {
    let config = Config::from_toml_str(
        r#"
        workers = 3
        deadline_ms = 250
        "#,
    )
    .unwrap();

    assert_eq!(config.workers, 3);
    assert_eq!(config.log_level, "info");
    assert_eq!(
        config.to_policy().unwrap(),
        Policy::structured_with_deadline(Duration::from_millis(250))
    );
}

#[test]
fn config_from_toml_reads_unstructured_join() {
    let config = Config::from_toml_str(
        r#"
        policy = "unstructured"
        join = "detach"
        queue_capacity = 4
        "#,
    )
    .unwrap();

    let pool = config.pool_config().unwrap();
    assert_eq!(pool.policy, Policy::unstructured(JoinMode::Detach));
    assert_eq!(pool.queue_capacity, Some(4));
}

#[test]
fn config_rejects_unknown_policy() {
    assert!(Config::from_toml_str(r#"policy = "chaotic""#).is_err());
    assert!(Config::from_toml_str("workers = 0").is_err());
    assert!(Config::from_toml_str("workers = \"four\"").is_err());
}

#[test]
fn config_rejects_zero_queue_capacity() {
    let err = Config::from_toml_str("queue_capacity = 0").unwrap_err();
    assert!(err.to_string().contains("queue_capacity"));

    let config = Config::from_toml_str("queue_capacity = 1").unwrap();
    assert_eq!(config.pool_config().unwrap().queue_capacity, Some(1));
}

#[test]
fn config_from_missing_file_fails() {
    let err = Config::from_file(std::path::Path::new("/nonexistent/workpool.toml")).unwrap_err();
    assert!(err.to_string().contains("cannot read config"));
}

#[test]
fn policy_round_trips_through_json() {
    let policy = Policy::structured_with_deadline(Duration::from_millis(1500));
    let json = serde_json::to_value(policy).unwrap();
    assert_eq!(json, serde_json::json!({"kind": "structured", "deadline": 1500}));
    assert_eq!(serde_json::from_value::<Policy>(json).unwrap(), policy);

    let json = serde_json::json!({"kind": "unstructured", "join": "first"});
    assert_eq!(
        serde_json::from_value::<Policy>(json).unwrap(),
        Policy::unstructured(JoinMode::First)
    );
}
