//! # workpool
//!
//! A bounded worker pool that drains a shared work queue.
//!
//! Workers pull item keys from a [`WorkQueue`](queue::WorkQueue), each
//! holding one exclusive resource handle for its lifetime, and set a shared
//! [`CompletionSignal`](signal::CompletionSignal) when the queue is
//! exhausted. Two join disciplines are provided: an unstructured fan-out
//! whose failures are only seen if the caller looks, and a structured
//! fail-fast group that cancels siblings and aggregates every failure.

pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod model;
pub mod queue;
pub mod resource;
pub mod signal;
pub mod telemetry;
pub mod work;

pub use engine::run_pool;
