//! Scheduling half of the overlord: handler registry, the task runner that
//! advances ready tasks and drives undo cascades, retry backoff, and the
//! `Overlord` loop thread that runs ensure passes on a timer and on demand.
//!
//! Handlers receive a `TaskContext` holding the state lock. Slow work goes
//! inside `TaskContext::unlock`, whose guard relocks when dropped.

pub mod cascade;
pub mod concurrency;
pub mod config;
pub mod context;
pub mod handler;
pub mod overlord;
pub mod retry;
pub mod runner;

pub use cascade::{plan_change_abort, plan_lane_abort, undo_order, UndoPlan};
pub use concurrency::{install_signal_handler, shutdown_requested, CancelToken};
pub use config::{EngineConfig, PruneConfig, RetryConfig};
pub use context::{TaskContext, Unlocked};
pub use handler::{Direction, HandlerRegistry, HandlerResult, Outcome, TaskError};
pub use overlord::Overlord;
pub use retry::RetryPolicy;
pub use runner::{EnsureReport, TaskRunner};

use overlord_state::StateError;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("state error: {0}")]
    State(#[from] StateError),
    #[error("invalid engine config: {0}")]
    Config(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("handler for task kind {0:?} already registered")]
    DuplicateHandler(String),
    #[error("no handler registered for task kinds: {}", .0.join(", "))]
    UnknownKinds(Vec<String>),
    #[error("tasks still pending after {0:?}")]
    SettleTimeout(Duration),
    #[error("runner is stopped")]
    Stopped,
}

/// Initialise process logging from `OVERLORD_LOG`, falling back to `default`.
///
/// Safe to call more than once; later calls are no-ops.
pub fn init_logging(default: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_env("OVERLORD_LOG")
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .try_init();
}
