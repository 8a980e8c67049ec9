use crate::concurrency::CancelToken;
use crate::config::EngineConfig;
use crate::handler::HandlerRegistry;
use crate::runner::TaskRunner;
use crate::EngineError;
use chrono::{DateTime, Utc};
use overlord_state::{ChangeId, State};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{error, info};

/// Owns the task runner and the thread that drives it.
///
/// The loop runs an ensure pass whenever the state's ensure channel is
/// signalled (handler completion, [`Overlord::ensure_now`]) and otherwise on
/// the configured interval, pruning old changes along the way.
pub struct Overlord {
    runner: Arc<TaskRunner>,
    stop: CancelToken,
    thread: Option<JoinHandle<()>>,
}

impl Overlord {
    pub fn new(
        state: State,
        registry: HandlerRegistry,
        config: EngineConfig,
    ) -> Result<Self, EngineError> {
        let runner = TaskRunner::new(state, registry, config)?;
        Ok(Self {
            runner: Arc::new(runner),
            stop: CancelToken::new(),
            thread: None,
        })
    }

    pub fn state(&self) -> &State {
        self.runner.state()
    }

    pub fn runner(&self) -> &TaskRunner {
        &self.runner
    }

    pub fn is_running(&self) -> bool {
        self.thread.is_some()
    }

    /// Start the loop thread. Calling it twice is a no-op.
    pub fn start(&mut self) -> Result<(), EngineError> {
        if self.thread.is_some() {
            return Ok(());
        }
        if self.stop.is_cancelled() {
            return Err(EngineError::Stopped);
        }
        let runner = Arc::clone(&self.runner);
        let stop = self.stop.clone();
        let handle = thread::Builder::new()
            .name("overlord-loop".to_owned())
            .spawn(move || run_loop(&runner, &stop))?;
        self.thread = Some(handle);
        info!("overlord loop started");
        Ok(())
    }

    /// Request an ensure pass at the next opportunity.
    pub fn ensure_now(&self) {
        self.state().ensure_before(Duration::ZERO);
    }

    pub fn abort_change(&self, change: ChangeId) -> Result<(), EngineError> {
        self.runner.abort_change(change)
    }

    /// Drive the runner from the calling thread until it settles. Only
    /// meaningful while the loop thread is not started.
    pub fn settle(&self, timeout: Duration) -> Result<(), EngineError> {
        self.runner.settle(timeout)
    }

    /// Stop the loop, then cancel and wait for running handlers.
    pub fn stop(&mut self) {
        self.stop.cancel();
        self.ensure_now();
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                error!("overlord loop thread panicked");
            }
        }
        self.runner.stop();
        info!("overlord stopped");
    }
}

impl Drop for Overlord {
    fn drop(&mut self) {
        if !self.stop.is_cancelled() {
            self.stop();
        }
    }
}

fn run_loop(runner: &TaskRunner, stop: &CancelToken) {
    let interval = runner.config().ensure_interval();
    let prune_interval = runner.config().prune.interval();
    let mut last_prune = Instant::now();
    while !stop.is_cancelled() {
        let next_wakeup = match runner.ensure() {
            Ok(report) => report.next_wakeup,
            Err(e) => {
                error!("ensure pass failed: {e}");
                None
            }
        };
        if last_prune.elapsed() >= prune_interval {
            last_prune = Instant::now();
            if let Err(e) = runner.prune(Utc::now()) {
                error!("prune failed: {e}");
            }
        }
        if stop.is_cancelled() {
            break;
        }
        runner.state().ensure_signal().wait(next_wait(interval, next_wakeup, Utc::now()));
    }
}

/// Sleep until the next scheduled retry or re-poll, but no longer than
/// `interval`.
fn next_wait(
    interval: Duration,
    next_wakeup: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Duration {
    next_wakeup.map_or(interval, |at| {
        (at - now).to_std().unwrap_or(Duration::ZERO).min(interval)
    })
}
