//! Merge worker
//!
//! Background thread that evaluates the merge trigger on a fixed tick and
//! runs merge cycles, retrying failed ones with bounded exponential backoff.
//! The thread lives exactly as long as the engine: dropping the shutdown
//! sender disconnects the channel and the loop exits.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};

use crate::config::RetryPolicy;
use crate::engine::EngineInner;
use crate::error::{CaskError, Result};

use super::trigger::{MergeSchedule, TriggerInput};
use super::run_cycle;

/// Handle to the running merge thread
pub(crate) struct MergeWorker {
    shutdown: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl MergeWorker {
    /// Start the worker for `inner`
    pub(crate) fn spawn(inner: Arc<EngineInner>) -> Result<Self> {
        let (shutdown_tx, shutdown_rx) = channel::bounded::<()>(0);

        let handle = thread::Builder::new()
            .name("caskdb-merge".to_string())
            .spawn(move || worker_loop(inner, shutdown_rx))
            .map_err(CaskError::Io)?;

        Ok(Self {
            shutdown: Some(shutdown_tx),
            handle: Some(handle),
        })
    }

    /// Signal the thread and wait for it to exit
    pub(crate) fn stop(mut self) {
        self.shutdown_and_join();
    }

    fn shutdown_and_join(&mut self) {
        drop(self.shutdown.take());
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("Merge worker panicked");
            }
        }
    }
}

impl Drop for MergeWorker {
    fn drop(&mut self) {
        self.shutdown_and_join();
    }
}

fn worker_loop(inner: Arc<EngineInner>, shutdown: Receiver<()>) {
    let config = inner.config().clone();
    let mut schedule = MergeSchedule::new(config.merge_trigger, Instant::now());
    let ticker = channel::tick(config.merge_check_interval);

    tracing::debug!(trigger = ?config.merge_trigger, "Merge worker started");

    loop {
        crossbeam::select! {
            recv(shutdown) -> _ => break,
            recv(ticker) -> _ => {
                let (total, live) = inner.record_counts();
                let input = TriggerInput::capture(total, live, inner.sealed_segments());
                if schedule.should_merge(&input) {
                    match run_with_retry(&inner, &shutdown, config.merge_retry) {
                        CycleOutcome::Shutdown => break,
                        CycleOutcome::Completed | CycleOutcome::GaveUp => {
                            schedule.record_merge(&input)
                        }
                    }
                }
            }
        }
    }

    tracing::debug!("Merge worker stopped");
}

enum CycleOutcome {
    Completed,
    GaveUp,
    Shutdown,
}

fn run_with_retry(
    inner: &EngineInner,
    shutdown: &Receiver<()>,
    policy: RetryPolicy,
) -> CycleOutcome {
    let mut backoff = Backoff::new(policy);

    loop {
        match run_cycle(inner) {
            Ok(_) if inner.is_shutting_down() => return CycleOutcome::Shutdown,
            Ok(_) => return CycleOutcome::Completed,
            Err(e) => {
                let Some(delay) = backoff.next() else {
                    tracing::error!(
                        error = %e,
                        attempts = backoff.attempts(),
                        "Merge failed, giving up until the next trigger"
                    );
                    return CycleOutcome::GaveUp;
                };

                tracing::warn!(
                    error = %e,
                    attempt = backoff.attempts(),
                    retry_in = ?delay,
                    "Merge failed, retrying"
                );

                match shutdown.recv_timeout(delay) {
                    Err(RecvTimeoutError::Timeout) => continue,
                    _ => return CycleOutcome::Shutdown,
                }
            }
        }
    }
}

/// Doubling delay with a ceiling and a cap on attempts
#[derive(Debug)]
pub(crate) struct Backoff {
    current: Duration,
    max: Duration,
    attempts: u32,
    max_attempts: u32,
}

impl Backoff {
    pub(crate) fn new(policy: RetryPolicy) -> Self {
        Self {
            current: policy.initial,
            max: policy.max,
            attempts: 0,
            max_attempts: policy.max_attempts,
        }
    }

    /// Delay before the next retry, or None once attempts are used up
    pub(crate) fn next(&mut self) -> Option<Duration> {
        if self.attempts >= self.max_attempts {
            return None;
        }
        self.attempts += 1;
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        Some(delay)
    }

    pub(crate) fn attempts(&self) -> u32 {
        self.attempts
    }
}
