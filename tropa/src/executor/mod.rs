//! Executors: scheduling strategies that decide how many VUs iterate, or how fast
//! new iterations start, over time.
//!
//! Every executor borrows VUs from the run's shared [`VuPool`], runs iterations on
//! them through the [`Runner`] and pushes the resulting batches into the sample
//! pipeline. They all share one lifecycle:
//!
//! ```text
//! Pending -> Started -> Running(stage i) -> Draining -> Finished
//!                  \________________________/
//!                       Canceled | Errored
//! ```
//!
//! # Stopping
//!
//! Each executor owns two tokens:
//!
//! - `soft`, a child of the run's cancellation token: fires when the executor's
//!   duration ends or the run is canceled. Workers finish the iteration they are in
//!   and stop.
//! - `hard`: fires `graceful_stop` after `soft`. In-flight iterations are interrupted
//!   and their samples discarded whole. A run cancellation arriving while the window
//!   is open shortens what is left of it to the run's `cancel_grace`.
//!
//! Ramping executors hand each worker child tokens of its own so single workers can be
//! retired without touching the rest.

pub mod arrival_rate;
pub mod constant_vus;
pub mod external;
pub mod iterations;
pub mod ramping_vus;
pub(crate) mod worker;

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub use arrival_rate::ArrivalRateExecutor;
pub use constant_vus::ConstantVusExecutor;
pub use external::{ExternalControl, ExternallyControlledExecutor};
pub use iterations::{PerVuIterationsExecutor, SharedIterationsExecutor};
pub use ramping_vus::RampingVusExecutor;

use crate::{
    config::{ExecutorConfig, ExecutorKind, RunOptions},
    error::Result,
    pipeline::SampleSender,
    pool::VuPool,
    runner::Runner,
    state::{ExecutorTracker, RunState},
};

/// Everything an executor borrows from the controller for one run.
pub struct ExecutionContext<R: Runner> {
    pub(crate) pool: Arc<VuPool<R>>,
    pub(crate) samples: SampleSender,
    pub(crate) state: Arc<RunState>,
    pub(crate) tracker: Arc<ExecutorTracker>,
    /// Run-wide cancellation.
    pub(crate) cancel: CancellationToken,
    pub(crate) options: Arc<RunOptions>,
}

impl<R: Runner> ExecutionContext<R> {
    pub(crate) fn new(
        pool: Arc<VuPool<R>>,
        samples: SampleSender,
        state: Arc<RunState>,
        tracker: Arc<ExecutorTracker>,
        cancel: CancellationToken,
        options: Arc<RunOptions>,
    ) -> Self {
        Self {
            pool,
            samples,
            state,
            tracker,
            cancel,
            options,
        }
    }

    pub fn tracker(&self) -> &ExecutorTracker {
        &self.tracker
    }
}

impl<R: Runner> Clone for ExecutionContext<R> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            samples: self.samples.clone(),
            state: self.state.clone(),
            tracker: self.tracker.clone(),
            cancel: self.cancel.clone(),
            options: self.options.clone(),
        }
    }
}

/// A scheduling strategy.
///
/// `run` returns once every worker of the executor has stopped and every VU it
/// borrowed is back in the pool. Reaching the configured duration or being canceled
/// is a normal return; only unrecoverable pool or VU setup failures are errors.
#[async_trait]
pub trait Executor<R: Runner>: Send + Sync {
    fn config(&self) -> &ExecutorConfig;

    async fn run(&self, ctx: ExecutionContext<R>) -> Result<()>;
}

/// Build the executor for `config`, plus its control handle if it is externally
/// controlled.
pub fn build<R: Runner>(config: ExecutorConfig) -> (Box<dyn Executor<R>>, Option<ExternalControl>) {
    match &config.kind {
        ExecutorKind::ConstantVus { .. } => (Box::new(ConstantVusExecutor::new(config)), None),
        ExecutorKind::RampingVus { .. } => (Box::new(RampingVusExecutor::new(config)), None),
        ExecutorKind::ConstantArrivalRate { .. } | ExecutorKind::RampingArrivalRate { .. } => {
            (Box::new(ArrivalRateExecutor::new(config)), None)
        }
        ExecutorKind::SharedIterations { .. } => {
            (Box::new(SharedIterationsExecutor::new(config)), None)
        }
        ExecutorKind::PerVuIterations { .. } => {
            (Box::new(PerVuIterationsExecutor::new(config)), None)
        }
        ExecutorKind::ExternallyControlled { .. } => {
            let executor = ExternallyControlledExecutor::new(config);
            let control = executor.control();
            (Box::new(executor), Some(control))
        }
    }
}

/// Soft and hard stop tokens of one executor, driven by a timer task.
#[derive(Debug)]
pub(crate) struct StopSignals {
    pub(crate) soft: CancellationToken,
    pub(crate) hard: CancellationToken,
    timer: JoinHandle<()>,
}

impl StopSignals {
    /// Fire `soft` after `duration` (never if `None`) or when `run` is canceled, and
    /// `hard` once `graceful_stop` has passed since `soft`.
    ///
    /// If `run` is canceled while a window opened some other way (the duration ran
    /// out or the executor stopped itself) is still open, `hard` fires `cancel_grace`
    /// later, or when the window closes if that is sooner.
    pub(crate) fn arm(
        run: &CancellationToken,
        duration: Option<Duration>,
        graceful_stop: Duration,
        cancel_grace: Duration,
    ) -> Self {
        let soft = run.child_token();
        let hard = CancellationToken::new();

        let timer = {
            let run = run.clone();
            let soft = soft.clone();
            let hard = hard.clone();
            tokio::spawn(async move {
                match duration {
                    Some(duration) => {
                        tokio::select! {
                            _ = tokio::time::sleep(duration) => soft.cancel(),
                            _ = soft.cancelled() => {}
                        }
                    }
                    None => soft.cancelled().await,
                }
                let window = tokio::time::sleep(graceful_stop);
                tokio::pin!(window);
                if run.is_cancelled() {
                    // The cancellation opened the window itself
                    window.await;
                } else {
                    tokio::select! {
                        _ = &mut window => {}
                        _ = run.cancelled() => {
                            tokio::select! {
                                _ = &mut window => {}
                                _ = tokio::time::sleep(cancel_grace) => {}
                            }
                        }
                    }
                }
                hard.cancel();
            })
        };

        Self { soft, hard, timer }
    }

    /// Ask the workers to stop after their current iteration.
    pub(crate) fn stop(&self) {
        self.soft.cancel();
    }

    pub(crate) fn is_stopping(&self) -> bool {
        self.soft.is_cancelled()
    }
}

impl Drop for StopSignals {
    fn drop(&mut self) {
        self.timer.abort();
    }
}
