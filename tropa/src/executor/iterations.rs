//! Executors bounded by an iteration budget instead of a duration.
//!
//! Both finish as soon as the budget is spent. `max_duration` is only a ceiling:
//! reaching it stops the remaining work the same way a graceful stop does.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;

use super::{
    worker::{IterationDriver, VuScaler},
    ExecutionContext, Executor, StopSignals,
};
use crate::{
    config::{ExecutorConfig, ExecutorKind},
    error::{Error, Result},
    runner::Runner,
    state::ExecutorPhase,
};

/// Spawn one worker per claim function and wait until all of them are done or the
/// executor is told to stop.
async fn run_budgeted<R, F>(
    config: &ExecutorConfig,
    ctx: &ExecutionContext<R>,
    max_duration: Duration,
    claims: Vec<F>,
) -> Result<()>
where
    R: Runner,
    F: FnMut() -> bool + Send + 'static,
{
    let name = &config.name;
    let stop = StopSignals::arm(
        &ctx.cancel,
        Some(max_duration),
        config.graceful_stop,
        ctx.options.cancel_grace,
    );

    ctx.tracker.set_phase(ExecutorPhase::Running);
    let driver = IterationDriver::new(ctx, config);
    let mut scaler = VuScaler::new(ctx, driver, &stop, Duration::ZERO);
    for claim in claims {
        scaler.spawn_worker(claim);
    }

    let res = scaler.supervise(&stop.soft).await;
    if stop.is_stopping() && !ctx.cancel.is_cancelled() {
        tracing::warn!(executor = %name, "max_duration of {max_duration:?} reached before the iteration budget was spent");
    }

    ctx.tracker.set_phase(ExecutorPhase::Draining);
    let joined = scaler.shutdown().await;
    tracing::info!(executor = %name, "Done");
    res.and(joined)
}

/// `iterations` in total, claimed by `vus` workers in the order they become free.
#[derive(Debug, Clone)]
pub struct SharedIterationsExecutor {
    config: ExecutorConfig,
}

impl SharedIterationsExecutor {
    pub fn new(config: ExecutorConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl<R: Runner> Executor<R> for SharedIterationsExecutor {
    fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    async fn run(&self, ctx: ExecutionContext<R>) -> Result<()> {
        let name = &self.config.name;
        let ExecutorKind::SharedIterations {
            vus,
            iterations,
            max_duration,
        } = self.config.kind
        else {
            return Err(Error::config(format!("executor '{name}' is not shared-iterations")));
        };
        if iterations == 0 || max_duration.is_zero() {
            tracing::info!(executor = %name, "Empty iteration budget, nothing to run");
            return Ok(());
        }

        tracing::info!(executor = %name, "Running {iterations} iterations shared by {vus} VUs");
        let claimed = Arc::new(AtomicU64::new(0));
        let claims = (0..vus)
            .map(|_| {
                let claimed = claimed.clone();
                move || claimed.fetch_add(1, Ordering::Relaxed) < iterations
            })
            .collect();
        run_budgeted(&self.config, &ctx, max_duration, claims).await
    }
}

/// `iterations` on each of `vus` workers.
#[derive(Debug, Clone)]
pub struct PerVuIterationsExecutor {
    config: ExecutorConfig,
}

impl PerVuIterationsExecutor {
    pub fn new(config: ExecutorConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl<R: Runner> Executor<R> for PerVuIterationsExecutor {
    fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    async fn run(&self, ctx: ExecutionContext<R>) -> Result<()> {
        let name = &self.config.name;
        let ExecutorKind::PerVuIterations {
            vus,
            iterations,
            max_duration,
        } = self.config.kind
        else {
            return Err(Error::config(format!("executor '{name}' is not per-vu-iterations")));
        };
        if iterations == 0 || max_duration.is_zero() {
            tracing::info!(executor = %name, "Empty iteration budget, nothing to run");
            return Ok(());
        }

        tracing::info!(executor = %name, "Running {iterations} iterations on each of {vus} VUs");
        let claims = (0..vus)
            .map(|_| {
                let mut left = iterations;
                move || {
                    let more = left > 0;
                    left = left.saturating_sub(1);
                    more
                }
            })
            .collect();
        run_budgeted(&self.config, &ctx, max_duration, claims).await
    }
}
