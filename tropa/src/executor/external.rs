use std::sync::Arc;

use async_trait::async_trait;
use tokio::{sync::watch, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;

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

/// Handle through which a collaborator drives an externally controlled executor.
///
/// Cheap to clone. Targets set before the executor starts are picked up when it does.
#[derive(Debug, Clone)]
pub struct ExternalControl {
    name: Arc<str>,
    target: Arc<watch::Sender<u64>>,
    max_vus: u64,
    stop: CancellationToken,
}

impl ExternalControl {
    /// Change the number of looping VUs. Fails if `vus` exceeds the executor's `max_vus`.
    pub fn set_target(&self, vus: u64) -> Result<()> {
        if vus > self.max_vus {
            return Err(Error::config(format!(
                "executor '{}': target {vus} exceeds max_vus ({})",
                self.name, self.max_vus
            )));
        }
        self.target.send_replace(vus);
        Ok(())
    }

    pub fn target(&self) -> u64 {
        *self.target.borrow()
    }

    pub fn max_vus(&self) -> u64 {
        self.max_vus
    }

    /// End the executor as if its duration had elapsed.
    pub fn stop(&self) {
        self.stop.cancel();
    }
}

/// Follows a VU target set at runtime through an [`ExternalControl`].
///
/// Runs for `duration` if one is configured, otherwise until the run is canceled or
/// the control handle stops it. Retired workers get `graceful_stop` to finish.
#[derive(Debug)]
pub struct ExternallyControlledExecutor {
    config: ExecutorConfig,
    control: ExternalControl,
}

impl ExternallyControlledExecutor {
    pub fn new(config: ExecutorConfig) -> Self {
        let (vus, max_vus) = match config.kind {
            ExecutorKind::ExternallyControlled { vus, max_vus, .. } => {
                (vus, max_vus.unwrap_or(vus))
            }
            _ => (0, 0),
        };
        let (target, _) = watch::channel(vus);
        let control = ExternalControl {
            name: Arc::from(config.name.as_str()),
            target: Arc::new(target),
            max_vus,
            stop: CancellationToken::new(),
        };
        Self { config, control }
    }

    pub fn control(&self) -> ExternalControl {
        self.control.clone()
    }

    async fn follow<R: Runner>(
        &self,
        ctx: &ExecutionContext<R>,
        scaler: &mut VuScaler<R>,
        stop: &StopSignals,
    ) -> Result<()> {
        let name = &self.config.name;
        let mut targets = self.control.target.subscribe();
        let initial = *targets.borrow_and_update();
        scaler.scale_to(initial)?;

        let mut tick = tokio::time::interval(ctx.options.tick);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                biased;
                _ = stop.soft.cancelled() => return Ok(()),
                _ = self.control.stop.cancelled() => {
                    tracing::info!(executor = %name, "Stopped through its control handle");
                    return Ok(());
                }
                Ok(()) = targets.changed() => {
                    let target = *targets.borrow_and_update();
                    tracing::info!(executor = %name, "Target changed to {target} VUs");
                    scaler.scale_to(target)?;
                }
                _ = tick.tick() => scaler.reap()?,
            }
        }
    }
}

#[async_trait]
impl<R: Runner> Executor<R> for ExternallyControlledExecutor {
    fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    async fn run(&self, ctx: ExecutionContext<R>) -> Result<()> {
        let name = &self.config.name;
        let ExecutorKind::ExternallyControlled { duration, .. } = self.config.kind else {
            return Err(Error::config(format!(
                "executor '{name}' is not externally-controlled"
            )));
        };
        let graceful_stop = self.config.graceful_stop;
        let stop = StopSignals::arm(&ctx.cancel, duration, graceful_stop, ctx.options.cancel_grace);
        if duration.is_some_and(|d| d.is_zero()) {
            tracing::info!(executor = %name, "Zero duration, nothing to run");
            return Ok(());
        }

        tracing::info!(executor = %name, "Following external target, up to {} VUs", self.control.max_vus);
        ctx.tracker.set_phase(ExecutorPhase::Running);
        let driver = IterationDriver::new(&ctx, &self.config);
        let mut scaler = VuScaler::new(&ctx, driver, &stop, graceful_stop);

        let res = self.follow(&ctx, &mut scaler, &stop).await;

        ctx.tracker.set_phase(ExecutorPhase::Draining);
        let joined = scaler.shutdown().await;
        tracing::info!(executor = %name, "Done");
        res.and(joined)
    }
}
