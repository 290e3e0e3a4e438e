use std::time::Duration;

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

/// Holds a fixed number of VUs looping iterations for a fixed duration.
#[derive(Debug, Clone)]
pub struct ConstantVusExecutor {
    config: ExecutorConfig,
}

impl ConstantVusExecutor {
    pub fn new(config: ExecutorConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl<R: Runner> Executor<R> for ConstantVusExecutor {
    fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    async fn run(&self, ctx: ExecutionContext<R>) -> Result<()> {
        let name = &self.config.name;
        let ExecutorKind::ConstantVus { vus, duration } = self.config.kind else {
            return Err(Error::config(format!("executor '{name}' is not constant-vus")));
        };
        let stop = StopSignals::arm(
            &ctx.cancel,
            Some(duration),
            self.config.graceful_stop,
            ctx.options.cancel_grace,
        );
        if duration.is_zero() {
            tracing::info!(executor = %name, "Zero duration, nothing to run");
            return Ok(());
        }

        tracing::info!(executor = %name, "Running {vus} VUs for {duration:?}");
        ctx.tracker.set_phase(ExecutorPhase::Running);
        let driver = IterationDriver::new(&ctx, &self.config);
        let mut scaler = VuScaler::new(&ctx, driver, &stop, Duration::ZERO);

        let res = match scaler.scale_to(vus) {
            Ok(()) => scaler.supervise(&stop.soft).await,
            Err(e) => Err(e),
        };

        ctx.tracker.set_phase(ExecutorPhase::Draining);
        let joined = scaler.shutdown().await;
        tracing::info!(executor = %name, "Done");
        res.and(joined)
    }
}
