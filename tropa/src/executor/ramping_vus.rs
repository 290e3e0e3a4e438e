use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{Instant, MissedTickBehavior};

use super::{
    worker::{IterationDriver, VuScaler},
    ExecutionContext, Executor, StopSignals,
};
use crate::{
    config::{ExecutorConfig, ExecutorKind, Stage},
    error::{Error, Result},
    runner::Runner,
    state::ExecutorPhase,
};

#[cfg(feature = "internals")]
pub use internals::*;
use internals::*;

/// Ramps the number of looping VUs from `start_vus` through a list of stages.
///
/// Every `tick` the target is re-evaluated. Extra workers are retired newest-first
/// and get `graceful_ramp_down` to finish the iteration they are in.
#[derive(Debug, Clone)]
pub struct RampingVusExecutor {
    config: ExecutorConfig,
}

impl RampingVusExecutor {
    pub fn new(config: ExecutorConfig) -> Self {
        Self { config }
    }

    async fn ramp<R: Runner>(
        &self,
        ctx: &ExecutionContext<R>,
        scaler: &mut VuScaler<R>,
        stop: &StopSignals,
        start_vus: u64,
        stages: &[Stage],
    ) -> Result<()> {
        let start = Instant::now();
        let mut tick = tokio::time::interval(ctx.options.tick);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = stop.soft.cancelled() => return Ok(()),
                _ = tick.tick() => {}
            }
            let Some((target, stage)) = vu_target(start_vus, stages, start.elapsed()) else {
                return Ok(());
            };
            ctx.tracker.set_stage(stage);
            scaler.scale_to(target)?;
        }
    }
}

#[async_trait]
impl<R: Runner> Executor<R> for RampingVusExecutor {
    fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    async fn run(&self, ctx: ExecutionContext<R>) -> Result<()> {
        let name = &self.config.name;
        let ExecutorKind::RampingVus {
            start_vus,
            ref stages,
            graceful_ramp_down,
        } = self.config.kind
        else {
            return Err(Error::config(format!("executor '{name}' is not ramping-vus")));
        };
        let total: Duration = stages.iter().map(|s| s.duration).sum();
        let stop = StopSignals::arm(
            &ctx.cancel,
            Some(total),
            self.config.graceful_stop,
            ctx.options.cancel_grace,
        );
        if total.is_zero() {
            tracing::info!(executor = %name, "Zero duration, nothing to run");
            return Ok(());
        }

        tracing::info!(executor = %name, "Ramping through {} stages over {total:?}", stages.len());
        ctx.tracker.set_phase(ExecutorPhase::Running);
        let driver = IterationDriver::new(&ctx, &self.config);
        let mut scaler = VuScaler::new(&ctx, driver, &stop, graceful_ramp_down);

        let res = self.ramp(&ctx, &mut scaler, &stop, start_vus, stages).await;

        ctx.tracker.set_phase(ExecutorPhase::Draining);
        let joined = scaler.shutdown().await;
        tracing::info!(executor = %name, "Done");
        res.and(joined)
    }
}

pub(crate) mod internals {
    use super::*;
    use crate::pacer::internals::lerp;

    /// Target VU count and stage index at `elapsed`, `None` once every stage is over.
    ///
    /// The interpolated count is rounded up in both directions: a ramp up adds a VU
    /// as soon as the line passes the current count, so a stage reaches its target
    /// while it is still running, and a ramp down only lets go of a VU once the line
    /// has fully crossed it.
    pub fn vu_target(start_vus: u64, stages: &[Stage], elapsed: Duration) -> Option<(u64, usize)> {
        let mut from = start_vus;
        let mut offset = Duration::ZERO;
        for (i, stage) in stages.iter().enumerate() {
            let end = offset + stage.duration;
            if elapsed < end {
                let t = (elapsed - offset).as_secs_f64() / stage.duration.as_secs_f64();
                let exact = lerp(from as f64, stage.target as f64, t);
                // Float noise above a whole count must not add a VU
                let target = (exact - 1e-9).ceil().max(0.0);
                return Some((target as u64, i));
            }
            from = stage.target;
            offset = end;
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::testing::{harness, SleepRunner};

    fn ms(ms: u64) -> Duration {
        Duration::from_millis(ms)
    }

    fn stages() -> Vec<Stage> {
        vec![
            Stage::new(Duration::from_secs(1), 1),
            Stage::new(Duration::from_secs(1), 3),
            Stage::new(Duration::from_secs(1), 0),
        ]
    }

    mod vu_target {
        use super::*;

        #[test]
        fn reaches_each_target_inside_its_stage() {
            let stages = stages();
            assert_eq!(vu_target(1, &stages, ms(0)), Some((1, 0)));
            assert_eq!(vu_target(1, &stages, ms(999)), Some((1, 0)));
            assert_eq!(vu_target(1, &stages, ms(1_000)), Some((1, 1)));
            assert_eq!(vu_target(1, &stages, ms(1_400)), Some((2, 1)));
            assert_eq!(vu_target(1, &stages, ms(1_500)), Some((2, 1)));
            assert_eq!(vu_target(1, &stages, ms(1_501)), Some((3, 1)));
            assert_eq!(vu_target(1, &stages, ms(1_999)), Some((3, 1)));
            assert_eq!(vu_target(1, &stages, ms(2_000)), Some((3, 2)));
            assert_eq!(vu_target(1, &stages, ms(2_400)), Some((2, 2)));
            assert_eq!(vu_target(1, &stages, ms(2_999)), Some((1, 2)));
            assert_eq!(vu_target(1, &stages, ms(3_000)), None);
        }

        #[test]
        fn zero_duration_stage_jumps() {
            let stages = [Stage::new(Duration::ZERO, 10), Stage::new(ms(1_000), 10)];
            assert_eq!(vu_target(0, &stages, ms(0)), Some((10, 1)));
        }

        #[test]
        fn start_vus_is_the_first_origin() {
            let stages = [Stage::new(ms(1_000), 0)];
            assert_eq!(vu_target(4, &stages, ms(0)), Some((4, 0)));
            assert_eq!(vu_target(4, &stages, ms(500)), Some((2, 0)));
            assert_eq!(vu_target(4, &stages, ms(501)), Some((2, 0)));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn peaks_at_the_highest_stage_and_ends_empty() {
        let cfg = ExecutorConfig::builder()
            .name("ramp")
            .kind(ExecutorKind::RampingVus {
                start_vus: 1,
                stages: stages(),
                graceful_ramp_down: Duration::from_secs(30),
            })
            .build();
        let h = harness(SleepRunner::new(ms(100)), &cfg, 3);

        RampingVusExecutor::new(cfg).run(h.ctx.clone()).await.unwrap();

        assert_eq!(h.ctx.state.peak_active_vus(), 3);
        assert_eq!(h.ctx.state.active_vus(), 0);
        assert_eq!(h.ctx.state.iterations_interrupted(), 0);
        assert_eq!(h.ctx.tracker.stage(), Some(2));
    }
}
