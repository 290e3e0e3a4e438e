//! Arrival-rate executors: iterations start on a schedule, whatever the VUs are doing.
//!
//! The executor owns a small fleet of VUs. `pre_allocated_vus` are taken from the
//! pool up front; every [`Pacer`] slot then starts one iteration on an idle VU of the
//! fleet. If none is idle the slot is dropped (never waited for) and, while the fleet
//! is below `max_vus`, one more VU is requested from the pool in the background.
//!
//! Slot `n` starts at the instant the integral of the configured rate reaches `n`,
//! so a constant rate `R` over `D` seconds starts `ceil(R·D)` iterations.

use async_trait::async_trait;
use tokio::{
    task::{JoinError, JoinSet},
    time::Instant,
};

use super::{worker::IterationDriver, ExecutionContext, Executor, StopSignals};
use crate::{
    config::{ExecutorConfig, ExecutorKind, PacingOptions},
    error::{Error, Result},
    pacer::{Pacer, RateMonitor, RateSchedule},
    pool::Vu,
    runner::Runner,
    state::{ActiveGuard, ExecutorPhase},
};

/// Drives `constant-arrival-rate` and `ramping-arrival-rate` executors.
#[derive(Debug, Clone)]
pub struct ArrivalRateExecutor {
    config: ExecutorConfig,
}

impl ArrivalRateExecutor {
    pub fn new(config: ExecutorConfig) -> Self {
        Self { config }
    }

    /// Schedule, pre-allocated VUs and fleet ceiling.
    fn plan(&self) -> Result<(RateSchedule, u64, u64)> {
        match &self.config.kind {
            ExecutorKind::ConstantArrivalRate {
                rate,
                time_unit,
                duration,
                pre_allocated_vus,
                max_vus,
            } => Ok((
                RateSchedule::constant(*rate, *time_unit, *duration),
                *pre_allocated_vus,
                max_vus.unwrap_or(*pre_allocated_vus),
            )),
            ExecutorKind::RampingArrivalRate {
                start_rate,
                time_unit,
                stages,
                pre_allocated_vus,
                max_vus,
            } => Ok((
                RateSchedule::new(*start_rate, stages, *time_unit),
                *pre_allocated_vus,
                max_vus.unwrap_or(*pre_allocated_vus),
            )),
            _ => Err(Error::config(format!(
                "executor '{}' is not an arrival-rate executor",
                self.config.name
            ))),
        }
    }

    fn is_staged(&self) -> bool {
        matches!(self.config.kind, ExecutorKind::RampingArrivalRate { .. })
    }
}

/// VUs owned by one arrival-rate executor.
struct Fleet<R: Runner> {
    ctx: ExecutionContext<R>,
    driver: IterationDriver<R>,
    idle: Vec<Vu<R::State>>,
    /// Iterations in flight, each handing its VU back when done.
    running: JoinSet<Vu<R::State>>,
    /// Background acquisitions.
    growing: JoinSet<Result<Vu<R::State>>>,
    /// VUs owned or being acquired.
    allocated: u64,
    max_vus: u64,
    warned_max: bool,
}

impl<R: Runner> Fleet<R> {
    fn new(ctx: ExecutionContext<R>, driver: IterationDriver<R>, max_vus: u64) -> Self {
        Self {
            ctx,
            driver,
            idle: Vec::new(),
            running: JoinSet::new(),
            growing: JoinSet::new(),
            allocated: 0,
            max_vus,
            warned_max: false,
        }
    }

    fn name(&self) -> &str {
        self.ctx.tracker.name()
    }

    /// Take `n` VUs before the first slot. Running out of time for it is fatal
    /// unless the run itself was canceled.
    async fn pre_allocate(&mut self, n: u64, stop: &StopSignals) -> Result<()> {
        tracing::debug!(executor = %self.name(), "Pre-allocating {n} VUs");
        for _ in 0..n {
            match self.ctx.pool.get(&stop.soft).await {
                Ok(vu) => {
                    self.idle.push(vu);
                    self.allocated += 1;
                }
                // The run was canceled before pacing began
                Err(Error::PoolExhausted { .. }) if self.ctx.cancel.is_cancelled() => {
                    return Ok(())
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Take back VUs of finished iterations and finished acquisitions.
    fn reclaim(&mut self) -> Result<()> {
        while let Some(res) = self.running.try_join_next() {
            self.returned(res);
        }
        while let Some(res) = self.growing.try_join_next() {
            self.grown(res)?;
        }
        Ok(())
    }

    fn returned(&mut self, res: std::result::Result<Vu<R::State>, JoinError>) {
        match res {
            Ok(vu) => self.idle.push(vu),
            Err(e) => {
                // The VU went down with the task and its slot went back to the pool
                tracing::error!(executor = %self.name(), "Iteration task panicked with error: {e}");
                self.allocated -= 1;
            }
        }
    }

    fn grown(&mut self, res: std::result::Result<Result<Vu<R::State>>, JoinError>) -> Result<()> {
        match res {
            Ok(Ok(vu)) => {
                tracing::debug!(executor = %self.name(), vu = vu.id(), "Fleet grew to {} VUs", self.allocated);
                self.idle.push(vu);
                Ok(())
            }
            Ok(Err(Error::PoolExhausted { .. })) => {
                self.allocated -= 1;
                Ok(())
            }
            Ok(Err(e)) => {
                self.allocated -= 1;
                Err(e)
            }
            Err(e) => {
                tracing::error!(executor = %self.name(), "VU acquisition panicked with error: {e}");
                self.allocated -= 1;
                Ok(())
            }
        }
    }

    /// Start one iteration if a VU is idle. Returns whether it started.
    fn start(&mut self, stop: &StopSignals) -> bool {
        let Some(mut vu) = self.idle.pop() else {
            self.grow(stop);
            return false;
        };
        let driver = self.driver.clone();
        let hard = stop.hard.clone();
        let slot = self.ctx.pool.guard(&vu);
        let guard = ActiveGuard::new(self.ctx.state.clone(), self.ctx.tracker.clone());
        self.running.spawn(async move {
            let _active = guard;
            driver.run_once(&mut vu, &hard).await;
            slot.disarm();
            vu
        });
        true
    }

    fn grow(&mut self, stop: &StopSignals) {
        if self.allocated >= self.max_vus {
            if !self.warned_max {
                self.warned_max = true;
                tracing::warn!(
                    executor = %self.name(),
                    "Insufficient VUs, reached {} and cannot allocate more; iterations are being dropped",
                    self.max_vus
                );
            }
            return;
        }
        self.allocated += 1;
        let pool = self.ctx.pool.clone();
        let soft = stop.soft.clone();
        self.growing.spawn(async move { pool.get(&soft).await });
    }

    /// Wait for in-flight work and hand every VU back to the pool.
    async fn release(mut self) -> Result<()> {
        let mut first_err = None;
        while let Some(res) = self.running.join_next().await {
            self.returned(res);
        }
        while let Some(res) = self.growing.join_next().await {
            if let Err(e) = self.grown(res) {
                first_err.get_or_insert(e);
            }
        }
        tracing::debug!(executor = %self.name(), "Returning {} VUs", self.idle.len());
        for vu in self.idle.drain(..) {
            self.ctx.pool.put(vu);
        }
        first_err.map_or(Ok(()), Err)
    }
}

#[async_trait]
impl<R: Runner> Executor<R> for ArrivalRateExecutor {
    fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    async fn run(&self, ctx: ExecutionContext<R>) -> Result<()> {
        let name = &self.config.name;
        let (schedule, pre_allocated, max_vus) = self.plan()?;
        let total = schedule.total_duration();
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

        let driver = IterationDriver::new(&ctx, &self.config);
        let mut fleet = Fleet::new(ctx.clone(), driver.clone(), max_vus);
        let allocated = fleet.pre_allocate(pre_allocated, &stop).await;
        let res = match allocated {
            Ok(()) => {
                tracing::info!(
                    executor = %name,
                    "Starting {} iterations over {total:?} with {pre_allocated}..{max_vus} VUs",
                    schedule.total_slots()
                );
                ctx.tracker.set_phase(ExecutorPhase::Running);
                let pacer = Pacer::new(schedule, ctx.options.pacing.max_lag);
                self.pace(&ctx, &driver, &mut fleet, &stop, pacer, &ctx.options.pacing)
                    .await
            }
            Err(e) => {
                tracing::error!(executor = %name, "Failed to pre-allocate {pre_allocated} VUs: {e}");
                Err(e)
            }
        };

        ctx.tracker.set_phase(ExecutorPhase::Draining);
        stop.stop();
        let released = fleet.release().await;
        tracing::info!(executor = %name, "Done");
        res.and(released)
    }
}

impl ArrivalRateExecutor {
    async fn pace<R: Runner>(
        &self,
        ctx: &ExecutionContext<R>,
        driver: &IterationDriver<R>,
        fleet: &mut Fleet<R>,
        stop: &StopSignals,
        mut pacer: Pacer,
        pacing: &PacingOptions,
    ) -> Result<()> {
        let name = &self.config.name;
        let staged = self.is_staged();
        let total = pacer.schedule().total_duration();
        let mut monitor = RateMonitor::new(pacing.rate_tolerance, pacing.rate_grace);
        let mut started = 0u64;
        let mut reported_skips = 0u64;
        // Dropped slots whose samples have not been pushed yet
        let mut owed = 0u64;
        let mut stopped = false;
        let start = Instant::now();

        while let Some(slot) = pacer.next_slot(start.elapsed()) {
            if slot.skipped > 0 {
                tracing::warn!(executor = %name, "Fell behind schedule, dropping {} iterations", slot.skipped);
                reported_skips += slot.skipped;
                driver.count_dropped(slot.skipped, &mut owed);
            }
            if staged {
                if let Some(stage) = pacer.schedule().stage_at(slot.offset) {
                    ctx.tracker.set_stage(stage);
                }
            }

            tokio::select! {
                biased;
                _ = stop.soft.cancelled() => {
                    stopped = true;
                    break;
                }
                _ = tokio::time::sleep_until(start + slot.offset) => {}
            }

            fleet.reclaim()?;
            if fleet.start(stop) {
                started += 1;
            } else {
                driver.count_dropped(1, &mut owed);
            }
            driver.try_flush_dropped(&mut owed);

            // Every slot up to and including this one was due
            let expected = (slot.index + 1) as f64;
            if monitor.observe(slot.offset, expected, started) {
                ctx.tracker.flag_rate_not_achieved();
                tracing::warn!(
                    executor = %name,
                    "Target rate not achieved: {started} of {expected} iterations started"
                );
            }
        }
        if !stopped {
            driver.count_dropped(pacer.skipped_total() - reported_skips, &mut owed);
        }
        driver.flush_dropped(&mut owed).await;

        // The schedule may run out before its duration does
        tokio::select! {
            _ = stop.soft.cancelled() => {}
            _ = tokio::time::sleep_until(start + total) => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::atomic::Ordering, time::Duration};

    use super::*;
    use crate::{
        config::Stage,
        error::BoxError,
        executor::testing::{harness, SleepRunner},
        metric::builtin,
        pipeline::pipeline,
        runner::{runner_fn, IterationInfo},
        sample::{sum_metric_values, Sample, SampleBatch},
    };

    fn constant(rate: u64, secs: u64, pre: u64, max: Option<u64>) -> ExecutorConfig {
        ExecutorConfig::builder()
            .name("arrivals")
            .kind(ExecutorKind::ConstantArrivalRate {
                rate,
                time_unit: Duration::from_secs(1),
                duration: Duration::from_secs(secs),
                pre_allocated_vus: pre,
                max_vus: max,
            })
            .build()
    }

    #[tokio::test(start_paused = true)]
    async fn starts_rate_times_duration_iterations() {
        let cfg = constant(50, 4, 5, Some(10));
        let h = harness(SleepRunner::new(Duration::from_millis(30)), &cfg, 10);

        let exec = ArrivalRateExecutor::new(cfg);
        exec.run(h.ctx.clone()).await.unwrap();

        let started = h.ctx.pool.runner().started.load(Ordering::SeqCst);
        assert!((190..=210).contains(&started), "started {started}");
        assert_eq!(h.ctx.state.dropped_iterations(), 0);
        assert!(!h.ctx.tracker.rate_not_achieved());
        assert_eq!(h.ctx.state.active_vus(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn drops_slots_when_no_vu_is_idle() {
        // 10/s but every iteration takes 1s on a single VU
        let cfg = constant(10, 4, 1, None);
        let h = harness(SleepRunner::new(Duration::from_secs(1)), &cfg, 1);

        ArrivalRateExecutor::new(cfg).run(h.ctx.clone()).await.unwrap();

        let completed = h.ctx.state.iterations_completed();
        let dropped = h.ctx.state.dropped_iterations();
        assert_eq!(completed, 4);
        assert_eq!(completed + dropped, 40);
        assert!(h.ctx.tracker.rate_not_achieved());

        let batches = h.samples().await;
        assert_eq!(
            sum_metric_values(&batches, builtin::DROPPED_ITERATIONS),
            dropped as f64
        );
    }

    #[tokio::test(start_paused = true)]
    async fn grows_the_fleet_up_to_max_vus() {
        let cfg = constant(20, 2, 1, Some(4));
        // Needs 3.6 VUs on average
        let h = harness(SleepRunner::new(Duration::from_millis(180)), &cfg, 4);

        ArrivalRateExecutor::new(cfg).run(h.ctx.clone()).await.unwrap();

        assert_eq!(h.ctx.pool.initialized(), 4);
        assert_eq!(h.ctx.pool.idle(), 4);
        assert!(h.ctx.state.iterations_completed() > 20);
    }

    #[tokio::test(start_paused = true)]
    async fn ramping_schedule_reports_stages() {
        let cfg = ExecutorConfig::builder()
            .name("ramp")
            .kind(ExecutorKind::RampingArrivalRate {
                start_rate: 0,
                time_unit: Duration::from_secs(1),
                stages: vec![
                    Stage::new(Duration::from_secs(1), 20),
                    Stage::new(Duration::from_secs(1), 20),
                ],
                pre_allocated_vus: 5,
                max_vus: None,
            })
            .build();
        let h = harness(SleepRunner::new(Duration::from_millis(10)), &cfg, 5);

        ArrivalRateExecutor::new(cfg).run(h.ctx.clone()).await.unwrap();
        assert_eq!(h.ctx.state.iterations_completed(), 30);
        assert_eq!(h.ctx.tracker.stage(), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_pacing() {
        let cfg = constant(10, 3600, 2, None);
        let h = harness(SleepRunner::new(Duration::from_millis(10)), &cfg, 2);
        let cancel = h.ctx.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1_050)).await;
            cancel.cancel();
        });

        ArrivalRateExecutor::new(cfg).run(h.ctx.clone()).await.unwrap();
        assert_eq!(h.ctx.state.iterations_completed(), 11);
        assert_eq!(h.ctx.pool.idle(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn pre_allocation_shortfall_is_fatal() {
        let cfg = constant(10, 2, 3, None);
        let h = harness(SleepRunner::new(Duration::from_millis(10)), &cfg, 1);

        let res = ArrivalRateExecutor::new(cfg).run(h.ctx.clone()).await;
        assert!(matches!(res, Err(Error::PoolExhausted { max: 1 })), "{res:?}");
        assert_eq!(h.ctx.state.iterations_completed(), 0);
        assert_eq!(h.ctx.pool.idle(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_during_pre_allocation_is_not_an_error() {
        let cfg = constant(10, 60, 3, None);
        let h = harness(SleepRunner::new(Duration::from_millis(10)), &cfg, 1);
        let cancel = h.ctx.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            cancel.cancel();
        });

        ArrivalRateExecutor::new(cfg).run(h.ctx.clone()).await.unwrap();
        assert_eq!(h.ctx.state.iterations_completed(), 0);
        assert_eq!(h.ctx.pool.idle(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn full_pipeline_never_holds_up_pacing() {
        let cfg = constant(10, 4, 1, None);
        let mut h = harness(SleepRunner::new(Duration::from_millis(10)), &cfg, 1);
        let (tx, mut rx) = pipeline(1);
        tx.try_push(SampleBatch::from(vec![Sample::new("filler", 1.0)]))
            .unwrap();
        h.ctx.samples = tx;

        let ctx = h.ctx.clone();
        let run = tokio::spawn(async move { ArrivalRateExecutor::new(cfg).run(ctx).await });

        // The only VU is stuck pushing its first batch; every later slot is dropped
        // on time instead of waiting for the pipeline
        tokio::time::sleep(Duration::from_millis(3_950)).await;
        assert_eq!(h.ctx.state.dropped_iterations(), 39);

        let drained = tokio::spawn(async move {
            let mut batches = Vec::new();
            while let Some(batch) = rx.drain().await {
                batches.push(batch);
            }
            batches
        });
        run.await.unwrap().unwrap();
        drop(h);
        let batches = drained.await.unwrap();
        assert_eq!(sum_metric_values(&batches, builtin::DROPPED_ITERATIONS), 39.0);
        assert_eq!(sum_metric_values(&batches, builtin::ITERATIONS), 1.0);
    }

    async fn crash_first(info: IterationInfo) -> Result<SampleBatch, BoxError> {
        if info.iteration == 0 {
            panic!("script crashed");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        Ok(SampleBatch::new())
    }

    #[tokio::test(start_paused = true)]
    async fn fleet_replaces_a_vu_lost_to_a_panic() {
        let cfg = constant(10, 1, 1, None);
        let h = harness(runner_fn(crash_first), &cfg, 1);

        ArrivalRateExecutor::new(cfg).run(h.ctx.clone()).await.unwrap();

        // Slot 0 panics, slot 1 finds no VU and regrows the fleet, the rest run
        assert_eq!(h.ctx.state.dropped_iterations(), 1);
        assert_eq!(h.ctx.state.iterations_completed(), 8);
        assert_eq!(h.ctx.pool.idle(), 1);
    }
}
