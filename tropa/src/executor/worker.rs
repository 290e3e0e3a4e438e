//! Running iterations on VUs, and the worker tasks that loop them.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::{task::JoinSet, time::Instant};
use tokio_util::sync::CancellationToken;

use super::{ExecutionContext, StopSignals};
use crate::{
    config::ExecutorConfig,
    error::{Error, Result},
    metric::builtin,
    pipeline::SampleSender,
    pool::{Vu, VuPool, VuState},
    runner::{IterationInfo, Runner},
    sample::{Sample, SampleBatch, Tags},
    state::{ActiveGuard, ExecutorTracker, RunState},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IterationOutcome {
    Completed,
    Failed,
    Interrupted,
}

/// Runs single iterations for one executor and accounts for them.
pub(crate) struct IterationDriver<R: Runner> {
    runner: Arc<R>,
    samples: SampleSender,
    state: Arc<RunState>,
    tracker: Arc<ExecutorTracker>,
    tags: Arc<Tags>,
    iterations: Arc<AtomicU64>,
}

impl<R: Runner> Clone for IterationDriver<R> {
    fn clone(&self) -> Self {
        Self {
            runner: self.runner.clone(),
            samples: self.samples.clone(),
            state: self.state.clone(),
            tracker: self.tracker.clone(),
            tags: self.tags.clone(),
            iterations: self.iterations.clone(),
        }
    }
}

impl<R: Runner> IterationDriver<R> {
    pub(crate) fn new(ctx: &ExecutionContext<R>, config: &ExecutorConfig) -> Self {
        let mut tags = config.tags.clone();
        tags.insert(builtin::SCENARIO_TAG.to_string(), config.name.clone());
        Self {
            runner: ctx.pool.runner().clone(),
            samples: ctx.samples.clone(),
            state: ctx.state.clone(),
            tracker: ctx.tracker.clone(),
            tags: Arc::new(tags),
            iterations: Arc::new(AtomicU64::new(0)),
        }
    }

    fn builtin(&self, metric: &str, value: f64) -> Sample {
        Sample::new(metric, value).with_tags((*self.tags).clone())
    }

    /// Run one iteration on `vu`. `hard` interrupts it, discarding its samples.
    ///
    /// A completed iteration's batch gets the built-in `iterations` and
    /// `iteration_duration` samples appended and is pushed as a whole.
    pub(crate) async fn run_once(
        &self,
        vu: &mut Vu<R::State>,
        hard: &CancellationToken,
    ) -> IterationOutcome {
        let info = IterationInfo {
            vu: vu.id(),
            executor: self.tracker.name().clone(),
            iteration: self.iterations.fetch_add(1, Ordering::Relaxed),
            vu_iteration: vu.iterations(),
        };

        vu.set_state(VuState::Running);
        let started = Instant::now();
        let res = tokio::select! {
            biased;
            _ = hard.cancelled() => None,
            res = self.runner.run_iteration(&mut vu.data, &info) => Some(res),
        };
        vu.set_state(VuState::Idle);

        match res {
            None => {
                tracing::debug!(executor = %self.tracker.name(), vu = info.vu, "Iteration interrupted");
                self.state.iteration_interrupted();
                IterationOutcome::Interrupted
            }
            Some(Err(e)) => {
                tracing::warn!(executor = %self.tracker.name(), vu = info.vu, "Iteration failed: {e}");
                self.state.iteration_failed(&self.tracker);
                IterationOutcome::Failed
            }
            Some(Ok(mut batch)) => {
                let elapsed = started.elapsed();
                vu.iteration_done();
                batch.push(self.builtin(builtin::ITERATIONS, 1.0));
                batch.push(self.builtin(
                    builtin::ITERATION_DURATION,
                    elapsed.as_secs_f64() * 1_000.0,
                ));
                if let Err(e) = self.samples.push(batch).await {
                    tracing::warn!(executor = %self.tracker.name(), "Lost iteration samples: {e}");
                }
                self.state.iteration_completed(&self.tracker);
                IterationOutcome::Completed
            }
        }
    }

    /// Loop iterations on `vu` until `soft` fires, `claim` refuses another one or an
    /// iteration is interrupted.
    pub(crate) async fn vu_loop<F>(
        &self,
        vu: &mut Vu<R::State>,
        soft: &CancellationToken,
        hard: &CancellationToken,
        claim: &mut F,
    ) where
        F: FnMut() -> bool + Send,
    {
        while !soft.is_cancelled() && claim() {
            if self.run_once(vu, hard).await == IterationOutcome::Interrupted {
                break;
            }
            // Iterations that never await would otherwise starve the stop timers
            tokio::task::yield_now().await;
        }
    }

    /// Count `n` arrival-rate slots that could not be started. Their samples are
    /// owed until [`try_flush_dropped`](Self::try_flush_dropped) or
    /// [`flush_dropped`](Self::flush_dropped) hands them to the pipeline.
    pub(crate) fn count_dropped(&self, n: u64, owed: &mut u64) {
        if n == 0 {
            return;
        }
        self.state.iterations_dropped(&self.tracker, n);
        *owed += n;
    }

    fn dropped_batch(&self, n: u64) -> SampleBatch {
        SampleBatch::from(vec![self.builtin(builtin::DROPPED_ITERATIONS, n as f64)])
    }

    /// Push owed dropped-iteration samples if the pipeline has room right now.
    pub(crate) fn try_flush_dropped(&self, owed: &mut u64) {
        if *owed == 0 {
            return;
        }
        match self.samples.try_push(self.dropped_batch(*owed)) {
            Ok(()) => *owed = 0,
            Err(_) if self.samples.is_closed() => {
                tracing::warn!(executor = %self.tracker.name(), "Lost {owed} dropped-iteration samples");
                *owed = 0;
            }
            // Full, try again later
            Err(_) => {}
        }
    }

    /// Push owed dropped-iteration samples, waiting for room.
    pub(crate) async fn flush_dropped(&self, owed: &mut u64) {
        if *owed == 0 {
            return;
        }
        if let Err(e) = self.samples.push(self.dropped_batch(*owed)).await {
            tracing::warn!(executor = %self.tracker.name(), "Lost dropped-iteration samples: {e}");
        }
        *owed = 0;
    }
}

/// Take a VU, loop iterations on it, give it back.
async fn worker_task<R, F>(
    pool: Arc<VuPool<R>>,
    state: Arc<RunState>,
    driver: IterationDriver<R>,
    soft: CancellationToken,
    hard: CancellationToken,
    mut claim: F,
) -> Result<()>
where
    R: Runner,
    F: FnMut() -> bool + Send + 'static,
{
    let mut vu = match pool.get(&soft).await {
        Ok(vu) => vu,
        // Told to stop before a VU freed up
        Err(Error::PoolExhausted { .. }) => return Ok(()),
        Err(e) => return Err(e),
    };
    tracing::debug!(executor = %driver.tracker.name(), vu = vu.id(), "Worker started");

    let slot = pool.guard(&vu);
    let active = ActiveGuard::new(state, driver.tracker.clone());
    driver.vu_loop(&mut vu, &soft, &hard, &mut claim).await;
    drop(active);

    tracing::debug!(executor = %driver.tracker.name(), vu = vu.id(), "Worker shutting down");
    slot.disarm();
    pool.put(vu);
    Ok(())
}

fn check_worker(res: std::result::Result<Result<()>, tokio::task::JoinError>) -> Result<()> {
    match res {
        Ok(res) => res,
        Err(e) if e.is_panic() => {
            // Keep going: one panicking worker must not throw away the others' data
            tracing::error!("Worker panicked with error: {e}");
            Ok(())
        }
        Err(_) => Ok(()),
    }
}

struct WorkerTokens {
    soft: CancellationToken,
    hard: CancellationToken,
}

/// Keeps a number of looping workers alive for one executor.
///
/// Workers are started and retired newest-first. A retired worker finishes its
/// iteration; if that takes longer than `ramp_down` it is interrupted.
pub(crate) struct VuScaler<R: Runner> {
    pool: Arc<VuPool<R>>,
    state: Arc<RunState>,
    driver: IterationDriver<R>,
    soft: CancellationToken,
    hard: CancellationToken,
    ramp_down: Duration,
    workers: Vec<WorkerTokens>,
    tasks: JoinSet<Result<()>>,
    timers: JoinSet<()>,
}

impl<R: Runner> VuScaler<R> {
    pub(crate) fn new(
        ctx: &ExecutionContext<R>,
        driver: IterationDriver<R>,
        stop: &StopSignals,
        ramp_down: Duration,
    ) -> Self {
        Self {
            pool: ctx.pool.clone(),
            state: ctx.state.clone(),
            driver,
            soft: stop.soft.clone(),
            hard: stop.hard.clone(),
            ramp_down,
            workers: Vec::new(),
            tasks: JoinSet::new(),
            timers: JoinSet::new(),
        }
    }

    /// Workers currently asked to run.
    pub(crate) fn len(&self) -> usize {
        self.workers.len()
    }

    /// Start one more worker. It runs iterations for as long as `claim` agrees.
    pub(crate) fn spawn_worker<F>(&mut self, claim: F)
    where
        F: FnMut() -> bool + Send + 'static,
    {
        let tokens = WorkerTokens {
            soft: self.soft.child_token(),
            hard: self.hard.child_token(),
        };
        self.tasks.spawn(worker_task(
            self.pool.clone(),
            self.state.clone(),
            self.driver.clone(),
            tokens.soft.clone(),
            tokens.hard.clone(),
            claim,
        ));
        self.workers.push(tokens);
    }

    /// Start or retire looping workers until `target` are running.
    pub(crate) fn scale_to(&mut self, target: u64) -> Result<()> {
        self.reap()?;
        let target = target as usize;
        if target != self.workers.len() {
            tracing::debug!(
                executor = %self.driver.tracker.name(),
                "Scaling from {} to {target} VUs",
                self.workers.len()
            );
        }
        while self.workers.len() < target {
            self.spawn_worker(|| true);
        }
        while self.workers.len() > target {
            let Some(retired) = self.workers.pop() else {
                break;
            };
            retired.soft.cancel();
            let grace = self.ramp_down;
            self.timers.spawn(async move {
                tokio::time::sleep(grace).await;
                retired.hard.cancel();
            });
        }
        Ok(())
    }

    /// Collect finished workers without waiting, surfacing the first fatal error.
    pub(crate) fn reap(&mut self) -> Result<()> {
        while let Some(res) = self.tasks.try_join_next() {
            check_worker(res)?;
        }
        Ok(())
    }

    /// Wait until `stop` fires or every worker has returned on its own.
    pub(crate) async fn supervise(&mut self, stop: &CancellationToken) -> Result<()> {
        loop {
            tokio::select! {
                _ = stop.cancelled() => return Ok(()),
                res = self.tasks.join_next() => match res {
                    Some(res) => check_worker(res)?,
                    None => return Ok(()),
                },
            }
        }
    }

    /// Stop every worker and wait for all of them, even after a failure.
    pub(crate) async fn shutdown(mut self) -> Result<()> {
        self.soft.cancel();
        let mut first_err = None;
        while let Some(res) = self.tasks.join_next().await {
            if let Err(e) = check_worker(res) {
                tracing::error!(executor = %self.driver.tracker.name(), "Worker failed: {e}");
                first_err.get_or_insert(e);
            }
        }
        self.timers.abort_all();
        first_err.map_or(Ok(()), Err)
    }
}
