//! Runs the configured executors against one shared pool, pipeline and aggregator.

use std::{collections::HashMap, sync::Arc, time::Duration};

use serde::Serialize;
use tokio::{
    task::{JoinHandle, JoinSet},
    time::{Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use crate::{
    aggregator::{Aggregator, Snapshot},
    config::RunConfig,
    error::{Error, Result},
    executor::{self, ExecutionContext, Executor, ExternalControl},
    metric::{builtin, MetricKind, MetricRegistry},
    pipeline::{Pipeline, SampleSender},
    pool::VuPool,
    report::{self, Reporter},
    runner::Runner,
    sample::{Sample, SampleBatch},
    state::{ExecutorPhase, ExecutorTracker, Progress, RunState},
};

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    /// Every executor ran to its end.
    Completed,
    /// The run's token was canceled.
    Canceled,
    /// At least one executor failed fatally.
    Errored,
}

/// How one executor ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutorStatus {
    Finished,
    Canceled,
    Errored,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutorReport {
    pub name: String,
    pub status: ExecutorStatus,
    pub error: Option<String>,
}

/// Outcome of [`Controller::run`]. Produced for every run whose config was accepted.
#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub status: RunStatus,
    /// In configuration order.
    pub executors: Vec<ExecutorReport>,
    pub iterations_completed: u64,
    pub iterations_failed: u64,
    pub iterations_interrupted: u64,
    pub dropped_iterations: u64,
    pub peak_active_vus: u64,
    pub snapshot: Snapshot,
    #[serde(with = "humantime_serde")]
    pub elapsed: Duration,
}

impl RunResult {
    pub fn executor(&self, name: &str) -> Option<&ExecutorReport> {
        self.executors.iter().find(|e| e.name == name)
    }
}

struct Planned<R: Runner> {
    executor: Arc<dyn Executor<R>>,
    tracker: Arc<ExecutorTracker>,
}

/// Owns a validated run configuration and everything needed to execute it once.
///
/// ```rust,no_run
/// use tropa::{runner_fn, Controller, RunConfig, SampleBatch, BoxError};
/// use tokio_util::sync::CancellationToken;
///
/// # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
/// let config = RunConfig::from_yaml_str(
///     r#"
/// executors:
///   - name: smoke
///     executor: shared-iterations
///     vus: 1
///     iterations: 3
/// "#,
/// )?;
/// let runner = runner_fn(|_info| async {
///     let mut batch = SampleBatch::new();
///     batch.add("checks", 1.0);
///     Ok::<_, BoxError>(batch)
/// });
///
/// let result = Controller::new(config, runner)?.run(CancellationToken::new()).await?;
/// assert_eq!(result.snapshot.value("checks"), Some(3.0));
/// # Ok(())
/// # }
/// ```
pub struct Controller<R: Runner> {
    config: RunConfig,
    runner: Arc<R>,
    aggregator: Aggregator,
    reporters: Vec<Arc<dyn Reporter>>,
    state: Arc<RunState>,
    executors: Vec<Planned<R>>,
    controls: HashMap<String, ExternalControl>,
}

impl<R: Runner> Controller<R> {
    /// Validate `config` and build its executors. Nothing starts until [`run`](Self::run).
    pub fn new(config: RunConfig, runner: R) -> Result<Self> {
        config.validate()?;

        let mut executors = Vec::with_capacity(config.executors.len());
        let mut controls = HashMap::new();
        for exec_config in &config.executors {
            let tracker = Arc::new(ExecutorTracker::new(
                Arc::from(exec_config.name.as_str()),
                exec_config.kind.stage_count(),
            ));
            let (executor, control) = executor::build::<R>(exec_config.clone());
            if let Some(control) = control {
                controls.insert(exec_config.name.clone(), control);
            }
            executors.push(Planned {
                executor: Arc::from(executor),
                tracker,
            });
        }

        let state = Arc::new(RunState::new());
        state.set_executors(executors.iter().map(|p| p.tracker.clone()).collect());

        Ok(Self {
            config,
            runner: Arc::new(runner),
            aggregator: Aggregator::new(MetricRegistry::new()),
            reporters: Vec::new(),
            state,
            executors,
            controls,
        })
    }

    /// Register a user metric so its samples are reduced as `kind`.
    pub fn with_metric(self, name: impl Into<String>, kind: MetricKind) -> Self {
        self.aggregator.register(name, kind);
        self
    }

    pub fn with_reporter(mut self, reporter: impl Reporter + 'static) -> Self {
        self.reporters.push(Arc::new(reporter));
        self
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Pollable run progress. Stays valid after the run.
    pub fn progress(&self) -> Progress {
        Progress::new(self.state.clone())
    }

    /// Control handle of an `externally-controlled` executor.
    pub fn external_control(&self, name: &str) -> Option<ExternalControl> {
        self.controls.get(name).cloned()
    }

    /// Live summaries, for snapshots while the run is going.
    pub fn aggregator(&self) -> Aggregator {
        self.aggregator.clone()
    }

    /// Run every executor to its end.
    ///
    /// Canceling `cancel` stops every executor (honoring their graceful stop) and
    /// yields a [`RunStatus::Canceled`] result. Errors are only returned for failures
    /// of the run machinery itself; executor failures end up in the result.
    pub async fn run(self, cancel: CancellationToken) -> Result<RunResult> {
        let options = Arc::new(self.config.options.clone());
        let pool_size = self.config.pool_size();
        tracing::info!(
            "Starting run with {} executors and up to {pool_size} VUs",
            self.executors.len()
        );

        self.state.start();
        let pool = Arc::new(VuPool::new(
            self.runner.clone(),
            self.state.clone(),
            pool_size as usize,
        ));
        let (mut pipeline, rx) = Pipeline::new(options.pipeline_capacity);
        let consumer = self.aggregator.spawn(rx, options.aggregation_batch);
        let samples = pipeline.sender().ok_or(Error::PipelineClosed)?;

        // A fatal executor error cancels the run, not the caller's token
        let run = cancel.child_token();
        let background = CancellationToken::new();
        let sampler = spawn_vu_sampler(
            samples.clone(),
            self.state.clone(),
            options.vu_sample_interval,
            background.clone(),
        );
        let reporters: Arc<[Arc<dyn Reporter>]> = Arc::from(self.reporters);
        let flusher = (!reporters.is_empty()).then(|| {
            report::spawn_flusher(
                self.aggregator.clone(),
                reporters.clone(),
                options.flush_interval,
                background.clone(),
            )
        });

        let mut tasks = JoinSet::new();
        for (index, planned) in self.executors.iter().enumerate() {
            let ctx = ExecutionContext::new(
                pool.clone(),
                samples.clone(),
                self.state.clone(),
                planned.tracker.clone(),
                run.clone(),
                options.clone(),
            );
            let executor = planned.executor.clone();
            tasks.spawn(async move { (index, run_executor(executor, ctx).await) });
        }
        drop(samples);

        let mut reports: Vec<Option<ExecutorReport>> = vec![None; self.executors.len()];
        while let Some(res) = tasks.join_next().await {
            let (index, report) = res?;
            if report.status == ExecutorStatus::Errored && !run.is_cancelled() {
                tracing::error!(executor = %report.name, "Aborting the run");
                run.cancel();
            }
            reports[index] = Some(report);
        }
        let executors: Vec<ExecutorReport> = reports.into_iter().flatten().collect();

        background.cancel();
        if let Err(e) = sampler.await {
            tracing::error!("VU sampler panicked with error: {e}");
        }
        pipeline.close();
        let snapshot = consumer.await?;
        if let Some(flusher) = flusher {
            if let Err(e) = flusher.await {
                tracing::error!("Reporter flusher panicked with error: {e}");
            }
        }
        report::report_all(&reporters, &snapshot).await;
        pool.dispose().await;

        let status = if executors.iter().any(|e| e.status == ExecutorStatus::Errored) {
            RunStatus::Errored
        } else if cancel.is_cancelled() {
            RunStatus::Canceled
        } else {
            RunStatus::Completed
        };
        let elapsed = self.state.elapsed();
        tracing::info!("Run {status:?} after {elapsed:?}");

        Ok(RunResult {
            status,
            executors,
            iterations_completed: self.state.iterations_completed(),
            iterations_failed: self.state.iterations_failed(),
            iterations_interrupted: self.state.iterations_interrupted(),
            dropped_iterations: self.state.dropped_iterations(),
            peak_active_vus: self.state.peak_active_vus(),
            snapshot,
            elapsed,
        })
    }
}

/// Wait for the executor's start time, run it and turn the outcome into a report.
async fn run_executor<R: Runner>(
    executor: Arc<dyn Executor<R>>,
    ctx: ExecutionContext<R>,
) -> ExecutorReport {
    let config = executor.config();
    let name = config.name.clone();
    let tracker = ctx.tracker.clone();
    let cancel = ctx.cancel.clone();

    if !config.start_time.is_zero() {
        tracing::info!(executor = %name, "Starting in {:?}", config.start_time);
        tokio::select! {
            _ = cancel.cancelled() => {
                tracker.set_phase(ExecutorPhase::Canceled);
                return ExecutorReport { name, status: ExecutorStatus::Canceled, error: None };
            }
            _ = tokio::time::sleep(config.start_time) => {}
        }
    }

    tracing::info!(executor = %name, "Starting {}", config.kind.name());
    tracker.set_phase(ExecutorPhase::Started);
    // Its own task, so a panic inside the executor surfaces as a join error
    let res = {
        let executor = executor.clone();
        match tokio::spawn(async move { executor.run(ctx).await }).await {
            Ok(res) => res,
            Err(e) => Err(Error::Join(e)),
        }
    };

    let (phase, status, error) = match res {
        Ok(()) if cancel.is_cancelled() => (ExecutorPhase::Canceled, ExecutorStatus::Canceled, None),
        Ok(()) => (ExecutorPhase::Finished, ExecutorStatus::Finished, None),
        Err(e) => {
            tracing::error!(executor = %name, "Executor failed: {e}");
            (ExecutorPhase::Errored, ExecutorStatus::Errored, Some(e.to_string()))
        }
    };
    tracker.set_phase(phase);
    ExecutorReport { name, status, error }
}

async fn push_vus(samples: &SampleSender, state: &RunState) {
    let mut batch = SampleBatch::with_capacity(2);
    batch.push(Sample::new(builtin::VUS, state.active_vus() as f64));
    batch.push(Sample::new(builtin::VUS_MAX, state.initialized_vus() as f64));
    if let Err(e) = samples.push(batch).await {
        tracing::warn!("Lost VU samples: {e}");
    }
}

/// Sample `vus` and `vus_max` every `interval`, and once more when `stop` fires.
fn spawn_vu_sampler(
    samples: SampleSender,
    state: Arc<RunState>,
    interval: Duration,
    stop: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval_at(Instant::now(), interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                _ = tick.tick() => push_vus(&samples, &state).await,
            }
        }
        push_vus(&samples, &state).await;
    })
}
