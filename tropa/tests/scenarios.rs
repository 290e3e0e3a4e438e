use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use tropa::{
    metric::builtin, runner_fn, BoxError, Controller, ExecutorStatus, IterationInfo, MetricKind,
    Reporter, RunConfig, RunStatus, Runner, SampleBatch, Snapshot,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[derive(Debug, Default)]
struct Counters {
    running: AtomicU64,
    peak: AtomicU64,
    started: AtomicU64,
}

/// Sleeps for a fixed latency, then reports `parts` samples of `part` and one `checks`.
struct CountingRunner {
    latency: Duration,
    parts: usize,
    counters: Arc<Counters>,
}

impl CountingRunner {
    fn new(latency: Duration) -> (Self, Arc<Counters>) {
        let counters = Arc::new(Counters::default());
        let runner = Self {
            latency,
            parts: 0,
            counters: counters.clone(),
        };
        (runner, counters)
    }
}

#[async_trait]
impl Runner for CountingRunner {
    type State = ();

    async fn setup_vu(&self, _vu: u64) -> Result<(), BoxError> {
        Ok(())
    }

    async fn run_iteration(&self, _state: &mut (), _info: &IterationInfo) -> Result<SampleBatch, BoxError> {
        self.counters.started.fetch_add(1, Ordering::SeqCst);
        let now = self.counters.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.peak.fetch_max(now, Ordering::SeqCst);

        let mut batch = SampleBatch::new();
        for _ in 0..self.parts {
            tokio::time::sleep(self.latency / self.parts as u32).await;
            batch.add("part", 1.0);
        }
        if self.parts == 0 {
            tokio::time::sleep(self.latency).await;
        }
        batch.add("checks", 1.0);

        self.counters.running.fetch_sub(1, Ordering::SeqCst);
        Ok(batch)
    }
}

#[tokio::test(start_paused = true)]
async fn shared_iterations_count_every_check() {
    init_tracing();
    let config = RunConfig::from_yaml_str(
        r#"
executors:
  - name: smoke
    executor: shared-iterations
    vus: 1
    iterations: 3
"#,
    )
    .unwrap();
    let runner = runner_fn(|_info| async {
        let mut batch = SampleBatch::new();
        batch.add("checks", 1.0);
        Ok::<_, BoxError>(batch)
    });

    let result = Controller::new(config, runner)
        .unwrap()
        .run(CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(result.snapshot.value("checks"), Some(3.0));
    assert_eq!(result.snapshot.value(builtin::ITERATIONS), Some(3.0));
    assert_eq!(result.iterations_completed, 3);
    assert_eq!(result.executors[0].status, ExecutorStatus::Finished);
}

#[tokio::test(start_paused = true)]
async fn ramping_vus_peaks_at_three_and_drains() {
    init_tracing();
    let config = RunConfig::from_yaml_str(
        r#"
executors:
  - name: ramp
    executor: ramping-vus
    stages:
      - { duration: 1s, target: 1 }
      - { duration: 1s, target: 3 }
      - { duration: 1s, target: 0 }
"#,
    )
    .unwrap();
    let (runner, counters) = CountingRunner::new(Duration::from_millis(100));

    let controller = Controller::new(config, runner).unwrap();
    let progress = controller.progress();
    let run = tokio::spawn(controller.run(CancellationToken::new()));

    let mut peak_by_stage: HashMap<String, u64> = HashMap::new();
    while !run.is_finished() {
        let snapshot = progress.snapshot();
        if let Some(stage) = snapshot.current_stage {
            let peak = peak_by_stage.entry(stage).or_default();
            *peak = (*peak).max(snapshot.active_vus);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let result = run.await.unwrap().unwrap();

    assert_eq!(peak_by_stage.get("ramp stage 1/3"), Some(&1));
    assert_eq!(peak_by_stage.get("ramp stage 2/3"), Some(&3));
    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(result.peak_active_vus, 3);
    assert_eq!(counters.peak.load(Ordering::SeqCst), 3);
    assert_eq!(progress.active_vus(), 0);
    assert_eq!(result.snapshot.value(builtin::VUS), Some(0.0));
}

#[tokio::test(start_paused = true)]
async fn cancellation_without_grace_ends_quickly() {
    init_tracing();
    let config = RunConfig::from_yaml_str(
        r#"
executors:
  - name: long
    executor: constant-vus
    vus: 4
    duration: 1h
    graceful_stop: 0s
"#,
    )
    .unwrap();
    let (runner, _) = CountingRunner::new(Duration::from_secs(30));

    let cancel = CancellationToken::new();
    let handle = tokio::spawn(Controller::new(config, runner).unwrap().run(cancel.clone()));
    tokio::time::sleep(Duration::from_millis(10)).await;
    cancel.cancel();

    let result = handle.await.unwrap().unwrap();
    assert_eq!(result.status, RunStatus::Canceled);
    assert_eq!(result.executors[0].status, ExecutorStatus::Canceled);
    assert!(result.elapsed < Duration::from_secs(1));
    assert_eq!(result.iterations_interrupted, 4);
    assert_eq!(result.snapshot.value("checks"), None);
}

#[tokio::test(start_paused = true)]
async fn cancellation_shortens_an_open_graceful_stop() {
    init_tracing();
    let config = RunConfig::from_yaml_str(
        r#"
executors:
  - name: slow
    executor: constant-vus
    vus: 1
    duration: 1s
    graceful_stop: 30s
options:
  cancel_grace: 1s
"#,
    )
    .unwrap();
    let (runner, _) = CountingRunner::new(Duration::from_secs(25));

    let cancel = CancellationToken::new();
    let handle = tokio::spawn(Controller::new(config, runner).unwrap().run(cancel.clone()));
    // The duration is over and the graceful stop is waiting for the iteration
    tokio::time::sleep(Duration::from_secs(2)).await;
    cancel.cancel();

    let result = handle.await.unwrap().unwrap();
    assert_eq!(result.status, RunStatus::Canceled);
    assert!(result.elapsed >= Duration::from_secs(3), "{:?}", result.elapsed);
    assert!(result.elapsed < Duration::from_secs(4), "{:?}", result.elapsed);
    assert_eq!(result.iterations_interrupted, 1);
    assert_eq!(result.iterations_completed, 0);
}

#[tokio::test(start_paused = true)]
async fn constant_arrival_rate_hits_the_target() {
    init_tracing();
    let config = RunConfig::from_yaml_str(
        r#"
executors:
  - name: arrivals
    executor: constant-arrival-rate
    rate: 20
    duration: 5s
    pre_allocated_vus: 10
"#,
    )
    .unwrap();
    let (runner, counters) = CountingRunner::new(Duration::from_millis(50));

    let result = Controller::new(config, runner)
        .unwrap()
        .run(CancellationToken::new())
        .await
        .unwrap();

    let started = counters.started.load(Ordering::SeqCst);
    assert!((95..=105).contains(&started), "started {started}");
    assert_eq!(result.dropped_iterations, 0);
    assert_eq!(result.snapshot.value(builtin::DROPPED_ITERATIONS), None);
}

#[tokio::test(start_paused = true)]
async fn graceful_stop_keeps_the_whole_batch() {
    init_tracing();
    let config = RunConfig::from_yaml_str(
        r#"
executors:
  - name: slow
    executor: constant-vus
    vus: 1
    duration: 1h
    graceful_stop: 30s
"#,
    )
    .unwrap();
    let counters = Arc::new(Counters::default());
    let runner = CountingRunner {
        latency: Duration::from_millis(600),
        parts: 3,
        counters,
    };

    let cancel = CancellationToken::new();
    let handle = tokio::spawn(Controller::new(config, runner).unwrap().run(cancel.clone()));
    // Mid-iteration, after the first part
    tokio::time::sleep(Duration::from_millis(250)).await;
    cancel.cancel();

    let result = handle.await.unwrap().unwrap();
    assert_eq!(result.status, RunStatus::Canceled);
    assert_eq!(result.iterations_completed, 1);
    assert_eq!(result.iterations_interrupted, 0);
    assert_eq!(result.snapshot.value("part"), Some(3.0));
    assert_eq!(result.snapshot.value("checks"), Some(1.0));
}

#[tokio::test(start_paused = true)]
async fn fixed_vus_never_exceed_their_count() {
    init_tracing();
    let config = RunConfig::from_yaml_str(
        r#"
executors:
  - name: steady
    executor: fixed-vus
    vus: 4
    duration: 2s
  - name: budget
    executor: per-vu-iterations
    vus: 2
    iterations: 5
    start_time: 1s
"#,
    )
    .unwrap();
    let (runner, counters) = CountingRunner::new(Duration::from_millis(30));

    let result = Controller::new(config, runner)
        .unwrap()
        .run(CancellationToken::new())
        .await
        .unwrap();

    // Both windows overlap, and no VU serves two executors at once
    assert_eq!(result.peak_active_vus, 6);
    assert_eq!(counters.peak.load(Ordering::SeqCst), 6);
    assert_eq!(result.snapshot.value(builtin::VUS_MAX), Some(6.0));
    assert_eq!(
        result.executors.iter().map(|e| e.name.as_str()).collect::<Vec<_>>(),
        vec!["steady", "budget"]
    );
}

#[tokio::test(start_paused = true)]
async fn externally_controlled_follows_its_handle() {
    init_tracing();
    let config = RunConfig::from_yaml_str(
        r#"
executors:
  - name: knob
    executor: externally-controlled
    vus: 1
    max_vus: 5
"#,
    )
    .unwrap();
    let (runner, counters) = CountingRunner::new(Duration::from_millis(20));

    let controller = Controller::new(config, runner).unwrap();
    let control = controller.external_control("knob").unwrap();
    assert!(controller.external_control("missing").is_none());
    let handle = tokio::spawn(controller.run(CancellationToken::new()));

    tokio::time::sleep(Duration::from_millis(500)).await;
    control.set_target(5).unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(control.set_target(6).is_err());
    control.stop();

    let result = handle.await.unwrap().unwrap();
    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(counters.peak.load(Ordering::SeqCst), 5);
}

#[derive(Default)]
struct Keep {
    snapshots: Arc<Mutex<Vec<Snapshot>>>,
}

#[async_trait]
impl Reporter for Keep {
    async fn report(&self, snapshot: &Snapshot) -> Result<(), BoxError> {
        self.snapshots.lock().push(snapshot.clone());
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn reporters_see_periodic_and_final_snapshots() {
    init_tracing();
    let config = RunConfig::from_yaml_str(
        r#"
executors:
  - name: steady
    executor: constant-vus
    vus: 2
    duration: 3450ms
options:
  flush_interval: 1s
"#,
    )
    .unwrap();
    let (runner, _) = CountingRunner::new(Duration::from_millis(100));
    let keep = Keep::default();
    let snapshots = keep.snapshots.clone();

    let result = Controller::new(config, runner)
        .unwrap()
        .with_metric("checks", MetricKind::Rate)
        .with_reporter(keep)
        .run(CancellationToken::new())
        .await
        .unwrap();

    let snapshots = snapshots.lock();
    // Three periodic flushes plus the final one
    assert_eq!(snapshots.len(), 4);
    assert_eq!(snapshots.last(), Some(&result.snapshot));
    assert_eq!(result.snapshot.value("checks"), Some(1.0));
    assert_eq!(result.snapshot.value(builtin::ITERATIONS), Some(70.0));
}
