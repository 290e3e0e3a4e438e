//! Run-wide counters and the pollable progress view built on them.
//!
//! Everything here is mutated through atomics only, so workers, executors and
//! monitoring collaborators can share it without locks.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering},
        Arc, OnceLock,
    },
    time::Duration,
};

use serde::Serialize;
use tokio::time::Instant;

/// Lifecycle of one executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum ExecutorPhase {
    Pending = 0,
    Started,
    Running,
    Draining,
    Finished,
    Canceled,
    Errored,
}

impl ExecutorPhase {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Pending,
            1 => Self::Started,
            2 => Self::Running,
            3 => Self::Draining,
            4 => Self::Finished,
            5 => Self::Canceled,
            _ => Self::Errored,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Canceled | Self::Errored)
    }
}

const NO_STAGE: usize = usize::MAX;

/// Live state of one executor.
#[derive(Debug)]
pub struct ExecutorTracker {
    name: Arc<str>,
    stages: usize,
    phase: AtomicU8,
    stage: AtomicUsize,
    active_vus: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
    rate_not_achieved: AtomicBool,
}

impl ExecutorTracker {
    pub(crate) fn new(name: Arc<str>, stages: usize) -> Self {
        Self {
            name,
            stages,
            phase: AtomicU8::new(ExecutorPhase::Pending as u8),
            stage: AtomicUsize::new(NO_STAGE),
            active_vus: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            rate_not_achieved: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &Arc<str> {
        &self.name
    }

    pub fn phase(&self) -> ExecutorPhase {
        ExecutorPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    /// Move to `phase` unless a terminal phase was already reached.
    pub(crate) fn set_phase(&self, phase: ExecutorPhase) {
        let _ = self
            .phase
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (!ExecutorPhase::from_u8(current).is_terminal()).then_some(phase as u8)
            });
    }

    /// Index of the stage being executed, if the executor is staged and running.
    pub fn stage(&self) -> Option<usize> {
        match self.stage.load(Ordering::Relaxed) {
            NO_STAGE => None,
            i => Some(i),
        }
    }

    pub(crate) fn set_stage(&self, stage: usize) {
        if self.stage.swap(stage, Ordering::Relaxed) != stage {
            tracing::info!(executor = %self.name, "Starting stage {}/{}", stage + 1, self.stages);
        }
    }

    pub fn active_vus(&self) -> u64 {
        self.active_vus.load(Ordering::Relaxed)
    }

    pub fn rate_not_achieved(&self) -> bool {
        self.rate_not_achieved.load(Ordering::Relaxed)
    }

    pub(crate) fn flag_rate_not_achieved(&self) {
        self.rate_not_achieved.store(true, Ordering::Relaxed);
    }

    pub(crate) fn progress(&self) -> ExecutorProgress {
        ExecutorProgress {
            name: self.name.to_string(),
            phase: self.phase(),
            stage: self.stage().map(|i| i + 1),
            stages: self.stages,
            active_vus: self.active_vus(),
            iterations_completed: self.completed.load(Ordering::Relaxed),
            iterations_failed: self.failed.load(Ordering::Relaxed),
            dropped_iterations: self.dropped.load(Ordering::Relaxed),
            rate_not_achieved: self.rate_not_achieved(),
        }
    }

    fn stage_label(&self) -> Option<String> {
        let stage = self.stage()?;
        Some(format!("{} stage {}/{}", self.name, stage + 1, self.stages))
    }
}

/// Process-wide counters shared by every executor of a run.
#[derive(Debug, Default)]
pub struct RunState {
    started: OnceLock<Instant>,
    active_vus: AtomicU64,
    peak_active_vus: AtomicU64,
    initialized_vus: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    interrupted: AtomicU64,
    dropped: AtomicU64,
    executors: OnceLock<Vec<Arc<ExecutorTracker>>>,
}

impl RunState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the executors of the run. Only the first call has an effect.
    pub(crate) fn set_executors(&self, executors: Vec<Arc<ExecutorTracker>>) {
        let _ = self.executors.set(executors);
    }

    pub(crate) fn executors(&self) -> &[Arc<ExecutorTracker>] {
        self.executors.get().map(Vec::as_slice).unwrap_or_default()
    }

    /// Mark the start of the run. Only the first call has an effect.
    pub(crate) fn start(&self) {
        let _ = self.started.set(Instant::now());
    }

    pub fn elapsed(&self) -> Duration {
        self.started
            .get()
            .map(Instant::elapsed)
            .unwrap_or_default()
    }

    pub fn active_vus(&self) -> u64 {
        self.active_vus.load(Ordering::Relaxed)
    }

    pub fn peak_active_vus(&self) -> u64 {
        self.peak_active_vus.load(Ordering::Relaxed)
    }

    pub fn initialized_vus(&self) -> u64 {
        self.initialized_vus.load(Ordering::Relaxed)
    }

    pub(crate) fn vu_initialized(&self) {
        self.initialized_vus.fetch_add(1, Ordering::Relaxed);
    }

    pub fn iterations_completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    pub fn iterations_failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn iterations_interrupted(&self) -> u64 {
        self.interrupted.load(Ordering::Relaxed)
    }

    pub fn dropped_iterations(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub(crate) fn iteration_completed(&self, tracker: &ExecutorTracker) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        tracker.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn iteration_failed(&self, tracker: &ExecutorTracker) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        tracker.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn iteration_interrupted(&self) {
        self.interrupted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn iterations_dropped(&self, tracker: &ExecutorTracker, n: u64) {
        self.dropped.fetch_add(n, Ordering::Relaxed);
        tracker.dropped.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        let executors: Vec<ExecutorProgress> =
            self.executors().iter().map(|t| t.progress()).collect();
        let current_stage = self
            .executors()
            .iter()
            .filter(|t| t.phase() == ExecutorPhase::Running)
            .find_map(|t| t.stage_label());
        let rate_not_achieved = executors
            .iter()
            .filter(|e| e.rate_not_achieved)
            .map(|e| e.name.clone())
            .collect();

        ProgressSnapshot {
            elapsed: self.elapsed(),
            active_vus: self.active_vus(),
            peak_active_vus: self.peak_active_vus(),
            initialized_vus: self.initialized_vus(),
            iterations_completed: self.iterations_completed(),
            iterations_failed: self.iterations_failed(),
            iterations_interrupted: self.iterations_interrupted(),
            dropped_iterations: self.dropped_iterations(),
            current_stage,
            rate_not_achieved,
            executors,
        }
    }
}

/// Counts one VU as active for as long as it lives.
#[derive(Debug)]
pub(crate) struct ActiveGuard {
    state: Arc<RunState>,
    tracker: Arc<ExecutorTracker>,
}

impl ActiveGuard {
    pub(crate) fn new(state: Arc<RunState>, tracker: Arc<ExecutorTracker>) -> Self {
        let now = state.active_vus.fetch_add(1, Ordering::Relaxed) + 1;
        state.peak_active_vus.fetch_max(now, Ordering::Relaxed);
        tracker.active_vus.fetch_add(1, Ordering::Relaxed);
        Self { state, tracker }
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.state.active_vus.fetch_sub(1, Ordering::Relaxed);
        self.tracker.active_vus.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Pollable view of a run for monitoring collaborators.
#[derive(Debug, Clone)]
pub struct Progress {
    state: Arc<RunState>,
}

impl Progress {
    pub(crate) fn new(state: Arc<RunState>) -> Self {
        Self { state }
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        self.state.snapshot()
    }

    pub fn active_vus(&self) -> u64 {
        self.state.active_vus()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutorProgress {
    pub name: String,
    pub phase: ExecutorPhase,
    /// 1-based stage number.
    pub stage: Option<usize>,
    pub stages: usize,
    pub active_vus: u64,
    pub iterations_completed: u64,
    pub iterations_failed: u64,
    pub dropped_iterations: u64,
    pub rate_not_achieved: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressSnapshot {
    #[serde(with = "humantime_serde")]
    pub elapsed: Duration,
    pub active_vus: u64,
    pub peak_active_vus: u64,
    pub initialized_vus: u64,
    pub iterations_completed: u64,
    pub iterations_failed: u64,
    pub iterations_interrupted: u64,
    pub dropped_iterations: u64,
    /// `"<executor> stage <i>/<n>"` of the first running staged executor.
    pub current_stage: Option<String>,
    /// Executors whose target arrival rate was not met.
    pub rate_not_achieved: Vec<String>,
    pub executors: Vec<ExecutorProgress>,
}
