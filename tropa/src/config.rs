//! Run configuration: which executors run, when, and with what load profile.
//!
//! Everything deserializes from YAML (durations in humantime form such as `"30s"`)
//! and can also be built in code:
//!
//! ```rust
//! use std::time::Duration;
//! use tropa::config::{ExecutorConfig, ExecutorKind, RunConfig};
//!
//! let config = RunConfig::builder()
//!     .executors(vec![ExecutorConfig::builder()
//!         .name("smoke")
//!         .kind(ExecutorKind::SharedIterations {
//!             vus: 1,
//!             iterations: 3,
//!             max_duration: Duration::from_secs(60),
//!         })
//!         .build()])
//!     .build();
//! config.validate().unwrap();
//! ```

use std::{collections::HashSet, time::Duration};

use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::{
    error::{Error, Result},
    sample::Tags,
};

pub const DEFAULT_GRACEFUL_STOP: Duration = Duration::from_secs(30);
pub const DEFAULT_GRACEFUL_RAMP_DOWN: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_DURATION: Duration = Duration::from_secs(10 * 60);
pub const DEFAULT_TIME_UNIT: Duration = Duration::from_secs(1);
pub const DEFAULT_CANCEL_GRACE: Duration = Duration::from_secs(5);

fn default_graceful_stop() -> Duration {
    DEFAULT_GRACEFUL_STOP
}

fn default_graceful_ramp_down() -> Duration {
    DEFAULT_GRACEFUL_RAMP_DOWN
}

fn default_max_duration() -> Duration {
    DEFAULT_MAX_DURATION
}

fn default_time_unit() -> Duration {
    DEFAULT_TIME_UNIT
}

fn default_one() -> u64 {
    1
}

/// One segment of a ramping profile.
///
/// Use `Stage::new(Duration::from_secs(10), 100)` to ramp to 100 over 10s. A stage
/// with `Duration::ZERO` jumps to its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stage {
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
    /// VUs for ramping-vus, iterations per `time_unit` for ramping-arrival-rate.
    pub target: u64,
}

impl Stage {
    pub fn new(duration: Duration, target: u64) -> Self {
        Self { duration, target }
    }
}

fn stages_duration(stages: &[Stage]) -> Duration {
    stages.iter().map(|s| s.duration).sum()
}

/// Load profile of an executor, tagged by the `executor` key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "executor", rename_all = "kebab-case")]
pub enum ExecutorKind {
    /// `vus` workers looping for `duration`.
    #[serde(alias = "fixed-vus")]
    ConstantVus {
        vus: u64,
        #[serde(with = "humantime_serde")]
        duration: Duration,
    },
    /// Worker count interpolated from `start_vus` through `stages`.
    RampingVus {
        #[serde(default = "default_one")]
        start_vus: u64,
        stages: Vec<Stage>,
        #[serde(default = "default_graceful_ramp_down", with = "humantime_serde")]
        graceful_ramp_down: Duration,
    },
    /// `rate` iterations per `time_unit` for `duration`.
    ConstantArrivalRate {
        rate: u64,
        #[serde(default = "default_time_unit", with = "humantime_serde")]
        time_unit: Duration,
        #[serde(with = "humantime_serde")]
        duration: Duration,
        pre_allocated_vus: u64,
        /// Defaults to `pre_allocated_vus`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_vus: Option<u64>,
    },
    /// Start rate interpolated from `start_rate` through `stages`.
    RampingArrivalRate {
        #[serde(default)]
        start_rate: u64,
        #[serde(default = "default_time_unit", with = "humantime_serde")]
        time_unit: Duration,
        stages: Vec<Stage>,
        pre_allocated_vus: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_vus: Option<u64>,
    },
    /// `iterations` in total, shared by `vus` workers.
    SharedIterations {
        #[serde(default = "default_one")]
        vus: u64,
        #[serde(default = "default_one")]
        iterations: u64,
        #[serde(default = "default_max_duration", with = "humantime_serde")]
        max_duration: Duration,
    },
    /// `iterations` on each of `vus` workers.
    PerVuIterations {
        #[serde(default = "default_one")]
        vus: u64,
        #[serde(default = "default_one")]
        iterations: u64,
        #[serde(default = "default_max_duration", with = "humantime_serde")]
        max_duration: Duration,
    },
    /// Starts at `vus`, then follows targets set through an `ExternalControl` handle.
    ExternallyControlled {
        vus: u64,
        /// Defaults to `vus`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_vus: Option<u64>,
        /// Runs until canceled or stopped when unset.
        #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
        duration: Option<Duration>,
    },
}

impl ExecutorKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ConstantVus { .. } => "constant-vus",
            Self::RampingVus { .. } => "ramping-vus",
            Self::ConstantArrivalRate { .. } => "constant-arrival-rate",
            Self::RampingArrivalRate { .. } => "ramping-arrival-rate",
            Self::SharedIterations { .. } => "shared-iterations",
            Self::PerVuIterations { .. } => "per-vu-iterations",
            Self::ExternallyControlled { .. } => "externally-controlled",
        }
    }

    /// Most VUs the executor can hold at once.
    pub fn max_vus_needed(&self) -> u64 {
        match self {
            Self::ConstantVus { vus, .. }
            | Self::SharedIterations { vus, .. }
            | Self::PerVuIterations { vus, .. } => *vus,
            Self::RampingVus {
                start_vus, stages, ..
            } => stages.iter().map(|s| s.target).fold(*start_vus, u64::max),
            Self::ConstantArrivalRate {
                pre_allocated_vus,
                max_vus,
                ..
            }
            | Self::RampingArrivalRate {
                pre_allocated_vus,
                max_vus,
                ..
            } => max_vus.unwrap_or(*pre_allocated_vus),
            Self::ExternallyControlled { vus, max_vus, .. } => max_vus.unwrap_or(*vus),
        }
    }

    /// Longest the executor can run before its graceful stop starts. `None` when
    /// only cancellation ends it.
    pub fn max_run_time(&self) -> Option<Duration> {
        match self {
            Self::ConstantVus { duration, .. } | Self::ConstantArrivalRate { duration, .. } => {
                Some(*duration)
            }
            Self::RampingVus {
                stages,
                graceful_ramp_down,
                ..
            } => Some(stages_duration(stages) + *graceful_ramp_down),
            Self::RampingArrivalRate { stages, .. } => Some(stages_duration(stages)),
            Self::SharedIterations { max_duration, .. }
            | Self::PerVuIterations { max_duration, .. } => Some(*max_duration),
            Self::ExternallyControlled { duration, .. } => *duration,
        }
    }

    /// Number of stages, for progress reporting.
    pub fn stage_count(&self) -> usize {
        match self {
            Self::RampingVus { stages, .. } | Self::RampingArrivalRate { stages, .. } => {
                stages.len()
            }
            _ => 0,
        }
    }

    fn validate(&self, name: &str) -> Result<()> {
        let fail = |msg: String| -> Result<()> {
            Err(Error::config(format!("executor '{name}': {msg}")))
        };
        match self {
            Self::ConstantVus { vus: 0, .. }
            | Self::SharedIterations { vus: 0, .. }
            | Self::PerVuIterations { vus: 0, .. } => fail("vus must be greater than 0".into()),
            Self::SharedIterations {
                vus, iterations, ..
            } if iterations < vus => fail(format!(
                "iterations ({iterations}) must be at least vus ({vus})"
            )),
            Self::RampingVus { stages, .. } if stages.is_empty() => {
                fail("at least one stage is required".into())
            }
            Self::RampingVus { .. } if self.max_vus_needed() == 0 => {
                fail("start_vus or a stage target must be greater than 0".into())
            }
            Self::RampingArrivalRate { stages, .. } if stages.is_empty() => {
                fail("at least one stage is required".into())
            }
            Self::ConstantArrivalRate { time_unit, .. }
            | Self::RampingArrivalRate { time_unit, .. }
                if time_unit.is_zero() =>
            {
                fail("time_unit must be greater than 0".into())
            }
            Self::ConstantArrivalRate {
                pre_allocated_vus,
                max_vus: Some(max),
                ..
            }
            | Self::RampingArrivalRate {
                pre_allocated_vus,
                max_vus: Some(max),
                ..
            } if pre_allocated_vus > max => fail(format!(
                "pre_allocated_vus ({pre_allocated_vus}) must not exceed max_vus ({max})"
            )),
            Self::ConstantArrivalRate { rate, .. } if *rate > 0 && self.max_vus_needed() == 0 => {
                fail("max_vus must be greater than 0 to start any iteration".into())
            }
            Self::RampingArrivalRate {
                start_rate, stages, ..
            } if (*start_rate > 0 || stages.iter().any(|s| s.target > 0))
                && self.max_vus_needed() == 0 =>
            {
                fail("max_vus must be greater than 0 to start any iteration".into())
            }
            Self::ExternallyControlled {
                vus,
                max_vus: Some(max),
                ..
            } if vus > max => fail(format!("vus ({vus}) must not exceed max_vus ({max})")),
            Self::ExternallyControlled { .. } if self.max_vus_needed() == 0 => {
                fail("max_vus must be greater than 0".into())
            }
            _ => Ok(()),
        }
    }
}

/// One executor of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TypedBuilder)]
pub struct ExecutorConfig {
    #[builder(setter(into))]
    pub name: String,
    #[serde(flatten)]
    pub kind: ExecutorKind,
    /// Delay from the start of the run.
    #[serde(default, with = "humantime_serde")]
    #[builder(default)]
    pub start_time: Duration,
    /// How long in-flight iterations may finish once the executor is told to stop.
    #[serde(default = "default_graceful_stop", with = "humantime_serde")]
    #[builder(default = DEFAULT_GRACEFUL_STOP)]
    pub graceful_stop: Duration,
    /// Added to every built-in sample of the executor.
    #[serde(default)]
    #[builder(default)]
    pub tags: Tags,
}

impl ExecutorConfig {
    /// `[start, end)` during which the executor may hold VUs, `end` being `None`
    /// when it runs until canceled.
    pub fn window(&self) -> (Duration, Option<Duration>) {
        let end = self
            .kind
            .max_run_time()
            .map(|run| self.start_time + run + self.graceful_stop);
        (self.start_time, end)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::config("executor name must not be empty"));
        }
        self.kind.validate(&self.name)
    }
}

/// Policy constants of the arrival-rate pacer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TypedBuilder)]
#[serde(default)]
pub struct PacingOptions {
    /// Slots further behind than this are dropped instead of started late.
    #[serde(with = "humantime_serde")]
    #[builder(default = Duration::from_secs(1))]
    pub max_lag: Duration,
    /// Accepted shortfall of started iterations, as a fraction of expected ones.
    #[builder(default = 0.1)]
    pub rate_tolerance: f64,
    /// How long a shortfall must last before it is reported.
    #[serde(with = "humantime_serde")]
    #[builder(default = Duration::from_secs(2))]
    pub rate_grace: Duration,
}

impl Default for PacingOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Run-wide knobs. Every field has a default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TypedBuilder)]
#[serde(default)]
pub struct RunOptions {
    /// Batches the sample pipeline holds before producers wait.
    #[builder(default = num_cpus::get() * 256)]
    pub pipeline_capacity: usize,
    /// Most batches the aggregator folds per lock.
    #[builder(default = 256)]
    pub aggregation_batch: usize,
    /// How often ramping executors re-evaluate their target.
    #[serde(with = "humantime_serde")]
    #[builder(default = Duration::from_millis(50))]
    pub tick: Duration,
    /// How often `vus` and `vus_max` are sampled.
    #[serde(with = "humantime_serde")]
    #[builder(default = Duration::from_secs(1))]
    pub vu_sample_interval: Duration,
    /// How often reporters receive a snapshot.
    #[serde(with = "humantime_serde")]
    #[builder(default = Duration::from_secs(1))]
    pub flush_interval: Duration,
    /// What is left of an open graceful-stop window once the run is canceled.
    #[serde(with = "humantime_serde")]
    #[builder(default = DEFAULT_CANCEL_GRACE)]
    pub cancel_grace: Duration,
    /// Overrides the planned pool size. Must cover every single executor's need.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[builder(default, setter(strip_option))]
    pub max_vus: Option<u64>,
    #[builder(default)]
    pub pacing: PacingOptions,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl RunOptions {
    pub fn validate(&self) -> Result<()> {
        if self.pipeline_capacity == 0 {
            return Err(Error::config("pipeline_capacity must be greater than 0"));
        }
        if self.aggregation_batch == 0 {
            return Err(Error::config("aggregation_batch must be greater than 0"));
        }
        if self.tick.is_zero() {
            return Err(Error::config("tick must be greater than 0"));
        }
        if self.vu_sample_interval.is_zero() || self.flush_interval.is_zero() {
            return Err(Error::config("sampling and flush intervals must be greater than 0"));
        }
        if self.pacing.max_lag.is_zero() {
            return Err(Error::config("pacing.max_lag must be greater than 0"));
        }
        if !(0.0..1.0).contains(&self.pacing.rate_tolerance) {
            return Err(Error::config("pacing.rate_tolerance must be in [0, 1)"));
        }
        Ok(())
    }
}

/// Everything a controller needs to run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TypedBuilder)]
pub struct RunConfig {
    pub executors: Vec<ExecutorConfig>,
    #[serde(default)]
    #[builder(default)]
    pub options: RunOptions,
}

impl RunConfig {
    /// Parse and validate a YAML document.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self =
            serde_yaml::from_str(yaml).map_err(|e| Error::config(format!("invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.executors.is_empty() {
            return Err(Error::config("at least one executor is required"));
        }
        let mut names = HashSet::new();
        for executor in &self.executors {
            executor.validate()?;
            if !names.insert(executor.name.as_str()) {
                return Err(Error::config(format!(
                    "duplicate executor name '{}'",
                    executor.name
                )));
            }
            let need = executor.kind.max_vus_needed();
            match self.options.max_vus {
                Some(max) if max < need => {
                    return Err(Error::config(format!(
                        "options.max_vus ({max}) is below the {need} VUs executor '{}' needs",
                        executor.name
                    )));
                }
                _ => {}
            }
        }
        self.options.validate()
    }

    /// Size of the VU pool: the override if set, the planned peak otherwise.
    pub fn pool_size(&self) -> u64 {
        self.options
            .max_vus
            .unwrap_or_else(|| planned_max_vus(&self.executors))
    }
}

/// Peak number of VUs held at once by executors whose windows overlap.
pub fn planned_max_vus(executors: &[ExecutorConfig]) -> u64 {
    // (time, is_start, need); windows are half-open so ends sort before starts
    let mut events: Vec<(Duration, bool, u64)> = Vec::with_capacity(executors.len() * 2);
    for executor in executors {
        let need = executor.kind.max_vus_needed();
        let (start, end) = executor.window();
        events.push((start, true, need));
        if let Some(end) = end {
            events.push((end, false, need));
        }
    }
    events.sort_by_key(|&(time, is_start, _)| (time, is_start));

    let mut current = 0u64;
    let mut peak = 0u64;
    for (_, is_start, need) in events {
        if is_start {
            current += need;
            peak = peak.max(current);
        } else {
            current -= need;
        }
    }
    peak
}
