//! Tropa: executor scheduling and metrics aggregation for virtual-user load tests.
//!
//! Tropa is the part of a load-testing engine that sits between the script and the
//! numbers. It decides, instant by instant, how many virtual users (VUs) should be
//! looping or how fast new iterations should be started, keeps the VUs' execution
//! contexts alive and reusable across the run, and reduces the samples every
//! iteration produces into consistent run-level summaries.
//!
//! Running the actual user code (HTTP requests, a scripting engine, anything else) is
//! up to you: implement [`Runner`], or wrap a closure with [`runner_fn`].
//!
//! # Architecture
//!
//! - [`Controller`]: validates a [`RunConfig`], owns the shared pool, pipeline and
//!   aggregator, starts every executor at its start time and produces a [`RunResult`].
//! - [`Executor`]: one scheduling strategy (constant or ramping VUs, constant or
//!   ramping arrival rate, shared or per-VU iterations, externally controlled). See
//!   [`executor`].
//! - [`VuPool`]: hands out VU contexts, creates them lazily and takes them back.
//! - [`Pacer`]: the slot source arrival-rate executors start iterations from.
//! - [`SampleSender`] / [`SampleReceiver`]: the bounded queue carrying whole
//!   [`SampleBatch`]es from VUs to the aggregator. A full queue makes producers wait;
//!   nothing is ever dropped.
//! - [`Aggregator`]: the single consumer, folding samples into per-metric
//!   [`Summary`]s according to their [`MetricKind`].
//! - [`Reporter`]: receives [`Snapshot`]s periodically and at the end of the run.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//!
//! use tokio_util::sync::CancellationToken;
//! use tropa::{runner_fn, BoxError, Controller, MetricKind, RunConfig, SampleBatch};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = RunConfig::from_yaml_str(
//!         r#"
//! executors:
//!   - name: warmup
//!     executor: ramping-vus
//!     stages:
//!       - { duration: 10s, target: 10 }
//!       - { duration: 20s, target: 10 }
//!       - { duration: 5s, target: 0 }
//!   - name: spike
//!     executor: constant-arrival-rate
//!     start_time: 35s
//!     rate: 200
//!     duration: 30s
//!     pre_allocated_vus: 20
//!     max_vus: 100
//! "#,
//!     )?;
//!
//!     let runner = runner_fn(|_info| async {
//!         tokio::time::sleep(Duration::from_millis(20)).await;
//!         let mut batch = SampleBatch::new();
//!         batch.add("http_req_duration", 20.0).add("checks", 1.0);
//!         Ok::<_, BoxError>(batch)
//!     });
//!
//!     let result = Controller::new(config, runner)?
//!         .with_metric("http_req_duration", MetricKind::Trend)
//!         .with_metric("checks", MetricKind::Rate)
//!         .run(CancellationToken::new())
//!         .await?;
//!
//!     println!("{:#?}", result.snapshot);
//!     Ok(())
//! }
//! ```
//!
//! # Feature flags
//!
//! - `internals`: exposes the pure scheduling math (rate interpolation, slot
//!   inversion, VU targets) for testing and tooling.

/// Per-metric sinks and the summaries they produce
pub mod aggregate;
/// The single consumer of the sample pipeline
pub mod aggregator;
/// Run and executor configuration
pub mod config;
/// Glue that runs every executor of a configuration
pub mod controller;
pub mod error;
/// Scheduling strategies
pub mod executor;
/// Metric kinds and the built-in metrics
pub mod metric;
/// Arrival-rate scheduling
pub mod pacer;
/// Bounded sample queue between VUs and the aggregator
pub mod pipeline;
/// Reusable VU execution contexts
pub mod pool;
/// Reporters
pub mod report;
/// The boundary to the code under test
pub mod runner;
pub mod sample;
/// Run-wide counters and progress
pub mod state;

pub use aggregate::Summary;
pub use aggregator::{Aggregator, Snapshot};
pub use config::{ExecutorConfig, ExecutorKind, PacingOptions, RunConfig, RunOptions, Stage};
pub use controller::{Controller, ExecutorReport, ExecutorStatus, RunResult, RunStatus};
pub use error::{BoxError, Error, Result};
pub use executor::{ExecutionContext, Executor, ExternalControl};
pub use metric::MetricKind;
pub use pacer::{Pacer, RateSchedule};
pub use pipeline::{SampleReceiver, SampleSender};
pub use pool::VuPool;
pub use report::{Reporter, TracingReporter};
pub use runner::{runner_fn, IterationInfo, Runner};
pub use sample::{sum_metric_values, Sample, SampleBatch, Tags};
pub use state::{Progress, ProgressSnapshot};

/// Procedural macros to reduce boilerplate
pub mod macros {
    pub use tropa_macros::*;
}
