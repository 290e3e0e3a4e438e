use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// How samples of a metric are reduced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    /// Sum of values.
    Counter,
    /// Last value by sample time.
    Gauge,
    /// Fraction of non-zero samples.
    Rate,
    /// Distribution of values.
    Trend,
}

/// Names of the metrics the engine emits on its own.
pub mod builtin {
    /// One per completed iteration.
    pub const ITERATIONS: &str = "iterations";
    /// Wall time of a completed iteration, in milliseconds.
    pub const ITERATION_DURATION: &str = "iteration_duration";
    /// One per arrival-rate slot that could not be started.
    pub const DROPPED_ITERATIONS: &str = "dropped_iterations";
    /// Active VUs, sampled periodically.
    pub const VUS: &str = "vus";
    /// Initialized VUs, sampled periodically.
    pub const VUS_MAX: &str = "vus_max";

    /// Tag carrying the name of the executor that produced a sample.
    pub const SCENARIO_TAG: &str = "scenario";
}

/// Maps metric names to kinds. Unknown names reduce as counters.
#[derive(Debug, Clone)]
pub struct MetricRegistry {
    kinds: HashMap<String, MetricKind>,
}

impl MetricRegistry {
    /// A registry holding the built-in metrics.
    pub fn new() -> Self {
        let kinds = [
            (builtin::ITERATIONS, MetricKind::Counter),
            (builtin::ITERATION_DURATION, MetricKind::Trend),
            (builtin::DROPPED_ITERATIONS, MetricKind::Counter),
            (builtin::VUS, MetricKind::Gauge),
            (builtin::VUS_MAX, MetricKind::Gauge),
        ]
        .into_iter()
        .map(|(name, kind)| (name.to_string(), kind))
        .collect();
        Self { kinds }
    }

    /// Register (or re-register) a metric.
    pub fn register(&mut self, name: impl Into<String>, kind: MetricKind) {
        self.kinds.insert(name.into(), kind);
    }

    pub fn kind_of(&self, name: &str) -> MetricKind {
        self.kinds.get(name).copied().unwrap_or(MetricKind::Counter)
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.kinds.contains_key(name)
    }
}

impl Default for MetricRegistry {
    fn default() -> Self {
        Self::new()
    }
}
