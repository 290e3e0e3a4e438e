use std::fmt::Debug;

use chrono::{DateTime, Utc};
use hdrhistogram::Histogram;
use serde::{Deserialize, Serialize};

use crate::{
    macros::{sink, summary},
    metric::MetricKind,
    sample::Sample,
};

/// A `Sink` folds the samples of one metric into a compact, mergeable running
/// summary.
///
/// Sinks hold raw accumulators (sums, counts, histograms). Derived numbers such as
/// averages and percentiles are computed by [`Sink::summary`], so a sink can keep
/// absorbing samples after a summary was taken.
///
/// # Implementor notes
/// - `merge` must be **associative** and **commutative**: the aggregator folds each
///   drained chunk into fresh sinks and merges those into the shared ones, in
///   whatever order chunks arrive.
/// - `consume` is on the hot path of the aggregator task; keep it allocation free.
pub trait Sink
where
    Self: Default + Debug + Clone + Send + Sync,
{
    /// Incorporate a single sample.
    fn consume(&mut self, sample: &Sample);

    /// Incorporate many samples.
    ///
    /// This default implementation calls [`consume`](Sink::consume) for each sample.
    fn aggregate(&mut self, samples: &[Sample]) {
        samples.iter().for_each(|s| self.consume(s));
    }

    /// Combine another sink of the same metric into this one.
    fn merge(&mut self, other: Self);

    /// Point-in-time view of the accumulated values.
    fn summary(&self) -> Summary;
}

/// Point-in-time view of one metric, as handed to reporters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Summary {
    Counter(CounterSummary),
    Gauge(GaugeSummary),
    Rate(RateSummary),
    Trend(TrendSummary),
}

impl Summary {
    pub fn kind(&self) -> MetricKind {
        match self {
            Summary::Counter(_) => MetricKind::Counter,
            Summary::Gauge(_) => MetricKind::Gauge,
            Summary::Rate(_) => MetricKind::Rate,
            Summary::Trend(_) => MetricKind::Trend,
        }
    }

    /// The headline number: sum for counters and trends, last value for gauges,
    /// fraction for rates.
    pub fn value(&self) -> f64 {
        match self {
            Summary::Counter(c) => c.sum,
            Summary::Gauge(g) => g.value,
            Summary::Rate(r) => r.rate,
            Summary::Trend(t) => t.sum,
        }
    }
}

#[summary]
pub struct CounterSummary {
    pub sum: f64,
    pub count: u64,
}

#[summary]
pub struct GaugeSummary {
    pub value: f64,
    pub min: f64,
    pub max: f64,
}

#[summary]
pub struct RateSummary {
    pub passes: u64,
    pub fails: u64,
    pub rate: f64,
}

#[summary]
pub struct TrendSummary {
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
    pub avg: f64,
    pub med: f64,
    pub p90: f64,
    pub p95: f64,
    pub p99: f64,
}

#[sink]
pub struct CounterSink {
    pub sum: f64,
    pub count: u64,
}

impl Sink for CounterSink {
    fn consume(&mut self, sample: &Sample) {
        self.sum += sample.value;
        self.count += 1;
    }

    fn merge(&mut self, other: Self) {
        self.sum += other.sum;
        self.count += other.count;
    }

    fn summary(&self) -> Summary {
        Summary::Counter(CounterSummary {
            sum: self.sum,
            count: self.count,
        })
    }
}

#[sink]
pub struct GaugeSink {
    pub value: f64,
    pub min: f64,
    pub max: f64,
    pub count: u64,
    /// Time of the sample `value` came from.
    pub time: Option<DateTime<Utc>>,
}

impl GaugeSink {
    fn observe(&mut self, value: f64, min: f64, max: f64, time: DateTime<Utc>) {
        if self.count == 0 {
            self.min = min;
            self.max = max;
        } else {
            self.min = self.min.min(min);
            self.max = self.max.max(max);
        }
        // Ties go to the later write so a single producer keeps emission order.
        if self.time.map_or(true, |t| time >= t) {
            self.value = value;
            self.time = Some(time);
        }
    }
}

impl Sink for GaugeSink {
    fn consume(&mut self, sample: &Sample) {
        self.observe(sample.value, sample.value, sample.value, sample.time);
        self.count += 1;
    }

    fn merge(&mut self, other: Self) {
        let Some(time) = other.time else {
            return;
        };
        self.observe(other.value, other.min, other.max, time);
        self.count += other.count;
    }

    fn summary(&self) -> Summary {
        Summary::Gauge(GaugeSummary {
            value: self.value,
            min: self.min,
            max: self.max,
        })
    }
}

#[sink]
pub struct RateSink {
    pub passes: u64,
    pub total: u64,
}

impl Sink for RateSink {
    fn consume(&mut self, sample: &Sample) {
        if sample.value != 0.0 {
            self.passes += 1;
        }
        self.total += 1;
    }

    fn merge(&mut self, other: Self) {
        self.passes += other.passes;
        self.total += other.total;
    }

    fn summary(&self) -> Summary {
        let rate = if self.total == 0 {
            0.0
        } else {
            self.passes as f64 / self.total as f64
        };
        Summary::Rate(RateSummary {
            passes: self.passes,
            fails: self.total - self.passes,
            rate,
        })
    }
}

/// Trend values are recorded in the histogram at microsecond resolution of a
/// millisecond-valued metric.
const TREND_SCALE: f64 = 1000.0;

/// Distribution sink: exact count/sum/min/max plus an HDR histogram for percentiles.
#[derive(Debug, Clone)]
pub struct TrendSink {
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
    histogram: Histogram<u64>,
}

impl Default for TrendSink {
    fn default() -> Self {
        Self {
            count: 0,
            sum: 0.0,
            min: 0.0,
            max: 0.0,
            // auto-resizing, 3 significant figures
            histogram: Histogram::new(3).expect("3 significant figures is a valid precision"),
        }
    }
}

impl TrendSink {
    fn quantile(&self, q: f64) -> f64 {
        self.histogram.value_at_quantile(q) as f64 / TREND_SCALE
    }
}

impl Sink for TrendSink {
    fn consume(&mut self, sample: &Sample) {
        let v = sample.value;
        if self.count == 0 {
            self.min = v;
            self.max = v;
        } else {
            self.min = self.min.min(v);
            self.max = self.max.max(v);
        }
        self.count += 1;
        self.sum += v;
        // negative values only count towards the exact stats
        let scaled = (v.max(0.0) * TREND_SCALE).round() as u64;
        self.histogram.record(scaled).ok();
    }

    fn merge(&mut self, other: Self) {
        if other.count == 0 {
            return;
        }
        if self.count == 0 {
            self.min = other.min;
            self.max = other.max;
        } else {
            self.min = self.min.min(other.min);
            self.max = self.max.max(other.max);
        }
        self.count += other.count;
        self.sum += other.sum;
        self.histogram.add(&other.histogram).ok();
    }

    fn summary(&self) -> Summary {
        if self.count == 0 {
            return Summary::Trend(TrendSummary::default());
        }
        Summary::Trend(TrendSummary {
            count: self.count,
            sum: self.sum,
            min: self.min,
            max: self.max,
            avg: self.sum / self.count as f64,
            med: self.quantile(0.5),
            p90: self.quantile(0.9),
            p95: self.quantile(0.95),
            p99: self.quantile(0.99),
        })
    }
}

/// A sink of whichever kind the metric was registered with.
#[derive(Debug, Clone)]
pub enum MetricSink {
    Counter(CounterSink),
    Gauge(GaugeSink),
    Rate(RateSink),
    Trend(TrendSink),
}

impl MetricSink {
    pub fn for_kind(kind: MetricKind) -> Self {
        match kind {
            MetricKind::Counter => MetricSink::Counter(CounterSink::default()),
            MetricKind::Gauge => MetricSink::Gauge(GaugeSink::default()),
            MetricKind::Rate => MetricSink::Rate(RateSink::default()),
            MetricKind::Trend => MetricSink::Trend(TrendSink::default()),
        }
    }

    pub fn kind(&self) -> MetricKind {
        match self {
            MetricSink::Counter(_) => MetricKind::Counter,
            MetricSink::Gauge(_) => MetricKind::Gauge,
            MetricSink::Rate(_) => MetricKind::Rate,
            MetricSink::Trend(_) => MetricKind::Trend,
        }
    }

    pub fn consume(&mut self, sample: &Sample) {
        match self {
            MetricSink::Counter(s) => s.consume(sample),
            MetricSink::Gauge(s) => s.consume(sample),
            MetricSink::Rate(s) => s.consume(sample),
            MetricSink::Trend(s) => s.consume(sample),
        }
    }

    /// Merge a sink of the same kind. Sinks of a different kind are ignored; the
    /// registry is fixed for the duration of a run so this only guards misuse.
    pub fn merge(&mut self, other: MetricSink) {
        match (self, other) {
            (MetricSink::Counter(a), MetricSink::Counter(b)) => a.merge(b),
            (MetricSink::Gauge(a), MetricSink::Gauge(b)) => a.merge(b),
            (MetricSink::Rate(a), MetricSink::Rate(b)) => a.merge(b),
            (MetricSink::Trend(a), MetricSink::Trend(b)) => a.merge(b),
            (a, b) => tracing::warn!(
                "Ignoring merge of a {:?} sink into a {:?} sink",
                b.kind(),
                a.kind()
            ),
        }
    }

    pub fn summary(&self) -> Summary {
        match self {
            MetricSink::Counter(s) => s.summary(),
            MetricSink::Gauge(s) => s.summary(),
            MetricSink::Rate(s) => s.summary(),
            MetricSink::Trend(s) => s.summary(),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration as ChronoDuration;

    use super::*;

    fn samples(values: &[f64]) -> Vec<Sample> {
        values.iter().map(|v| Sample::new("m", *v)).collect()
    }

    #[test]
    fn counter_sums_and_merges() {
        let mut a = CounterSink::default();
        a.aggregate(&samples(&[1.0, 2.0, 3.0]));
        let mut b = CounterSink::default();
        b.aggregate(&samples(&[4.0]));
        a.merge(b);

        assert_eq!(a.summary(), Summary::Counter(CounterSummary { sum: 10.0, count: 4 }));
    }

    #[test]
    fn gauge_keeps_latest_sample_by_time() {
        let now = Utc::now();
        let older = Sample::new("g", 7.0).at(now - ChronoDuration::seconds(5));
        let newer = Sample::new("g", 3.0).at(now);

        let mut late = GaugeSink::default();
        late.consume(&newer);
        let mut early = GaugeSink::default();
        early.consume(&older);
        // merge order must not matter
        late.merge(early);

        let Summary::Gauge(g) = late.summary() else {
            panic!("expected gauge summary");
        };
        assert_eq!(g.value, 3.0);
        assert_eq!(g.min, 3.0);
        assert_eq!(g.max, 7.0);
    }

    #[test]
    fn merging_empty_gauge_is_a_noop() {
        let mut g = GaugeSink::default();
        g.consume(&Sample::new("g", -2.0));
        g.merge(GaugeSink::default());
        assert_eq!(g.summary().value(), -2.0);
        assert_eq!(g.count, 1);
    }

    #[test]
    fn rate_counts_non_zero_as_pass() {
        let mut r = RateSink::default();
        r.aggregate(&samples(&[1.0, 0.0, 1.0, 0.5]));
        assert_eq!(
            r.summary(),
            Summary::Rate(RateSummary {
                passes: 3,
                fails: 1,
                rate: 0.75
            })
        );
    }

    #[test]
    fn trend_reports_exact_stats_and_percentiles() {
        let values: Vec<f64> = (1..=100).map(|v| v as f64).collect();
        let mut first = TrendSink::default();
        first.aggregate(&samples(&values[..50]));
        let mut second = TrendSink::default();
        second.aggregate(&samples(&values[50..]));
        first.merge(second);

        let Summary::Trend(t) = first.summary() else {
            panic!("expected trend summary");
        };
        assert_eq!(t.count, 100);
        assert_eq!(t.sum, 5050.0);
        assert_eq!(t.min, 1.0);
        assert_eq!(t.max, 100.0);
        assert_eq!(t.avg, 50.5);
        // histogram buckets are accurate to 3 significant figures
        assert!((t.med - 50.0).abs() <= 1.1, "med was {}", t.med);
        assert!((t.p99 - 99.0).abs() <= 1.1, "p99 was {}", t.p99);
    }

    #[test]
    fn empty_trend_summary_is_zeroed() {
        assert_eq!(
            TrendSink::default().summary(),
            Summary::Trend(TrendSummary::default())
        );
    }

    #[test]
    fn metric_sink_ignores_mismatched_merge() {
        let mut sink = MetricSink::for_kind(MetricKind::Counter);
        sink.consume(&Sample::new("m", 2.0));
        let mut other = MetricSink::for_kind(MetricKind::Gauge);
        other.consume(&Sample::new("m", 9.0));
        sink.merge(other);
        assert_eq!(sink.kind(), MetricKind::Counter);
        assert_eq!(sink.summary().value(), 2.0);
    }
}
