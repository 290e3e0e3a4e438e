use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::{
    aggregate::Summary,
    aggregator::{Aggregator, Snapshot},
    error::BoxError,
};

/// Receives metric snapshots during and at the end of a run.
///
/// Reporters are called every `flush_interval` and once more with the final
/// snapshot. Errors are logged and never fail the run.
#[async_trait]
pub trait Reporter: Send + Sync {
    async fn report(&self, snapshot: &Snapshot) -> Result<(), BoxError>;
}

/// Logs the headline value of every metric through `tracing`.
#[derive(Debug, Clone, Default)]
pub struct TracingReporter;

#[async_trait]
impl Reporter for TracingReporter {
    async fn report(&self, snapshot: &Snapshot) -> Result<(), BoxError> {
        for (name, summary) in &snapshot.metrics {
            match summary {
                Summary::Trend(t) => tracing::info!(
                    metric = %name,
                    "count={} avg={:.2} min={:.2} max={:.2} p90={:.2} p95={:.2}",
                    t.count,
                    t.avg,
                    t.min,
                    t.max,
                    t.p90,
                    t.p95
                ),
                Summary::Rate(r) => {
                    tracing::info!(metric = %name, "rate={:.4} ({} passes, {} fails)", r.rate, r.passes, r.fails)
                }
                other => tracing::info!(metric = %name, "value={}", other.value()),
            }
        }
        Ok(())
    }
}

pub(crate) async fn report_all(reporters: &[Arc<dyn Reporter>], snapshot: &Snapshot) {
    for reporter in reporters {
        if let Err(e) = reporter.report(snapshot).await {
            tracing::warn!("Reporter failed: {e}");
        }
    }
}

/// Publish a snapshot every `interval` until `stop` fires.
pub(crate) fn spawn_flusher(
    aggregator: Aggregator,
    reporters: Arc<[Arc<dyn Reporter>]>,
    interval: Duration,
    stop: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = tick.tick() => report_all(&reporters, &aggregator.snapshot()).await,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;
    use crate::{metric::MetricRegistry, sample::SampleBatch};

    #[derive(Default)]
    struct Collecting {
        seen: Mutex<Vec<Snapshot>>,
    }

    #[async_trait]
    impl Reporter for Collecting {
        async fn report(&self, snapshot: &Snapshot) -> Result<(), BoxError> {
            self.seen.lock().push(snapshot.clone());
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl Reporter for Failing {
        async fn report(&self, _snapshot: &Snapshot) -> Result<(), BoxError> {
            Err("sink unavailable".into())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn flusher_publishes_every_interval() {
        let aggregator = Aggregator::new(MetricRegistry::new());
        let mut batch = SampleBatch::new();
        batch.add("checks", 2.0);
        aggregator.fold(&[batch]);

        let collecting = Arc::new(Collecting::default());
        let reporters: Arc<[Arc<dyn Reporter>]> =
            Arc::from(vec![collecting.clone() as Arc<dyn Reporter>, Arc::new(Failing) as Arc<dyn Reporter>]);
        let stop = CancellationToken::new();
        let flusher = spawn_flusher(aggregator, reporters, Duration::from_secs(1), stop.clone());

        tokio::time::sleep(Duration::from_millis(3_500)).await;
        stop.cancel();
        flusher.await.unwrap();

        let seen = collecting.seen.lock();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0].value("checks"), Some(2.0));
    }

    #[tokio::test]
    async fn tracing_reporter_accepts_every_kind() {
        let aggregator = Aggregator::new(MetricRegistry::new());
        let mut batch = SampleBatch::new();
        batch.add("iterations", 1.0).add("iteration_duration", 12.5).add("vus", 3.0);
        aggregator.fold(&[batch]);
        TracingReporter.report(&aggregator.snapshot()).await.unwrap();
    }
}
