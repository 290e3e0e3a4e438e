use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::{
    aggregate::{MetricSink, Summary},
    metric::{MetricKind, MetricRegistry},
    pipeline::SampleReceiver,
    sample::SampleBatch,
};

/// Consistent point-in-time view of every metric seen so far.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub metrics: BTreeMap<String, Summary>,
}

impl Snapshot {
    pub fn get(&self, metric: &str) -> Option<&Summary> {
        self.metrics.get(metric)
    }

    /// Headline value of a metric (see [`Summary::value`]), `None` if never seen.
    pub fn value(&self, metric: &str) -> Option<f64> {
        self.metrics.get(metric).map(Summary::value)
    }

    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }
}

/// Reduces drained sample batches into per-metric running summaries.
///
/// There is a single writer: the task started by [`Aggregator::spawn`]. Each drained
/// chunk is folded into chunk-local sinks without holding the lock, then merged into
/// the shared sinks in one short critical section, which is also all a
/// [`snapshot`](Aggregator::snapshot) has to wait for.
///
/// Cloning is cheap and every clone sees the same summaries and the same metric
/// registrations.
#[derive(Debug, Clone)]
pub struct Aggregator {
    registry: Arc<RwLock<MetricRegistry>>,
    sinks: Arc<Mutex<HashMap<String, MetricSink>>>,
}

impl Aggregator {
    pub fn new(registry: MetricRegistry) -> Self {
        Self {
            registry: Arc::new(RwLock::new(registry)),
            sinks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Register (or re-register) a metric on this aggregator and all of its clones.
    /// Only samples folded afterwards pick up the new kind.
    pub fn register(&self, name: impl Into<String>, kind: MetricKind) {
        self.registry.write().register(name, kind);
    }

    pub fn kind_of(&self, name: &str) -> MetricKind {
        self.registry.read().kind_of(name)
    }

    /// Fold a chunk of batches into the shared summaries.
    pub fn fold(&self, batches: &[SampleBatch]) {
        let mut local: HashMap<&str, MetricSink> = HashMap::new();
        {
            let registry = self.registry.read();
            for sample in batches.iter().flat_map(|b| b.iter()) {
                local
                    .entry(sample.metric.as_str())
                    .or_insert_with(|| MetricSink::for_kind(registry.kind_of(&sample.metric)))
                    .consume(sample);
            }
        }
        if local.is_empty() {
            return;
        }

        let mut sinks = self.sinks.lock();
        for (name, sink) in local {
            match sinks.get_mut(name) {
                Some(shared) => shared.merge(sink),
                None => {
                    sinks.insert(name.to_string(), sink);
                }
            }
        }
    }

    pub fn snapshot(&self) -> Snapshot {
        let sinks = self.sinks.lock();
        Snapshot {
            metrics: sinks
                .iter()
                .map(|(name, sink)| (name.clone(), sink.summary()))
                .collect(),
        }
    }

    /// Start the consumer task. It runs until the pipeline is closed and empty, then
    /// returns the final snapshot.
    pub fn spawn(&self, rx: SampleReceiver, batch_size: usize) -> JoinHandle<Snapshot> {
        tokio::spawn(aggregator_task(self.clone(), rx, batch_size.max(1)))
    }
}

async fn aggregator_task(agg: Aggregator, mut rx: SampleReceiver, batch_size: usize) -> Snapshot {
    let mut chunk = Vec::with_capacity(batch_size);
    let mut drained = 0u64;

    loop {
        // Wait for the first batch or end the loop once every producer is gone
        match rx.drain().await {
            Some(batch) => chunk.push(batch),
            None => break,
        }
        // Then take whatever else is already queued
        rx.drain_up_to(&mut chunk, batch_size);

        drained += chunk.len() as u64;
        agg.fold(&chunk);
        chunk.clear();
    }

    tracing::debug!("Aggregator drained {drained} batches, stopping");
    agg.snapshot()
}
