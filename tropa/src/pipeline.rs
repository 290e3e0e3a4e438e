//! Bounded multi-producer queue carrying [`SampleBatch`]es from workers to the
//! aggregator.
//!
//! Producers wait when the queue is full instead of dropping samples: a slowed
//! worker skews a measurement far less than silently lost samples do.

use tokio::sync::mpsc::{self, error::TrySendError};

use crate::{
    error::{Error, Result},
    sample::SampleBatch,
};

/// Create a pipeline holding at most `capacity` batches.
pub fn pipeline(capacity: usize) -> (SampleSender, SampleReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (SampleSender { tx }, SampleReceiver { rx })
}

/// Producer side. Cheap to clone; every worker holds one.
#[derive(Debug, Clone)]
pub struct SampleSender {
    tx: mpsc::Sender<SampleBatch>,
}

impl SampleSender {
    /// Push a batch, waiting for room if the pipeline is full.
    pub async fn push(&self, batch: SampleBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        self.tx.send(batch).await.map_err(|_| Error::PipelineClosed)
    }

    /// Push without waiting. A full pipeline hands the batch back.
    pub fn try_push(&self, batch: SampleBatch) -> Result<(), SampleBatch> {
        if batch.is_empty() {
            return Ok(());
        }
        self.tx.try_send(batch).map_err(|e| match e {
            TrySendError::Full(b) | TrySendError::Closed(b) => b,
        })
    }

    /// Number of batches that can be pushed before producers start waiting.
    pub fn remaining_capacity(&self) -> usize {
        self.tx.capacity()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consumer side, owned by the aggregator.
#[derive(Debug)]
pub struct SampleReceiver {
    rx: mpsc::Receiver<SampleBatch>,
}

impl SampleReceiver {
    /// Wait for the next batch. `None` once every sender is gone and the queue is empty.
    pub async fn drain(&mut self) -> Option<SampleBatch> {
        self.rx.recv().await
    }

    /// Take every batch currently queued without waiting.
    pub fn drain_buffered(&mut self) -> Vec<SampleBatch> {
        let mut batches = Vec::new();
        while let Ok(batch) = self.rx.try_recv() {
            batches.push(batch);
        }
        batches
    }

    /// Take at most `max` queued batches without waiting, appending to `into`.
    pub(crate) fn drain_up_to(&mut self, into: &mut Vec<SampleBatch>, max: usize) {
        while into.len() < max {
            match self.rx.try_recv() {
                Ok(batch) => into.push(batch),
                Err(_) => break,
            }
        }
    }
}

/// Owns the controller's producer handle so the pipeline can be closed exactly once.
#[derive(Debug)]
pub struct Pipeline {
    tx: Option<SampleSender>,
}

impl Pipeline {
    pub fn new(capacity: usize) -> (Self, SampleReceiver) {
        let (tx, rx) = pipeline(capacity);
        (Self { tx: Some(tx) }, rx)
    }

    /// A producer handle, or `None` once closed.
    pub fn sender(&self) -> Option<SampleSender> {
        self.tx.clone()
    }

    /// Drop the controller's handle. The consumer sees the end of the stream once
    /// the remaining producer handles are dropped too.
    pub fn close(&mut self) {
        if self.tx.take().is_some() {
            tracing::debug!("Sample pipeline closed");
        }
    }
}
