//! Ingestion pipeline for transfer events
//!
//! Producers push events into a bounded [`IngestQueue`] without ever
//! blocking; a single [`BatchWorker`] drains the queue, persists batches to
//! the [`FlowStore`](crate::storage::FlowStore), aggregates them into flows
//! and hands the flows to a [`FlowSink`] (normally [`Analytics`]).

mod aggregator;
mod analytics;
mod r#loop;

#[cfg(test)]
mod tests;

pub use aggregator::{Aggregation, FlowAggregator};
pub use analytics::Analytics;
pub use r#loop::{BatchWorker, CollectorBuilder, CollectorConfig};

use crate::models::{TransferEvent, TransferFlow};
use crate::observability::{PipelineMetrics, StructuredLogger};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

pub use async_trait::async_trait;

/// Consumer of aggregated flows
#[async_trait]
pub trait FlowSink: Send + Sync {
    /// Process the flows of one flushed batch
    async fn accept(&self, flows: &[TransferFlow]);
}

/// Outcome of one `ingest` call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestReport {
    pub accepted: usize,
    pub dropped: usize,
}

/// Producer handle of the ingestion queue
///
/// Cheap to clone; all clones feed the same worker.
#[derive(Clone)]
pub struct IngestQueue {
    tx: mpsc::Sender<TransferEvent>,
    capacity: usize,
    metrics: PipelineMetrics,
    logger: StructuredLogger,
}

impl IngestQueue {
    /// Create a queue of fixed capacity and its receiving end
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<TransferEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let queue = Self {
            tx,
            capacity: capacity.max(1),
            metrics: PipelineMetrics::new(),
            logger: StructuredLogger::new("collector"),
        };
        (queue, rx)
    }

    /// Enqueue events, dropping whatever does not fit
    ///
    /// Never waits for queue space.
    pub fn ingest(&self, events: Vec<TransferEvent>) -> IngestReport {
        let mut report = IngestReport::default();

        for event in events {
            match self.tx.try_send(event) {
                Ok(()) => report.accepted += 1,
                Err(TrySendError::Full(_)) | Err(TrySendError::Closed(_)) => report.dropped += 1,
            }
        }

        self.metrics
            .inc_events_received((report.accepted + report.dropped) as u64);
        if report.dropped > 0 {
            self.metrics.inc_events_dropped(report.dropped as u64);
            self.logger.log_events_dropped(report.dropped, self.capacity);
        }
        report
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Events waiting for the worker
    pub fn len(&self) -> usize {
        self.capacity - self.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
