//! Batch worker
//!
//! Single consumer of the ingestion queue. Events accumulate into a batch
//! that is flushed when it reaches the configured size or when the flush
//! timer fires, whichever comes first.

use super::{FlowAggregator, FlowSink, IngestQueue};
use crate::health::{components, HealthRegistry};
use crate::models::TransferEvent;
use crate::observability::{PipelineMetrics, StructuredLogger};
use crate::storage::FlowStore;
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info};

/// Configuration for the ingestion pipeline
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    /// Bounded queue capacity (default: 100 000 events)
    pub queue_capacity: usize,
    /// Events per batch before a size-triggered flush (default: 10 000)
    pub batch_size: usize,
    /// Maximum age of a partial batch (default: 5 seconds)
    pub flush_interval: Duration,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 100_000,
            batch_size: 10_000,
            flush_interval: Duration::from_secs(5),
        }
    }
}

pub struct BatchWorker {
    rx: mpsc::Receiver<TransferEvent>,
    store: Arc<dyn FlowStore>,
    sink: Arc<dyn FlowSink>,
    aggregator: FlowAggregator,
    config: CollectorConfig,
    metrics: PipelineMetrics,
    logger: StructuredLogger,
    health: Option<HealthRegistry>,
}

impl BatchWorker {
    pub fn new(
        rx: mpsc::Receiver<TransferEvent>,
        store: Arc<dyn FlowStore>,
        sink: Arc<dyn FlowSink>,
        config: CollectorConfig,
    ) -> Self {
        Self {
            rx,
            store,
            sink,
            aggregator: FlowAggregator::new(),
            config,
            metrics: PipelineMetrics::new(),
            logger: StructuredLogger::new("collector"),
            health: None,
        }
    }

    pub fn with_health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    /// Consume the queue until shutdown
    ///
    /// On shutdown, events still queued are drained and flushed before
    /// returning. The worker also stops once every queue handle is dropped.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            batch_size = self.config.batch_size,
            flush_interval_ms = self.config.flush_interval.as_millis() as u64,
            "Starting batch worker"
        );

        let batch_size = self.config.batch_size.max(1);
        let mut batch: Vec<TransferEvent> = Vec::with_capacity(batch_size.min(10_000));
        let mut ticker = interval(self.config.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                received = self.rx.recv() => match received {
                    Some(event) => {
                        batch.push(event);
                        if batch.len() >= batch_size {
                            self.flush(&mut batch).await;
                        }
                    }
                    None => {
                        info!("Ingestion queue closed, stopping batch worker");
                        self.flush(&mut batch).await;
                        break;
                    }
                },
                _ = ticker.tick() => {
                    self.flush(&mut batch).await;
                }
                _ = shutdown.recv() => {
                    info!("Shutting down batch worker");
                    while let Ok(event) = self.rx.try_recv() {
                        batch.push(event);
                        if batch.len() >= batch_size {
                            self.flush(&mut batch).await;
                        }
                    }
                    self.flush(&mut batch).await;
                    break;
                }
            }
        }
    }

    /// Aggregate and hand off the current batch, then persist it
    ///
    /// A failed write is not retried; the flows have already been applied.
    async fn flush(&self, batch: &mut Vec<TransferEvent>) {
        if batch.is_empty() {
            return;
        }
        let events = std::mem::take(batch);
        let start = Instant::now();

        let aggregation = self.aggregator.aggregate(&events);
        if aggregation.skipped > 0 {
            self.metrics
                .inc_events_without_identity(aggregation.skipped as u64);
            debug!(
                skipped = aggregation.skipped,
                "Events without source identity left out of aggregation"
            );
        }
        self.metrics
            .inc_flows_aggregated(aggregation.flows.len() as u64);
        self.sink.accept(&aggregation.flows).await;

        let write_start = Instant::now();
        let stored = match self.store.insert_events(&events).await {
            Ok(()) => {
                self.metrics
                    .record_batch_written(events.len() as u64, write_start.elapsed().as_secs_f64());
                if let Some(ref health) = self.health {
                    health.set_healthy(components::STORAGE).await;
                }
                true
            }
            Err(e) => {
                self.metrics
                    .record_storage_error(write_start.elapsed().as_secs_f64());
                self.logger.log_storage_failure(events.len(), &e);
                if let Some(ref health) = self.health {
                    health
                        .set_degraded(components::STORAGE, format!("Batch write failed: {}", e))
                        .await;
                }
                false
            }
        };

        self.logger.log_batch_flushed(
            events.len(),
            aggregation.flows.len(),
            stored,
            start.elapsed().as_millis(),
        );
    }
}

/// Builder for the queue and its worker
pub struct CollectorBuilder {
    store: Option<Arc<dyn FlowStore>>,
    sink: Option<Arc<dyn FlowSink>>,
    health: Option<HealthRegistry>,
    config: CollectorConfig,
}

impl CollectorBuilder {
    pub fn new() -> Self {
        Self {
            store: None,
            sink: None,
            health: None,
            config: CollectorConfig::default(),
        }
    }

    pub fn store(mut self, store: Arc<dyn FlowStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn sink(mut self, sink: Arc<dyn FlowSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    pub fn config(mut self, config: CollectorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.config.queue_capacity = capacity;
        self
    }

    pub fn batch_size(mut self, size: usize) -> Self {
        self.config.batch_size = size;
        self
    }

    pub fn flush_interval(mut self, interval: Duration) -> Self {
        self.config.flush_interval = interval;
        self
    }

    pub fn build(self) -> Result<(IngestQueue, BatchWorker)> {
        let store = self
            .store
            .ok_or_else(|| anyhow::anyhow!("Flow store is required"))?;
        let sink = self
            .sink
            .ok_or_else(|| anyhow::anyhow!("Flow sink is required"))?;
        if self.config.flush_interval.is_zero() {
            anyhow::bail!("Flush interval must be greater than zero");
        }

        let (queue, rx) = IngestQueue::channel(self.config.queue_capacity);
        let mut worker = BatchWorker::new(rx, store, sink, self.config);
        if let Some(health) = self.health {
            worker = worker.with_health(health);
        }
        Ok((queue, worker))
    }
}

impl Default for CollectorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TransferFlow;
    use crate::storage::MemoryStore;
    use async_trait::async_trait;

    struct NullSink;

    #[async_trait]
    impl FlowSink for NullSink {
        async fn accept(&self, _flows: &[TransferFlow]) {}
    }

    #[test]
    fn test_collector_config_default() {
        let config = CollectorConfig::default();
        assert_eq!(config.queue_capacity, 100_000);
        assert_eq!(config.batch_size, 10_000);
        assert_eq!(config.flush_interval, Duration::from_secs(5));
    }

    #[test]
    fn test_builder() {
        let result = CollectorBuilder::new()
            .store(Arc::new(MemoryStore::new()))
            .sink(Arc::new(NullSink))
            .queue_capacity(16)
            .build();

        let (queue, _worker) = result.unwrap();
        assert_eq!(queue.capacity(), 16);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_builder_missing_store() {
        let result = CollectorBuilder::new().sink(Arc::new(NullSink)).build();
        assert!(result.is_err());
    }

    #[test]
    fn test_builder_missing_sink() {
        let result = CollectorBuilder::new()
            .store(Arc::new(MemoryStore::new()))
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_builder_rejects_zero_interval() {
        let result = CollectorBuilder::new()
            .store(Arc::new(MemoryStore::new()))
            .sink(Arc::new(NullSink))
            .flush_interval(Duration::ZERO)
            .build();
        assert!(result.is_err());
    }
}
