//! Pipeline scenario tests
//!
//! These drive the queue and batch worker end to end against in-memory and
//! failing stores.

#[cfg(test)]
mod pipeline_tests {
    use crate::anomaly::RateTracker;
    use crate::collector::{Analytics, BatchWorker, CollectorBuilder, FlowSink, IngestQueue};
    use crate::cost::{CostCategory, CostEngine, CostLedger, PricingRule};
    use crate::graph::TransferGraph;
    use crate::health::{components, ComponentStatus, HealthRegistry};
    use crate::models::{Endpoint, ServiceIdentity, TransferEvent, TransferFlow};
    use crate::observability::PipelineMetrics;
    use crate::storage::{FlowQuery, FlowResult, FlowStore, MemoryStore, StorageError};
    use async_trait::async_trait;
    use chrono::Utc;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::broadcast;
    use tokio::task::JoinHandle;

    const GIB: u64 = 1024 * 1024 * 1024;

    /// Sink that remembers every batch of flows it receives
    #[derive(Default)]
    struct RecordingSink {
        batches: Mutex<Vec<Vec<TransferFlow>>>,
    }

    impl RecordingSink {
        fn batch_count(&self) -> usize {
            self.batches.lock().len()
        }

        fn events_seen(&self) -> u64 {
            self.batches
                .lock()
                .iter()
                .flatten()
                .map(|f| f.event_count)
                .sum()
        }
    }

    #[async_trait]
    impl FlowSink for RecordingSink {
        async fn accept(&self, flows: &[TransferFlow]) {
            self.batches.lock().push(flows.to_vec());
        }
    }

    /// Store whose writes always fail
    struct FailingStore;

    #[async_trait]
    impl FlowStore for FailingStore {
        async fn insert_events(&self, _events: &[TransferEvent]) -> Result<(), StorageError> {
            Err(StorageError::Unavailable("connection refused".to_string()))
        }

        async fn query_flows(&self, _query: &FlowQuery) -> Result<Vec<FlowResult>, StorageError> {
            Ok(Vec::new())
        }
    }

    fn egress_event(service: &str, bytes: u64) -> TransferEvent {
        let source = Endpoint::new("10.0.1.5", 41000)
            .with_identity(ServiceIdentity::new("prod", service));
        let mut event = TransferEvent::new(source, Endpoint::internet("52.216.8.1", 443), Utc::now());
        event.bytes_sent = bytes;
        event.packets_sent = 1;
        event.duration_ns = 1_000_000;
        event
    }

    fn events(n: usize) -> Vec<TransferEvent> {
        (0..n).map(|_| egress_event("orders", 1500)).collect()
    }

    fn start(
        store: Arc<dyn FlowStore>,
        sink: Arc<dyn FlowSink>,
        batch_size: usize,
        flush_interval: Duration,
    ) -> (IngestQueue, BatchWorker) {
        CollectorBuilder::new()
            .store(store)
            .sink(sink)
            .batch_size(batch_size)
            .flush_interval(flush_interval)
            .build()
            .unwrap()
    }

    async fn stop(shutdown: broadcast::Sender<()>, handle: JoinHandle<()>) {
        shutdown.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("worker did not stop")
            .unwrap();
    }

    async fn wait_for_stored(store: &MemoryStore, expected: usize) -> bool {
        for _ in 0..200 {
            if store.len().await >= expected {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_full_queue_drops_without_blocking() {
        let (queue, _worker) = CollectorBuilder::new()
            .store(Arc::new(MemoryStore::new()))
            .sink(Arc::new(RecordingSink::default()))
            .queue_capacity(3)
            .build()
            .unwrap();
        let metrics = PipelineMetrics::new();
        let received = metrics.events_received();
        let dropped = metrics.events_dropped();

        let report = queue.ingest(events(5));

        assert_eq!(report.accepted, 3);
        assert_eq!(report.dropped, 2);
        assert_eq!(queue.len(), 3);
        // Counters are process-wide; other tests only ever add to them
        assert!(metrics.events_received() >= received + 5);
        assert!(metrics.events_dropped() >= dropped + 2);
    }

    #[tokio::test]
    async fn test_flush_on_batch_size() {
        let store = Arc::new(MemoryStore::new());
        let sink = Arc::new(RecordingSink::default());
        let (queue, worker) = start(store.clone(), sink.clone(), 4, Duration::from_secs(3600));
        let (tx, rx) = broadcast::channel(1);
        let handle = tokio::spawn(worker.run(rx));

        queue.ingest(events(4));

        assert!(wait_for_stored(&store, 4).await);
        assert_eq!(sink.batch_count(), 1);
        assert_eq!(sink.events_seen(), 4);

        stop(tx, handle).await;
    }

    #[tokio::test]
    async fn test_flush_on_timer() {
        let store = Arc::new(MemoryStore::new());
        let sink = Arc::new(RecordingSink::default());
        let (queue, worker) = start(store.clone(), sink.clone(), 1000, Duration::from_millis(50));
        let (tx, rx) = broadcast::channel(1);
        let handle = tokio::spawn(worker.run(rx));

        queue.ingest(events(3));

        assert!(wait_for_stored(&store, 3).await);
        assert_eq!(sink.events_seen(), 3);

        stop(tx, handle).await;
    }

    #[tokio::test]
    async fn test_shutdown_flushes_remaining_events() {
        let store = Arc::new(MemoryStore::new());
        let sink = Arc::new(RecordingSink::default());
        let (queue, worker) = start(store.clone(), sink.clone(), 1000, Duration::from_secs(3600));
        let (tx, rx) = broadcast::channel(1);

        queue.ingest(events(5));
        let handle = tokio::spawn(worker.run(rx));
        stop(tx, handle).await;

        assert_eq!(store.len().await, 5);
        assert_eq!(sink.events_seen(), 5);
    }

    #[tokio::test]
    async fn test_worker_stops_when_queue_closed() {
        let store = Arc::new(MemoryStore::new());
        let sink = Arc::new(RecordingSink::default());
        let (queue, worker) = start(store.clone(), sink.clone(), 1000, Duration::from_secs(3600));
        let (_tx, rx) = broadcast::channel(1);

        queue.ingest(events(2));
        drop(queue);
        tokio::time::timeout(Duration::from_secs(5), worker.run(rx))
            .await
            .unwrap();

        assert_eq!(store.len().await, 2);
    }

    #[tokio::test]
    async fn test_storage_failure_keeps_pipeline_running() {
        let sink = Arc::new(RecordingSink::default());
        let health = HealthRegistry::new();
        health.register_all().await;

        let (queue, worker) = CollectorBuilder::new()
            .store(Arc::new(FailingStore))
            .sink(sink.clone())
            .health(health.clone())
            .batch_size(2)
            .flush_interval(Duration::from_secs(3600))
            .build()
            .unwrap();
        let (tx, rx) = broadcast::channel(1);
        let handle = tokio::spawn(worker.run(rx));

        queue.ingest(events(2));
        queue.ingest(events(2));
        let mut degraded = false;
        for _ in 0..200 {
            let storage = health.component(components::STORAGE).await.unwrap();
            degraded = storage.status == ComponentStatus::Degraded;
            if degraded && sink.batch_count() >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        // Both batches still reached the analytics side
        assert!(degraded);
        assert_eq!(sink.batch_count(), 2);
        assert_eq!(sink.events_seen(), 4);
        assert!(!handle.is_finished());

        stop(tx, handle).await;
    }

    #[tokio::test]
    async fn test_events_without_identity_are_stored_but_not_aggregated() {
        let store = Arc::new(MemoryStore::new());
        let sink = Arc::new(RecordingSink::default());
        let (queue, worker) = start(store.clone(), sink.clone(), 1000, Duration::from_secs(3600));
        let (tx, rx) = broadcast::channel(1);

        let mut batch = events(2);
        batch.push(TransferEvent::new(
            Endpoint::new("10.9.9.9", 1234),
            Endpoint::internet("52.216.8.1", 443),
            Utc::now(),
        ));
        queue.ingest(batch);
        let handle = tokio::spawn(worker.run(rx));
        stop(tx, handle).await;

        assert_eq!(store.len().await, 3);
        assert_eq!(sink.events_seen(), 2);
    }

    #[tokio::test]
    async fn test_thousand_gib_egress_costs_89_91() {
        let cost = Arc::new(CostEngine::empty());
        cost.add_pricing_rule(
            PricingRule::new("s3-egress", CostCategory::EgressInternet, 0.09).with_free_tier(1.0),
        );
        let graph = Arc::new(TransferGraph::new());
        let ledger = Arc::new(CostLedger::new());
        let analytics = Arc::new(Analytics::new(
            graph.clone(),
            cost.clone(),
            ledger.clone(),
            Arc::new(RateTracker::new()),
        ));

        let store = Arc::new(MemoryStore::new());
        let (queue, worker) = start(store.clone(), analytics, 10_000, Duration::from_secs(3600));
        let (tx, rx) = broadcast::channel(1);

        let batch: Vec<_> = (0..1000)
            .map(|_| egress_event("order-service", GIB))
            .collect();
        let report = queue.ingest(batch);
        assert_eq!(report.accepted, 1000);

        let handle = tokio::spawn(worker.run(rx));
        stop(tx, handle).await;

        let summary = ledger.summary();
        assert!((summary.total_cost_usd - 89.91).abs() < 1e-6);
        assert!((summary.egress_cost_usd - 89.91).abs() < 1e-6);
        assert_eq!(summary.total_bytes, 1000 * GIB);

        let edge = graph
            .edge("prod/order-service", "external:52.216.8.1")
            .unwrap();
        assert_eq!(edge.total_bytes, 1000 * GIB);
        assert_eq!(edge.total_events, 1000);
        assert!((edge.cost_usd - 89.91).abs() < 1e-6);
        assert_eq!(store.len().await, 1000);
    }
}
