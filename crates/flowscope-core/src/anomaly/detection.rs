//! Periodic anomaly detection
//!
//! Every tick turns the bytes seen since the previous tick into hourly
//! rates per flow key, checks them against baselines and the leak detector,
//! and records whatever survives deduplication.

use super::{AnomalyDeduplicator, BaselineEngine, LeakDetector, RateTracker};
use crate::anomaly::Anomaly;
use crate::health::{components, HealthRegistry};
use crate::models::{FlowKey, TransferType};
use crate::observability::{PipelineMetrics, StructuredLogger};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct DetectionConfig {
    /// Time between detection passes (default: 5 minutes)
    pub interval: Duration,
    /// Window in which repeats of the same anomaly are suppressed (default: 1 hour)
    pub dedup_window: Duration,
    pub leak_detector: LeakDetector,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            dedup_window: Duration::from_secs(3600),
            leak_detector: LeakDetector::default(),
        }
    }
}

pub struct DetectionLoop {
    engine: Arc<BaselineEngine>,
    rates: Arc<RateTracker>,
    dedup: AnomalyDeduplicator,
    config: DetectionConfig,
    metrics: PipelineMetrics,
    logger: StructuredLogger,
    health: Option<HealthRegistry>,
}

impl DetectionLoop {
    pub fn new(
        engine: Arc<BaselineEngine>,
        rates: Arc<RateTracker>,
        config: DetectionConfig,
    ) -> Self {
        Self {
            engine,
            rates,
            dedup: AnomalyDeduplicator::new(config.dedup_window),
            config,
            metrics: PipelineMetrics::new(),
            logger: StructuredLogger::new("detector"),
            health: None,
        }
    }

    pub fn with_health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    pub fn with_logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = logger;
        self
    }

    /// Run one detection pass over the traffic of the last `elapsed`
    ///
    /// Returns the anomalies that were recorded.
    pub fn tick(&self, elapsed: Duration, now: DateTime<Utc>) -> Vec<Anomaly> {
        let rates = self.rates.drain_hourly_rates(elapsed, now.timestamp());
        let mut found = self.engine.detect_anomalies_at(&rates, now);

        for key in rates.keys() {
            let is_egress = FlowKey::parse(key)
                .map_or(false, |k| k.transfer_type == TransferType::Egress);
            if !is_egress {
                continue;
            }
            if let Some(trend) = self.config.leak_detector.detect(&self.rates.history(key)) {
                found.push(trend.to_anomaly(key, now));
            }
        }

        let recorded = self.dedup.filter(found);
        for anomaly in &recorded {
            self.logger.log_anomaly_detected(anomaly);
            self.metrics.inc_anomalies_detected(anomaly);
            self.engine.add_anomaly(anomaly.clone());
        }

        debug!(keys = rates.len(), recorded = recorded.len(), "Detection pass complete");
        recorded
    }

    /// Run until the shutdown signal
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            "Starting anomaly detection loop"
        );

        let mut ticker = interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;
        let mut last = Instant::now();

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let elapsed = last.elapsed();
                    last = Instant::now();
                    self.tick(elapsed, Utc::now());
                    if let Some(ref health) = self.health {
                        health.set_healthy(components::DETECTOR).await;
                    }
                }
                _ = shutdown.recv() => {
                    info!("Shutting down anomaly detection loop");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anomaly::AnomalyType;
    use crate::models::{Endpoint, ServiceIdentity, TransferFlow};

    const EGRESS_KEY: &str = "prod/orders→52.1.1.1#egress";

    fn egress(bytes: u64) -> TransferFlow {
        let now = Utc::now();
        TransferFlow::new(ServiceIdentity::new("prod", "orders"), TransferType::Egress, bytes, now, now)
            .to_endpoint(Endpoint::internet("52.1.1.1", 443))
    }

    fn detection() -> (DetectionLoop, Arc<BaselineEngine>, Arc<RateTracker>) {
        let engine = Arc::new(BaselineEngine::new(3.0));
        let rates = Arc::new(RateTracker::new());
        let detection = DetectionLoop::new(engine.clone(), rates.clone(), DetectionConfig::default());
        (detection, engine, rates)
    }

    #[test]
    fn test_new_endpoint_recorded_once() {
        let (detection, engine, rates) = detection();

        rates.record(&egress(1000));
        let first = detection.tick(Duration::from_secs(3600), Utc::now());
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].anomaly_type, AnomalyType::NewEndpoint);
        assert_eq!(first[0].current_value, 1000.0);

        rates.record(&egress(1000));
        assert!(detection.tick(Duration::from_secs(3600), Utc::now()).is_empty());
        assert_eq!(engine.anomalies().len(), 1);
    }

    #[test]
    fn test_spike_against_baseline() {
        let (detection, engine, rates) = detection();
        let now = Utc::now();
        let values: Vec<f64> = (0..24).map(|i| if i % 2 == 0 { 900.0 } else { 1100.0 }).collect();
        engine.build_baseline(EGRESS_KEY, &values, now, now).unwrap();

        rates.record(&egress(1050));
        assert!(detection.tick(Duration::from_secs(3600), now).is_empty());

        rates.record(&egress(100_000));
        let recorded = detection.tick(Duration::from_secs(3600), now);
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].anomaly_type, AnomalyType::Spike);
        assert_eq!(engine.active_anomalies().len(), 1);
    }

    #[test]
    fn test_growing_egress_reported_as_leak() {
        let engine = Arc::new(BaselineEngine::new(1000.0));
        let rates = Arc::new(RateTracker::new());
        let config = DetectionConfig {
            leak_detector: LeakDetector::new(Duration::from_secs(24 * 3600), 1.0),
            ..Default::default()
        };
        let detection = DetectionLoop::new(engine.clone(), rates.clone(), config);
        let start = Utc::now();

        let mut leaks = 0;
        for hour in 0..8i64 {
            rates.record(&egress(1_000_000 + hour as u64 * 500_000));
            let recorded = detection.tick(
                Duration::from_secs(3600),
                start + chrono::Duration::hours(hour),
            );
            leaks += recorded.iter().filter(|a| a.anomaly_type == AnomalyType::Leak).count();
        }
        assert_eq!(leaks, 1);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let (detection, _, _) = detection();
        let (tx, rx) = broadcast::channel(1);
        let handle = tokio::spawn(detection.run(rx));
        tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
