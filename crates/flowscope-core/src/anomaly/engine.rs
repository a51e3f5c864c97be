//! Baseline registry and anomaly lifecycle

use super::baseline::Baseline;
use super::types::{Anomaly, AnomalySummary, AnomalyType, Severity};
use crate::cost::BYTES_PER_GB;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Default z-score threshold
pub const DEFAULT_THRESHOLD_STD_DEV: f64 = 3.0;

/// Rate used for the rough cost impact of a deviation
const IMPACT_COST_PER_GB: f64 = 0.09;

/// Number of anomalies reported in a summary
const TOP_ANOMALIES: usize = 10;

/// Holds baselines per flow key and the list of recorded anomalies
///
/// Baselines and anomalies sit behind independent locks.
pub struct BaselineEngine {
    baselines: RwLock<HashMap<String, Arc<Baseline>>>,
    anomalies: RwLock<Vec<Anomaly>>,
    threshold_std_dev: f64,
}

impl BaselineEngine {
    /// Engine flagging deviations beyond `threshold_std_dev`; non-positive
    /// thresholds fall back to 3.0
    pub fn new(threshold_std_dev: f64) -> Self {
        let threshold_std_dev = if threshold_std_dev > 0.0 {
            threshold_std_dev
        } else {
            DEFAULT_THRESHOLD_STD_DEV
        };
        Self {
            baselines: RwLock::new(HashMap::new()),
            anomalies: RwLock::new(Vec::new()),
            threshold_std_dev,
        }
    }

    pub fn threshold_std_dev(&self) -> f64 {
        self.threshold_std_dev
    }

    /// Build and store a baseline, replacing any prior one for the key
    pub fn build_baseline(
        &self,
        flow_key: &str,
        hourly_values: &[f64],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Option<Arc<Baseline>> {
        let baseline = Arc::new(Baseline::from_hourly(flow_key, hourly_values, start, end)?);
        self.baselines
            .write()
            .insert(flow_key.to_string(), baseline.clone());

        info!(
            flow = %flow_key,
            mean = baseline.bytes_per_hour_mean,
            stddev = baseline.bytes_per_hour_std_dev,
            samples = baseline.sample_count,
            "Baseline built"
        );
        Some(baseline)
    }

    pub fn baseline(&self, flow_key: &str) -> Option<Arc<Baseline>> {
        self.baselines.read().get(flow_key).cloned()
    }

    pub fn baselines(&self) -> Vec<Arc<Baseline>> {
        self.baselines.read().values().cloned().collect()
    }

    /// Check hourly rates per flow key against their baselines
    ///
    /// Returned anomalies are not recorded; pass them to [`add_anomaly`].
    ///
    /// [`add_anomaly`]: BaselineEngine::add_anomaly
    pub fn detect_anomalies(&self, current: &HashMap<String, f64>) -> Vec<Anomaly> {
        self.detect_anomalies_at(current, Utc::now())
    }

    pub fn detect_anomalies_at(
        &self,
        current: &HashMap<String, f64>,
        now: DateTime<Utc>,
    ) -> Vec<Anomaly> {
        let baselines = self.baselines.read();
        let mut found = Vec::new();

        for (flow_key, &value) in current {
            match baselines.get(flow_key) {
                None if value > 0.0 => {
                    let mut anomaly =
                        Anomaly::new(AnomalyType::NewEndpoint, Severity::Info, flow_key, now);
                    anomaly.current_value = value;
                    anomaly.absolute_delta = value;
                    found.push(anomaly);
                }
                None => {}
                Some(baseline) if baseline.is_anomalous(value, self.threshold_std_dev) => {
                    found.push(deviation_anomaly(flow_key, baseline, value, now));
                }
                Some(_) => {}
            }
        }

        debug!(checked = current.len(), anomalies = found.len(), "Anomaly detection pass");
        found
    }

    pub fn add_anomaly(&self, anomaly: Anomaly) {
        self.anomalies.write().push(anomaly);
    }

    pub fn anomaly(&self, id: Uuid) -> Option<Anomaly> {
        self.anomalies.read().iter().find(|a| a.id == id).cloned()
    }

    pub fn anomalies(&self) -> Vec<Anomaly> {
        self.anomalies.read().clone()
    }

    pub fn active_anomalies(&self) -> Vec<Anomaly> {
        self.anomalies
            .read()
            .iter()
            .filter(|a| a.is_active())
            .cloned()
            .collect()
    }

    /// Mark an anomaly as seen; it stays active
    ///
    /// Returns `None` for an unknown id. A resolved anomaly is returned
    /// unchanged.
    pub fn acknowledge(&self, id: Uuid, by: &str) -> Option<Anomaly> {
        let mut anomalies = self.anomalies.write();
        let anomaly = anomalies.iter_mut().find(|a| a.id == id)?;
        if anomaly.resolved {
            return Some(anomaly.clone());
        }

        let now = Utc::now();
        anomaly.acknowledged = true;
        anomaly.acknowledged_by = by.to_string();
        anomaly.acknowledged_at = Some(now);
        anomaly.updated_at = now;
        Some(anomaly.clone())
    }

    /// Close an anomaly; resolution is terminal
    pub fn resolve(&self, id: Uuid, notes: &str) -> Option<Anomaly> {
        let mut anomalies = self.anomalies.write();
        let anomaly = anomalies.iter_mut().find(|a| a.id == id)?;
        if anomaly.resolved {
            return Some(anomaly.clone());
        }

        let now = Utc::now();
        anomaly.resolved = true;
        anomaly.resolved_at = Some(now);
        anomaly.ended_at = Some(now);
        anomaly.resolution_notes = notes.to_string();
        anomaly.updated_at = now;
        Some(anomaly.clone())
    }

    pub fn anomaly_summary(&self) -> AnomalySummary {
        let anomalies = self.anomalies.read();
        let mut summary = AnomalySummary::default();

        for a in anomalies.iter() {
            if a.is_active() {
                summary.total_active += 1;
                summary.total_cost_impact_usd += a.estimated_cost_impact_usd;
            } else {
                summary.total_resolved += 1;
            }
            *summary.by_severity.entry(a.severity).or_default() += 1;
            *summary.by_type.entry(a.anomaly_type).or_default() += 1;
        }

        let mut sorted: Vec<&Anomaly> = anomalies.iter().collect();
        sorted.sort_by(|a, b| {
            b.estimated_cost_impact_usd
                .total_cmp(&a.estimated_cost_impact_usd)
        });
        summary.top_anomalies = sorted.into_iter().take(TOP_ANOMALIES).cloned().collect();
        summary
    }
}

impl Default for BaselineEngine {
    fn default() -> Self {
        Self::new(DEFAULT_THRESHOLD_STD_DEV)
    }
}

fn deviation_anomaly(
    flow_key: &str,
    baseline: &Baseline,
    value: f64,
    now: DateTime<Utc>,
) -> Anomaly {
    let deviation = baseline.z_score(value).unwrap_or(0.0);
    let absolute_delta = value - baseline.bytes_per_hour_mean;

    let anomaly_type = if deviation > 0.0 && deviation < 5.0 {
        AnomalyType::SlowBurn
    } else {
        AnomalyType::Spike
    };

    let hourly_impact = absolute_delta / BYTES_PER_GB * IMPACT_COST_PER_GB;

    let mut anomaly = Anomaly::new(anomaly_type, Severity::from_deviation(deviation), flow_key, now);
    anomaly.current_value = value;
    anomaly.baseline_value = baseline.bytes_per_hour_mean;
    anomaly.deviation = deviation;
    anomaly.absolute_delta = absolute_delta;
    anomaly.estimated_cost_impact_usd = hourly_impact;
    anomaly.estimated_monthly_impact_usd = hourly_impact * 24.0 * 30.0;
    anomaly
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "prod/orders→52.1.1.1#egress";

    fn engine_with_baseline() -> (BaselineEngine, Arc<Baseline>) {
        let engine = BaselineEngine::new(3.0);
        let values: Vec<f64> = (0..48).map(|i| if i % 2 == 0 { 900.0 } else { 1100.0 }).collect();
        let now = Utc::now();
        let baseline = engine.build_baseline(KEY, &values, now, now).unwrap();
        (engine, baseline)
    }

    fn current(value: f64) -> HashMap<String, f64> {
        HashMap::from([(KEY.to_string(), value)])
    }

    #[test]
    fn test_threshold_defaults() {
        assert_eq!(BaselineEngine::new(0.0).threshold_std_dev(), 3.0);
        assert_eq!(BaselineEngine::new(-1.0).threshold_std_dev(), 3.0);
        assert_eq!(BaselineEngine::new(2.5).threshold_std_dev(), 2.5);
    }

    #[test]
    fn test_baseline_minimum_and_replacement() {
        let engine = BaselineEngine::default();
        let now = Utc::now();
        assert!(engine.build_baseline(KEY, &[1.0; 23], now, now).is_none());
        assert!(engine.baseline(KEY).is_none());

        let first = engine.build_baseline(KEY, &[1.0; 24], now, now).unwrap();
        assert_eq!(first.sample_count, 24);
        let second = engine.build_baseline(KEY, &[2.0; 30], now, now).unwrap();

        let stored = engine.baseline(KEY).unwrap();
        assert_eq!(stored.id, second.id);
        assert_eq!(stored.sample_count, 30);
        assert_eq!(engine.baselines().len(), 1);
    }

    #[test]
    fn test_new_endpoint_detection() {
        let engine = BaselineEngine::default();
        let found = engine.detect_anomalies(&HashMap::from([
            ("prod/a→prod/b#pod_to_pod".to_string(), 10.0),
            ("prod/a→prod/c#pod_to_pod".to_string(), 0.0),
        ]));

        assert_eq!(found.len(), 1);
        assert_eq!(found[0].anomaly_type, AnomalyType::NewEndpoint);
        assert_eq!(found[0].severity, Severity::Info);
        assert_eq!(found[0].absolute_delta, 10.0);
    }

    #[test]
    fn test_z_score_symmetry() {
        let (engine, baseline) = engine_with_baseline();
        let mean = baseline.bytes_per_hour_mean;
        let sd = baseline.bytes_per_hour_std_dev;

        for k in [0.5, 2.9, 3.1, 4.0, 8.0, 12.0] {
            let above = mean + k * sd;
            let below = 2.0 * mean - above;
            let flagged_above = !engine.detect_anomalies(&current(above)).is_empty();
            let flagged_below = !engine.detect_anomalies(&current(below)).is_empty();
            assert_eq!(flagged_above, flagged_below, "asymmetric at k = {k}");
            assert_eq!(flagged_above, k > 3.0);
        }
    }

    #[test]
    fn test_type_and_severity_rules() {
        let (engine, baseline) = engine_with_baseline();
        let mean = baseline.bytes_per_hour_mean;
        let sd = baseline.bytes_per_hour_std_dev;

        let slow = engine.detect_anomalies(&current(mean + 4.0 * sd)).remove(0);
        assert_eq!(slow.anomaly_type, AnomalyType::SlowBurn);
        assert_eq!(slow.severity, Severity::Low);

        let medium = engine.detect_anomalies(&current(mean + 6.0 * sd)).remove(0);
        assert_eq!(medium.anomaly_type, AnomalyType::Spike);
        assert_eq!(medium.severity, Severity::Medium);

        let high = engine.detect_anomalies(&current(mean + 8.0 * sd)).remove(0);
        assert_eq!(high.severity, Severity::High);

        let critical = engine.detect_anomalies(&current(mean + 11.0 * sd)).remove(0);
        assert_eq!(critical.severity, Severity::Critical);

        let drop = engine.detect_anomalies(&current(mean - 4.0 * sd)).remove(0);
        assert_eq!(drop.anomaly_type, AnomalyType::Spike);
        assert!(drop.deviation < 0.0);
    }

    #[test]
    fn test_cost_impact() {
        let engine = BaselineEngine::default();
        let now = Utc::now();
        engine.build_baseline(KEY, &[0.0; 24], now, now).unwrap();

        let anomaly = engine.detect_anomalies(&current(BYTES_PER_GB)).remove(0);
        assert_eq!(anomaly.deviation, 0.0);
        assert!((anomaly.estimated_cost_impact_usd - 0.09).abs() < 1e-12);
        assert!((anomaly.estimated_monthly_impact_usd - 0.09 * 720.0).abs() < 1e-9);
    }

    #[test]
    fn test_lifecycle() {
        let engine = BaselineEngine::default();
        let anomaly = Anomaly::new(AnomalyType::Spike, Severity::High, KEY, Utc::now());
        let id = anomaly.id;
        engine.add_anomaly(anomaly);
        assert!(engine.anomaly(id).unwrap().is_active());

        let acked = engine.acknowledge(id, "oncall").unwrap();
        assert!(acked.acknowledged);
        assert!(acked.is_active());
        assert_eq!(engine.active_anomalies().len(), 1);

        let resolved = engine.resolve(id, "rolled back").unwrap();
        assert!(!resolved.is_active());
        assert_eq!(resolved.resolution_notes, "rolled back");
        assert!(engine.active_anomalies().is_empty());

        let after = engine.acknowledge(id, "someone-else").unwrap();
        assert!(!after.is_active());
        assert_eq!(after.acknowledged_by, "oncall");

        let again = engine.resolve(id, "other notes").unwrap();
        assert_eq!(again.resolution_notes, "rolled back");

        assert!(engine.acknowledge(Uuid::new_v4(), "x").is_none());
        assert!(engine.resolve(Uuid::new_v4(), "x").is_none());
    }

    #[test]
    fn test_summary() {
        let engine = BaselineEngine::default();
        let now = Utc::now();
        let mut ids = Vec::new();
        for (i, severity) in [Severity::Low, Severity::High, Severity::High].iter().enumerate() {
            let mut anomaly = Anomaly::new(AnomalyType::Spike, *severity, KEY, now);
            anomaly.estimated_cost_impact_usd = (i + 1) as f64;
            ids.push(anomaly.id);
            engine.add_anomaly(anomaly);
        }
        engine.resolve(ids[0], "done");

        let summary = engine.anomaly_summary();
        assert_eq!(summary.total_active, 2);
        assert_eq!(summary.total_resolved, 1);
        assert_eq!(summary.by_severity[&Severity::High], 2);
        assert_eq!(summary.by_type[&AnomalyType::Spike], 3);
        assert_eq!(summary.total_cost_impact_usd, 5.0);
        assert_eq!(summary.top_anomalies[0].id, ids[2]);
        assert_eq!(summary.top_anomalies.len(), 3);
    }
}
