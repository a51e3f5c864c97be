//! Repeat suppression for detected anomalies

use super::types::{Anomaly, AnomalyType};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Default deduplication window (1 hour)
const DEFAULT_DEDUP_WINDOW_SECS: u64 = 60 * 60;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct DedupKey {
    anomaly_type: AnomalyType,
    key: String,
}

impl DedupKey {
    fn of(anomaly: &Anomaly) -> Self {
        Self {
            anomaly_type: anomaly.anomaly_type,
            key: anomaly.dedup_key(),
        }
    }
}

/// Suppresses anomalies of the same type for the same flow within a window
pub struct AnomalyDeduplicator {
    window: Duration,
    recent: RwLock<HashMap<DedupKey, Instant>>,
}

impl AnomalyDeduplicator {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            recent: RwLock::new(HashMap::new()),
        }
    }

    pub fn should_suppress(&self, anomaly: &Anomaly) -> bool {
        self.recent
            .read()
            .get(&DedupKey::of(anomaly))
            .map_or(false, |last| last.elapsed() < self.window)
    }

    pub fn record(&self, anomaly: &Anomaly) {
        let mut recent = self.recent.write();
        recent.insert(DedupKey::of(anomaly), Instant::now());
        recent.retain(|_, at| at.elapsed() < self.window);
    }

    /// Drop suppressed anomalies and record the rest
    pub fn filter(&self, anomalies: Vec<Anomaly>) -> Vec<Anomaly> {
        anomalies
            .into_iter()
            .filter(|a| {
                if self.should_suppress(a) {
                    return false;
                }
                self.record(a);
                true
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.recent.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for AnomalyDeduplicator {
    fn default() -> Self {
        Self::new(Duration::from_secs(DEFAULT_DEDUP_WINDOW_SECS))
    }
}
