//! Per-flow-key transfer rate tracking

use crate::models::TransferFlow;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;

/// Hourly rate samples kept per key
const DEFAULT_HISTORY_LEN: usize = 48;

/// Accumulates bytes per flow key between detection ticks
///
/// Each tick drains the pending totals, converts them to bytes/hour and
/// appends the rates to a bounded per-key history used for trend checks.
/// A key whose whole history is zero is forgotten until it sends again.
pub struct RateTracker {
    pending: Mutex<HashMap<String, u64>>,
    history: Mutex<HashMap<String, VecDeque<(i64, f64)>>>,
    history_len: usize,
}

impl RateTracker {
    pub fn new() -> Self {
        Self::with_history_len(DEFAULT_HISTORY_LEN)
    }

    pub fn with_history_len(history_len: usize) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            history: Mutex::new(HashMap::new()),
            history_len: history_len.max(1),
        }
    }

    pub fn record(&self, flow: &TransferFlow) {
        self.record_bytes(flow.flow_key().to_string(), flow.total_bytes);
    }

    pub fn record_bytes(&self, key: String, bytes: u64) {
        *self.pending.lock().entry(key).or_default() += bytes;
    }

    /// Take pending totals as bytes/hour over `elapsed` and extend history
    ///
    /// Keys seen earlier but silent since the previous tick report zero,
    /// until they have been silent for a full history window.
    pub fn drain_hourly_rates(&self, elapsed: Duration, now_secs: i64) -> HashMap<String, f64> {
        let pending = std::mem::take(&mut *self.pending.lock());
        let secs = elapsed.as_secs_f64();
        let scale = if secs > 0.0 { 3600.0 / secs } else { 0.0 };

        let mut history = self.history.lock();
        let mut rates: HashMap<String, f64> = history.keys().map(|k| (k.clone(), 0.0)).collect();
        for (key, bytes) in pending {
            rates.insert(key, bytes as f64 * scale);
        }

        for (key, rate) in &rates {
            let samples = history.entry(key.clone()).or_default();
            samples.push_back((now_secs, *rate));
            while samples.len() > self.history_len {
                samples.pop_front();
            }
        }
        let window = self.history_len;
        history.retain(|_, samples| {
            samples.len() < window || samples.iter().any(|&(_, rate)| rate > 0.0)
        });
        rates
    }

    /// Rate history for a key, oldest first
    pub fn history(&self, key: &str) -> Vec<(i64, f64)> {
        self.history
            .lock()
            .get(key)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn pending_keys(&self) -> usize {
        self.pending.lock().len()
    }

    /// Keys currently carried between ticks
    pub fn tracked_keys(&self) -> usize {
        self.history.lock().len()
    }
}

impl Default for RateTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ServiceIdentity, TransferType};
    use chrono::Utc;

    fn flow(bytes: u64) -> TransferFlow {
        let now = Utc::now();
        TransferFlow::new(ServiceIdentity::new("prod", "a"), TransferType::PodToPod, bytes, now, now)
            .to_service(ServiceIdentity::new("prod", "b"))
    }

    #[test]
    fn test_drain_scales_to_hourly() {
        let tracker = RateTracker::new();
        tracker.record(&flow(100));
        tracker.record(&flow(200));

        let rates = tracker.drain_hourly_rates(Duration::from_secs(300), 0);
        assert_eq!(rates["prod/a→prod/b#pod_to_pod"], 300.0 * 12.0);
        assert_eq!(tracker.pending_keys(), 0);
    }

    #[test]
    fn test_history_is_bounded() {
        let tracker = RateTracker::with_history_len(3);
        let key = "prod/a→prod/b#pod_to_pod";

        for tick in 0..5 {
            tracker.record(&flow(3600));
            tracker.drain_hourly_rates(Duration::from_secs(3600), tick * 3600);
        }

        let history = tracker.history(key);
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].0, 2 * 3600);
        assert!(tracker.history("missing").is_empty());
    }

    #[test]
    fn test_silent_keys_report_zero_then_expire() {
        let tracker = RateTracker::with_history_len(3);
        let key = "prod/a→prod/b#pod_to_pod";
        tracker.record(&flow(3600));
        tracker.drain_hourly_rates(Duration::from_secs(3600), 0);

        // Still inside the window: reported as zero
        for tick in 1..=3 {
            let rates = tracker.drain_hourly_rates(Duration::from_secs(3600), tick * 3600);
            assert_eq!(rates[key], 0.0);
        }

        // Three zero samples fill the window, so the key is gone
        assert_eq!(tracker.tracked_keys(), 0);
        assert!(tracker.drain_hourly_rates(Duration::from_secs(3600), 4 * 3600).is_empty());

        // Traffic brings it back
        tracker.record(&flow(10));
        let rates = tracker.drain_hourly_rates(Duration::from_secs(3600), 5 * 3600);
        assert_eq!(rates[key], 10.0);
        assert_eq!(tracker.history(key).len(), 1);
    }

    #[test]
    fn test_many_silent_destinations_do_not_accumulate() {
        let tracker = RateTracker::with_history_len(4);
        for i in 0..1000 {
            tracker.record_bytes(format!("prod/a→52.0.{}.{}#egress", i / 256, i % 256), 100);
        }
        assert_eq!(tracker.drain_hourly_rates(Duration::from_secs(60), 0).len(), 1000);

        let mut evaluated = 0;
        for tick in 1..100 {
            evaluated = tracker.drain_hourly_rates(Duration::from_secs(60), tick * 60).len();
        }
        assert_eq!(evaluated, 0);
        assert_eq!(tracker.tracked_keys(), 0);
    }
}
