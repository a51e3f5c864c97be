//! Hourly traffic baselines

use crate::models::FlowKey;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Minimum hourly samples for a usable baseline
pub const MIN_BASELINE_SAMPLES: usize = 24;

/// Statistical profile of hourly bytes for one flow key
///
/// Baselines are immutable once built; retraining replaces them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Baseline {
    pub id: Uuid,
    pub flow_key: String,
    pub source_service: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub destination_service: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub transfer_type: String,
    pub baseline_start: DateTime<Utc>,
    pub baseline_end: DateTime<Utc>,
    pub sample_count: usize,
    pub bytes_per_hour_mean: f64,
    #[serde(rename = "bytes_per_hour_stddev")]
    pub bytes_per_hour_std_dev: f64,
    pub bytes_per_hour_median: f64,
    pub bytes_per_hour_p95: f64,
    pub bytes_per_hour_p99: f64,
    pub bytes_per_hour_max: f64,
    /// Mean by hour of day, 24 values
    pub hourly_pattern: Vec<f64>,
    /// Mean by day of week, 7 values
    pub daily_pattern: Vec<f64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Baseline {
    /// Compute a baseline, or `None` with fewer than 24 samples
    pub fn from_hourly(
        flow_key: &str,
        hourly_values: &[f64],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Option<Self> {
        if hourly_values.len() < MIN_BASELINE_SAMPLES {
            return None;
        }

        let (source_service, destination_service, transfer_type) = match FlowKey::parse(flow_key) {
            Some(key) => (key.source, key.destination, key.transfer_type.to_string()),
            None => (flow_key.to_string(), String::new(), String::new()),
        };

        let mut sorted = hourly_values.to_vec();
        sorted.sort_by(|a, b| a.total_cmp(b));

        let bytes_per_hour_mean = mean(hourly_values);
        let now = Utc::now();

        Some(Self {
            id: Uuid::new_v4(),
            flow_key: flow_key.to_string(),
            source_service,
            destination_service,
            transfer_type,
            baseline_start: start,
            baseline_end: end,
            sample_count: hourly_values.len(),
            bytes_per_hour_mean,
            bytes_per_hour_std_dev: std_dev(hourly_values, bytes_per_hour_mean),
            bytes_per_hour_median: median(&sorted),
            bytes_per_hour_p95: percentile(&sorted, 95.0),
            bytes_per_hour_p99: percentile(&sorted, 99.0),
            bytes_per_hour_max: sorted.last().copied().unwrap_or(0.0),
            hourly_pattern: seasonal_means(hourly_values, 24, |i| i % 24),
            daily_pattern: seasonal_means(hourly_values, 7, |i| (i / 24) % 7),
            created_at: now,
            updated_at: now,
        })
    }

    /// Z-score of `value`, or `None` when the baseline has no spread
    pub fn z_score(&self, value: f64) -> Option<f64> {
        if self.bytes_per_hour_std_dev == 0.0 {
            return None;
        }
        Some((value - self.bytes_per_hour_mean) / self.bytes_per_hour_std_dev)
    }

    /// Outside `threshold` standard deviations, or above twice the mean for
    /// a flat baseline
    pub fn is_anomalous(&self, value: f64, threshold: f64) -> bool {
        match self.z_score(value) {
            Some(z) => z.abs() > threshold,
            None => value > self.bytes_per_hour_mean * 2.0,
        }
    }
}

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Sample standard deviation (n - 1 divisor)
pub fn std_dev(values: &[f64], mean: f64) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let sum_sq: f64 = values.iter().map(|v| (v - mean).powi(2)).sum();
    (sum_sq / (values.len() - 1) as f64).sqrt()
}

/// Median of ascending-sorted values
fn median(sorted: &[f64]) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

/// Linear-interpolated percentile of ascending-sorted values
pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = p / 100.0 * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = lower + 1;
    if upper >= sorted.len() {
        return sorted[sorted.len() - 1];
    }
    sorted[lower] + (sorted[upper] - sorted[lower]) * (rank - lower as f64)
}

fn seasonal_means(values: &[f64], buckets: usize, bucket_of: impl Fn(usize) -> usize) -> Vec<f64> {
    let mut sums = vec![0.0; buckets];
    let mut counts = vec![0usize; buckets];
    for (i, v) in values.iter().enumerate() {
        let b = bucket_of(i);
        sums[b] += v;
        counts[b] += 1;
    }
    sums.iter()
        .zip(&counts)
        .map(|(sum, &count)| if count > 0 { sum / count as f64 } else { 0.0 })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(values: &[f64]) -> Option<Baseline> {
        let now = Utc::now();
        Baseline::from_hourly("prod/a→prod/b#pod_to_pod", values, now, now)
    }

    #[test]
    fn test_minimum_samples() {
        assert!(build(&[1.0; 23]).is_none());
        let baseline = build(&[1.0; 24]).unwrap();
        assert_eq!(baseline.sample_count, 24);
        assert_eq!(baseline.source_service, "prod/a");
        assert_eq!(baseline.transfer_type, "pod_to_pod");
    }

    #[test]
    fn test_statistics() {
        let values: Vec<f64> = (1..=24).map(|v| v as f64).collect();
        let baseline = build(&values).unwrap();

        assert_eq!(baseline.bytes_per_hour_mean, 12.5);
        assert_eq!(baseline.bytes_per_hour_median, 12.5);
        assert_eq!(baseline.bytes_per_hour_max, 24.0);
        // rank 0.95 * 23 = 21.85 between 22 and 23
        assert!((baseline.bytes_per_hour_p95 - 22.85).abs() < 1e-9);
        assert!((baseline.bytes_per_hour_std_dev - 50f64.sqrt()).abs() < 1e-9);
        assert_eq!(baseline.hourly_pattern.len(), 24);
        assert_eq!(baseline.hourly_pattern[3], 4.0);
        assert_eq!(baseline.daily_pattern.len(), 7);
        assert_eq!(baseline.daily_pattern[0], 12.5);
        assert_eq!(baseline.daily_pattern[1], 0.0);
    }

    #[test]
    fn test_patterns_average_across_days() {
        let mut values = vec![10.0; 24];
        values.extend(vec![30.0; 24]);
        let baseline = build(&values).unwrap();

        assert_eq!(baseline.hourly_pattern[5], 20.0);
        assert_eq!(baseline.daily_pattern[0], 10.0);
        assert_eq!(baseline.daily_pattern[1], 30.0);
    }

    #[test]
    fn test_is_anomalous() {
        let values: Vec<f64> = (0..24).map(|i| if i % 2 == 0 { 90.0 } else { 110.0 }).collect();
        let baseline = build(&values).unwrap();
        let sd = baseline.bytes_per_hour_std_dev;

        assert!(!baseline.is_anomalous(100.0 + 2.0 * sd, 3.0));
        assert!(baseline.is_anomalous(100.0 + 4.0 * sd, 3.0));
        assert!(baseline.is_anomalous(100.0 - 4.0 * sd, 3.0));

        let flat = build(&[100.0; 24]).unwrap();
        assert!(!flat.is_anomalous(200.0, 3.0));
        assert!(flat.is_anomalous(200.1, 3.0));
        assert!(!flat.is_anomalous(0.0, 3.0));
    }

    #[test]
    fn test_percentile_edges() {
        assert_eq!(percentile(&[], 50.0), 0.0);
        assert_eq!(percentile(&[7.0], 99.0), 7.0);
        assert_eq!(percentile(&[1.0, 2.0], 100.0), 2.0);
        assert_eq!(percentile(&[1.0, 3.0], 50.0), 2.0);
    }
}
