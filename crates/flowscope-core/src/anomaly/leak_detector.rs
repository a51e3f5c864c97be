//! Egress leak detection
//!
//! A leak is a transfer rate that keeps climbing: a positive linear
//! regression slope over the recent rate history combined with an almost
//! monotonic sequence of samples.

use super::types::{Anomaly, AnomalyType, Severity};
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Minimum samples required for leak detection
const MIN_SAMPLES_FOR_DETECTION: usize = 6;

/// Fraction of consecutive samples that must not decrease
const MONOTONICITY_THRESHOLD: f64 = 0.9;

/// Detects steadily growing transfer rates
#[derive(Debug, Clone)]
pub struct LeakDetector {
    /// History considered, counted back from the newest sample
    pub window_size: Duration,
    /// Minimum growth, in bytes/hour gained per hour
    pub slope_threshold: f64,
}

impl LeakDetector {
    pub fn new(window_size: Duration, slope_threshold: f64) -> Self {
        Self {
            window_size,
            slope_threshold,
        }
    }

    /// Look for a leak in `(unix_secs, bytes_per_hour)` samples sorted by time
    pub fn detect(&self, samples: &[(i64, f64)]) -> Option<LeakTrend> {
        let window = self.filter_window(samples);
        if window.len() < MIN_SAMPLES_FOR_DETECTION {
            return None;
        }

        let (slope, intercept) = linear_fit(&window)?;
        if slope <= self.slope_threshold {
            return None;
        }

        let monotonicity = monotonicity(&window);
        if monotonicity < MONOTONICITY_THRESHOLD {
            return None;
        }

        let confidence = r_squared(&window, slope, intercept) * monotonicity;
        Some(LeakTrend {
            slope_per_hour: slope,
            confidence,
            current_rate: window.last().map(|&(_, r)| r).unwrap_or(0.0),
            first_rate: window.first().map(|&(_, r)| r).unwrap_or(0.0),
            samples_analyzed: window.len(),
        })
    }

    fn filter_window(&self, samples: &[(i64, f64)]) -> Vec<(f64, f64)> {
        let Some(&(latest, _)) = samples.last() else {
            return Vec::new();
        };
        let window_start = latest - self.window_size.as_secs() as i64;
        let t0 = samples
            .iter()
            .find(|(ts, _)| *ts >= window_start)
            .map_or(latest, |&(ts, _)| ts);

        samples
            .iter()
            .filter(|(ts, _)| *ts >= window_start)
            .map(|&(ts, rate)| ((ts - t0) as f64 / 3600.0, rate))
            .collect()
    }
}

impl Default for LeakDetector {
    fn default() -> Self {
        Self {
            window_size: Duration::from_secs(12 * 3600),
            slope_threshold: 1024.0 * 1024.0,
        }
    }
}

/// Least-squares slope and intercept over `(hours, rate)` points
fn linear_fit(points: &[(f64, f64)]) -> Option<(f64, f64)> {
    let n = points.len() as f64;
    if n < 2.0 {
        return None;
    }

    let (mut sum_x, mut sum_y, mut sum_xy, mut sum_xx) = (0.0, 0.0, 0.0, 0.0);
    for &(x, y) in points {
        sum_x += x;
        sum_y += y;
        sum_xy += x * y;
        sum_xx += x * x;
    }

    let denominator = n * sum_xx - sum_x * sum_x;
    if denominator.abs() < f64::EPSILON {
        return None;
    }
    let slope = (n * sum_xy - sum_x * sum_y) / denominator;
    let intercept = (sum_y - slope * sum_x) / n;
    Some((slope, intercept))
}

fn r_squared(points: &[(f64, f64)], slope: f64, intercept: f64) -> f64 {
    let mean_y = points.iter().map(|&(_, y)| y).sum::<f64>() / points.len() as f64;
    let (mut ss_res, mut ss_tot) = (0.0, 0.0);
    for &(x, y) in points {
        ss_res += (y - (slope * x + intercept)).powi(2);
        ss_tot += (y - mean_y).powi(2);
    }
    if ss_tot.abs() < f64::EPSILON {
        return 0.0;
    }
    1.0 - ss_res / ss_tot
}

fn monotonicity(points: &[(f64, f64)]) -> f64 {
    if points.len() < 2 {
        return 0.0;
    }
    let rising = points.windows(2).filter(|w| w[1].1 >= w[0].1).count();
    rising as f64 / (points.len() - 1) as f64
}

/// A steadily rising transfer rate
#[derive(Debug, Clone)]
pub struct LeakTrend {
    /// Growth of the hourly rate per hour
    pub slope_per_hour: f64,
    /// 0.0-1.0 from fit quality and monotonicity
    pub confidence: f64,
    pub current_rate: f64,
    pub first_rate: f64,
    pub samples_analyzed: usize,
}

impl LeakTrend {
    pub fn growth_mb_per_hour(&self) -> f64 {
        self.slope_per_hour / (1024.0 * 1024.0)
    }

    /// Leak anomaly for `flow_key`
    pub fn to_anomaly(&self, flow_key: &str, now: DateTime<Utc>) -> Anomaly {
        let severity = if self.confidence > 0.9 {
            Severity::High
        } else {
            Severity::Medium
        };
        let mut anomaly = Anomaly::new(AnomalyType::Leak, severity, flow_key, now);
        anomaly.current_value = self.current_rate;
        anomaly.baseline_value = self.first_rate;
        anomaly.absolute_delta = self.current_rate - self.first_rate;
        anomaly
            .labels
            .insert("growth_mb_per_hour".to_string(), format!("{:.2}", self.growth_mb_per_hour()));
        anomaly
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MB: f64 = 1024.0 * 1024.0;

    fn hourly(rates: impl Iterator<Item = f64>) -> Vec<(i64, f64)> {
        rates.enumerate().map(|(i, r)| (i as i64 * 3600, r)).collect()
    }

    #[test]
    fn test_flat_rate_is_not_a_leak() {
        let detector = LeakDetector::default();
        let samples = hourly((0..12).map(|_| 100.0 * MB));
        assert!(detector.detect(&samples).is_none());
    }

    #[test]
    fn test_detect_steady_growth() {
        let detector = LeakDetector::default();
        let samples = hourly((0..12).map(|i| 100.0 * MB + i as f64 * 10.0 * MB));

        let trend = detector.detect(&samples).unwrap();
        assert!((trend.slope_per_hour - 10.0 * MB).abs() < 1.0);
        assert!(trend.confidence > 0.99);
        assert_eq!(trend.samples_analyzed, 12);

        let anomaly = trend.to_anomaly("prod/a→52.1.1.1#egress", Utc::now());
        assert_eq!(anomaly.anomaly_type, AnomalyType::Leak);
        assert_eq!(anomaly.severity, Severity::High);
        assert!((anomaly.absolute_delta - 110.0 * MB).abs() < 1.0);
    }

    #[test]
    fn test_insufficient_samples() {
        let detector = LeakDetector::default();
        let samples = hourly((0..4).map(|i| i as f64 * 100.0 * MB));
        assert!(detector.detect(&samples).is_none());
    }

    #[test]
    fn test_oscillating_rate_rejected() {
        let detector = LeakDetector::default();
        let samples = hourly((0..12).map(|i| {
            let base = i as f64 * 5.0 * MB;
            if i % 2 == 0 { base + 50.0 * MB } else { base }
        }));
        assert!(detector.detect(&samples).is_none());
    }

    #[test]
    fn test_old_samples_fall_outside_window() {
        let detector = LeakDetector::new(Duration::from_secs(3 * 3600), MB);
        let samples = hourly((0..12).map(|i| i as f64 * 10.0 * MB));
        assert!(detector.detect(&samples).is_none());
    }
}
