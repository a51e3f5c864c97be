//! Behavioral baselines and anomaly detection for transfer flows
//!
//! This module provides:
//! - Hourly baselines per flow key (mean, spread, percentiles, seasonality)
//! - Z-score detection of spikes, slow burns and new endpoints
//! - Leak detection (steadily rising egress rates)
//! - The anomaly lifecycle (active, acknowledged, resolved)

mod baseline;
mod dedup;
mod detection;
mod engine;
mod leak_detector;
mod rates;
mod trainer;
mod types;

pub use baseline::{mean, percentile, std_dev, Baseline, MIN_BASELINE_SAMPLES};
pub use dedup::AnomalyDeduplicator;
pub use detection::{DetectionConfig, DetectionLoop};
pub use engine::{BaselineEngine, DEFAULT_THRESHOLD_STD_DEV};
pub use leak_detector::{LeakDetector, LeakTrend};
pub use rates::RateTracker;
pub use trainer::{flow_key_of, BaselineTrainer, TrainingReport};
pub use types::{Anomaly, AnomalySummary, AnomalyType, Severity};
