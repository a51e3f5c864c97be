//! Service configuration
//!
//! Values come from an optional file named by `FLOWSCOPE_CONFIG`, overridden
//! by `FLOWSCOPE_*` environment variables. Every field has a default.

use anyhow::{Context, Result};
use config::builder::DefaultState;
use config::ConfigBuilder;
use flowscope_core::anomaly::{DetectionConfig, LeakDetector};
use flowscope_core::collector::CollectorConfig;
use flowscope_core::models::ServiceIdentity;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable naming the configuration file
pub const CONFIG_PATH_ENV: &str = "FLOWSCOPE_CONFIG";

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Instance name used in structured logs
    #[serde(default = "default_instance_name")]
    pub instance_name: String,

    /// Port of the query, health and metrics API
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,

    /// Z-score beyond which a rate is anomalous
    #[serde(default = "default_anomaly_threshold")]
    pub anomaly_threshold: f64,

    #[serde(default = "default_detection_interval")]
    pub detection_interval_secs: u64,

    #[serde(default = "default_dedup_window")]
    pub dedup_window_secs: u64,

    /// History used to train baselines at startup
    #[serde(default = "default_baseline_lookback")]
    pub baseline_lookback_hours: u32,

    /// Stored history replayed into the graph at startup
    #[serde(default = "default_replay_hours")]
    pub replay_hours: u32,

    /// JSON-lines event file; in-memory storage when unset
    #[serde(default)]
    pub storage_path: Option<PathBuf>,

    /// Static IP to workload mappings used to enrich events
    #[serde(default)]
    pub identities: Vec<IdentityMapping>,
}

/// One entry of the static identity table
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct IdentityMapping {
    pub ip: String,
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub availability_zone: String,
}

impl IdentityMapping {
    pub fn identity(&self) -> ServiceIdentity {
        let mut identity = ServiceIdentity::new(&self.namespace, &self.name);
        identity.region = self.region.clone();
        identity.availability_zone = self.availability_zone.clone();
        identity
    }
}

fn default_instance_name() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "flowscope".to_string())
}

fn default_api_port() -> u16 {
    8080
}

fn default_queue_capacity() -> usize {
    100_000
}

fn default_batch_size() -> usize {
    10_000
}

fn default_flush_interval_ms() -> u64 {
    5_000
}

fn default_anomaly_threshold() -> f64 {
    3.0
}

fn default_detection_interval() -> u64 {
    300
}

fn default_dedup_window() -> u64 {
    3600
}

fn default_baseline_lookback() -> u32 {
    168
}

fn default_replay_hours() -> u32 {
    24
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            instance_name: default_instance_name(),
            api_port: default_api_port(),
            queue_capacity: default_queue_capacity(),
            batch_size: default_batch_size(),
            flush_interval_ms: default_flush_interval_ms(),
            anomaly_threshold: default_anomaly_threshold(),
            detection_interval_secs: default_detection_interval(),
            dedup_window_secs: default_dedup_window(),
            baseline_lookback_hours: default_baseline_lookback(),
            replay_hours: default_replay_hours(),
            storage_path: None,
            identities: Vec::new(),
        }
    }
}

impl ServiceConfig {
    /// Load configuration from the config file and environment
    pub fn load() -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
            builder = builder.add_source(config::File::with_name(&path));
        }
        builder = builder.add_source(config::Environment::with_prefix("FLOWSCOPE").try_parsing(true));
        Self::from_builder(builder)
    }

    pub fn from_builder(builder: ConfigBuilder<DefaultState>) -> Result<Self> {
        let config = builder.build().context("Failed to read configuration")?;
        let config: Self = config
            .try_deserialize()
            .context("Invalid configuration")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            anyhow::bail!("queue_capacity must be greater than zero");
        }
        if self.batch_size == 0 {
            anyhow::bail!("batch_size must be greater than zero");
        }
        if self.flush_interval_ms == 0 {
            anyhow::bail!("flush_interval_ms must be greater than zero");
        }
        if self.detection_interval_secs == 0 {
            anyhow::bail!("detection_interval_secs must be greater than zero");
        }
        Ok(())
    }

    pub fn collector_config(&self) -> CollectorConfig {
        CollectorConfig {
            queue_capacity: self.queue_capacity,
            batch_size: self.batch_size,
            flush_interval: Duration::from_millis(self.flush_interval_ms),
        }
    }

    pub fn detection_config(&self) -> DetectionConfig {
        DetectionConfig {
            interval: Duration::from_secs(self.detection_interval_secs),
            dedup_window: Duration::from_secs(self.dedup_window_secs),
            leak_detector: LeakDetector::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_without_sources() {
        let config = ServiceConfig::from_builder(config::Config::builder()).unwrap();

        assert_eq!(config.api_port, 8080);
        assert_eq!(config.queue_capacity, 100_000);
        assert_eq!(config.batch_size, 10_000);
        assert_eq!(config.flush_interval_ms, 5_000);
        assert_eq!(config.anomaly_threshold, 3.0);
        assert_eq!(config.detection_interval_secs, 300);
        assert_eq!(config.dedup_window_secs, 3600);
        assert_eq!(config.baseline_lookback_hours, 168);
        assert_eq!(config.replay_hours, 24);
        assert!(config.storage_path.is_none());
    }

    #[test]
    fn test_overrides() {
        let builder = config::Config::builder()
            .set_override("api_port", 9090)
            .unwrap()
            .set_override("batch_size", 500)
            .unwrap();
        let config = ServiceConfig::from_builder(builder).unwrap();

        assert_eq!(config.api_port, 9090);
        assert_eq!(config.batch_size, 500);
        assert_eq!(config.collector_config().batch_size, 500);
    }

    #[test]
    fn test_file_source() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "storage_path = \"/var/lib/flowscope/events.jsonl\"\nanomaly_threshold = 2.5\n\n[[identities]]\nip = \"10.0.0.5\"\nnamespace = \"prod\"\nname = \"orders\"\nregion = \"us-east-1\""
        )
        .unwrap();

        let builder = config::Config::builder().add_source(config::File::from(file.path()));
        let config = ServiceConfig::from_builder(builder).unwrap();

        assert_eq!(
            config.storage_path,
            Some(PathBuf::from("/var/lib/flowscope/events.jsonl"))
        );
        assert_eq!(config.anomaly_threshold, 2.5);
        assert_eq!(config.identities.len(), 1);
        let identity = config.identities[0].identity();
        assert_eq!(identity.full_name(), "prod/orders");
        assert_eq!(identity.region, "us-east-1");
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let builder = config::Config::builder()
            .set_override("batch_size", 0)
            .unwrap();
        assert!(ServiceConfig::from_builder(builder).is_err());
    }
}
