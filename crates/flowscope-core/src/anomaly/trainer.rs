//! Baseline training from stored flows

use super::BaselineEngine;
use crate::models::FlowKey;
use crate::storage::{FlowQuery, FlowResult, FlowStore};
use anyhow::{Context, Result};
use chrono::{DateTime, Duration, DurationRound, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Maximum aggregated rows read per hour
const HOURLY_QUERY_LIMIT: usize = 100_000;

/// Outcome of a training run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrainingReport {
    pub keys_seen: usize,
    pub baselines_built: usize,
}

/// Builds baselines for every flow key seen in a lookback window
pub struct BaselineTrainer {
    engine: Arc<BaselineEngine>,
}

impl BaselineTrainer {
    pub fn new(engine: Arc<BaselineEngine>) -> Self {
        Self { engine }
    }

    /// Query the store hour by hour over the `lookback_hours` ending at
    /// `end` (truncated to the hour) and build one baseline per key
    ///
    /// Hours without traffic for a key count as zero. Rows without a source
    /// service never form a key.
    pub async fn train(
        &self,
        store: &dyn FlowStore,
        end: DateTime<Utc>,
        lookback_hours: u32,
    ) -> Result<TrainingReport> {
        let end = end.duration_trunc(Duration::hours(1)).unwrap_or(end);
        let hours = lookback_hours as usize;
        let start = end - Duration::hours(lookback_hours as i64);

        let mut series: HashMap<String, Vec<f64>> = HashMap::new();
        for hour in 0..hours {
            let from = start + Duration::hours(hour as i64);
            let rows = store
                .query_flows(&FlowQuery::new(from, from + Duration::hours(1), HOURLY_QUERY_LIMIT))
                .await
                .with_context(|| format!("Failed to query flows for hour starting {}", from))?;

            for row in rows.iter().filter(|r| r.has_source()) {
                let values = series
                    .entry(flow_key_of(row).to_string())
                    .or_insert_with(|| vec![0.0; hours]);
                values[hour] += row.total_bytes as f64;
            }
        }

        let mut report = TrainingReport {
            keys_seen: series.len(),
            baselines_built: 0,
        };
        for (key, values) in &series {
            if self.engine.build_baseline(key, values, start, end).is_some() {
                report.baselines_built += 1;
            }
        }

        debug!(
            keys = report.keys_seen,
            built = report.baselines_built,
            lookback_hours = lookback_hours,
            "Baseline training pass complete"
        );
        Ok(report)
    }
}

/// Flow key of an aggregated row, matching `TransferFlow::flow_key`
pub fn flow_key_of(row: &FlowResult) -> FlowKey {
    let source = format!("{}/{}", row.src_namespace, row.src_service);
    let destination = if !row.dst_service.is_empty() {
        format!("{}/{}", row.dst_namespace, row.dst_service)
    } else if !row.dst_external.is_empty() {
        row.dst_external.clone()
    } else {
        "unknown".to_string()
    };
    FlowKey::new(source, destination, row.transfer_type)
}
