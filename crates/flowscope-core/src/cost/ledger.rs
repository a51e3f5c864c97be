//! Running cost totals across batches

use super::engine::{summarize, CostAttribution, CostSummary};
use parking_lot::RwLock;
use std::collections::HashMap;

#[derive(Debug, Default)]
struct LedgerInner {
    attributions: Vec<CostAttribution>,
    index: HashMap<String, usize>,
}

/// Accumulates attributions per service as batches are priced
///
/// Breakdowns are merged per `(category, destination)` so that a service's
/// breakdown list stays bounded by its distinct destinations.
#[derive(Debug, Default)]
pub struct CostLedger {
    inner: RwLock<LedgerInner>,
}

impl CostLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, batch: &[CostAttribution]) {
        let mut inner = self.inner.write();

        for attribution in batch {
            let key = attribution.full_name();
            match inner.index.get(&key).copied() {
                Some(slot) => merge(&mut inner.attributions[slot], attribution),
                None => {
                    let mut fresh = attribution.clone();
                    fresh.breakdown.clear();
                    fresh.total_bytes = 0;
                    fresh.total_cost_usd = 0.0;
                    merge(&mut fresh, attribution);
                    inner.attributions.push(fresh);
                    let slot = inner.attributions.len() - 1;
                    inner.index.insert(key, slot);
                }
            }
        }
    }

    /// Accumulated attributions in first-seen order
    pub fn attributions(&self) -> Vec<CostAttribution> {
        self.inner.read().attributions.clone()
    }

    pub fn attribution(&self, service: &str) -> Option<CostAttribution> {
        let inner = self.inner.read();
        inner
            .index
            .get(service)
            .map(|&slot| inner.attributions[slot].clone())
    }

    pub fn summary(&self) -> CostSummary {
        summarize(&self.inner.read().attributions)
    }

    pub fn len(&self) -> usize {
        self.inner.read().attributions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn merge(into: &mut CostAttribution, from: &CostAttribution) {
    into.total_bytes += from.total_bytes;
    into.total_cost_usd += from.total_cost_usd;
    into.period_start = into.period_start.min(from.period_start);
    into.period_end = into.period_end.max(from.period_end);

    for b in &from.breakdown {
        let existing = into.breakdown.iter_mut().find(|e| {
            e.category == b.category && e.destination_service == b.destination_service
        });
        match existing {
            Some(e) => {
                e.bytes_transferred += b.bytes_transferred;
                e.cost_usd += b.cost_usd;
                e.flow_id = None;
            }
            None => {
                let mut entry = b.clone();
                entry.flow_id = None;
                into.breakdown.push(entry);
            }
        }
    }
}
