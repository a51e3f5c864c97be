//! Event to flow aggregation
//!
//! A batch of raw events becomes one flow per
//! `(source, destination, transfer type)` triple, in first-seen order.

use crate::anomaly::percentile;
use crate::models::{ServiceIdentity, TransferEvent, TransferFlow, TransferType};
use chrono::Duration;
use std::collections::HashMap;

/// Result of aggregating one batch
#[derive(Debug, Default)]
pub struct Aggregation {
    pub flows: Vec<TransferFlow>,
    /// Events dropped for lack of a resolved source identity
    pub skipped: usize,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct FlowAggregator;

impl FlowAggregator {
    pub fn new() -> Self {
        Self
    }

    pub fn aggregate(&self, events: &[TransferEvent]) -> Aggregation {
        let mut builders: Vec<FlowBuilder> = Vec::new();
        let mut index: HashMap<(String, String, TransferType), usize> = HashMap::new();
        let mut skipped = 0;

        for event in events {
            let Some(ref source) = event.source.identity else {
                skipped += 1;
                continue;
            };

            let transfer_type = event.effective_transfer_type();
            let destination = match event.destination.identity {
                Some(ref identity) => identity.full_name(),
                None => event.destination.ip.clone(),
            };

            let slot = *index
                .entry((source.full_name(), destination, transfer_type))
                .or_insert_with(|| {
                    builders.push(FlowBuilder::start(source, event, transfer_type));
                    builders.len() - 1
                });
            builders[slot].add(event);
        }

        Aggregation {
            flows: builders.into_iter().map(FlowBuilder::finish).collect(),
            skipped,
        }
    }
}

struct FlowBuilder {
    flow: TransferFlow,
    rates: Vec<f64>,
}

impl FlowBuilder {
    fn start(source: &ServiceIdentity, first: &TransferEvent, transfer_type: TransferType) -> Self {
        let mut flow = TransferFlow::new(
            source.clone(),
            transfer_type,
            0,
            first.timestamp,
            first.timestamp,
        );
        flow.event_count = 0;
        flow = match first.destination.identity {
            Some(ref identity) => flow.to_service(identity.clone()),
            None => flow.to_endpoint(first.destination.clone()),
        };
        Self {
            flow,
            rates: Vec::new(),
        }
    }

    fn add(&mut self, event: &TransferEvent) {
        let bytes = event.total_bytes();
        let flow = &mut self.flow;
        flow.total_bytes += bytes;
        flow.total_packets += event.total_packets();
        flow.event_count += 1;

        let duration = Duration::nanoseconds(event.duration_ns.min(i64::MAX as u64) as i64);
        let ended = event.timestamp + duration;
        if event.timestamp < flow.window_start {
            flow.window_start = event.timestamp;
        }
        if ended > flow.window_end {
            flow.window_end = ended;
        }

        if event.duration_ns > 0 {
            self.rates.push(bytes as f64 / (event.duration_ns as f64 / 1e9));
        }
        if let Some(ref path) = event.http_path {
            *flow.by_http_path.entry(path.clone()).or_default() += bytes;
        }
        if let Some(ref method) = event.grpc_method {
            *flow.by_grpc_method.entry(method.clone()).or_default() += bytes;
        }
    }

    fn finish(mut self) -> TransferFlow {
        let window = self.flow.duration_seconds();
        if window > 0.0 {
            self.flow.bytes_per_second_avg = self.flow.total_bytes as f64 / window;
        }
        self.rates.sort_by(|a, b| a.total_cmp(b));
        self.flow.bytes_per_second_max = self.rates.last().copied().unwrap_or(0.0);
        self.flow.bytes_per_second_p99 = percentile(&self.rates, 99.0);
        self.flow
    }
}
