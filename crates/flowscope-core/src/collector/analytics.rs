//! Flow sink feeding the graph, cost and rate tracking

use super::FlowSink;
use crate::anomaly::RateTracker;
use crate::cost::{CostEngine, CostLedger};
use crate::graph::TransferGraph;
use crate::models::TransferFlow;
use crate::observability::PipelineMetrics;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// The sink the batch worker normally feeds
///
/// Each batch is priced once; the per-flow costs land on the graph edges and
/// the per-service attributions in the ledger.
#[derive(Clone)]
pub struct Analytics {
    graph: Arc<TransferGraph>,
    cost: Arc<CostEngine>,
    ledger: Arc<CostLedger>,
    rates: Arc<RateTracker>,
    metrics: PipelineMetrics,
}

impl Analytics {
    pub fn new(
        graph: Arc<TransferGraph>,
        cost: Arc<CostEngine>,
        ledger: Arc<CostLedger>,
        rates: Arc<RateTracker>,
    ) -> Self {
        Self {
            graph,
            cost,
            ledger,
            rates,
            metrics: PipelineMetrics::new(),
        }
    }

    pub fn graph(&self) -> &Arc<TransferGraph> {
        &self.graph
    }

    pub fn cost_engine(&self) -> &Arc<CostEngine> {
        &self.cost
    }

    pub fn ledger(&self) -> &Arc<CostLedger> {
        &self.ledger
    }

    pub fn rates(&self) -> &Arc<RateTracker> {
        &self.rates
    }

    pub fn process(&self, flows: &[TransferFlow]) {
        let (Some(start), Some(end)) = (
            flows.iter().map(|f| f.window_start).min(),
            flows.iter().map(|f| f.window_end).max(),
        ) else {
            return;
        };

        let attributions = self.cost.calculate_attribution(flows, start, end);
        let costs: HashMap<_, f64> = attributions
            .iter()
            .flat_map(|a| a.breakdown.iter())
            .filter_map(|b| b.flow_id.map(|id| (id, b.cost_usd)))
            .collect();

        for flow in flows {
            let cost = costs.get(&flow.id).copied().unwrap_or(0.0);
            self.graph.add_flow_with_cost(flow, cost);
            self.rates.record(flow);
        }
        self.ledger.record(&attributions);

        let stats = self.graph.stats();
        self.metrics.set_graph_size(stats.all_nodes(), stats.total_edges);
        debug!(
            flows = flows.len(),
            services = attributions.len(),
            nodes = stats.all_nodes(),
            edges = stats.total_edges,
            "Flows applied to analytics"
        );
    }
}

#[async_trait]
impl FlowSink for Analytics {
    async fn accept(&self, flows: &[TransferFlow]) {
        self.process(flows);
    }
}
