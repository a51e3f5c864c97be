//! FlowScope - network transfer analytics service
//!
//! Ingests transfer events, maintains the service transfer graph, prices
//! traffic and flags anomalous flows.

use anyhow::Result;
use chrono::{Duration, Utc};
use flowscope::{api, config::ServiceConfig};
use flowscope_core::{
    anomaly::{BaselineEngine, BaselineTrainer, DetectionLoop, RateTracker},
    collector::{Analytics, CollectorBuilder},
    cost::{CostEngine, CostLedger},
    graph::GraphEngine,
    health::{components, HealthRegistry},
    observability::{PipelineMetrics, StructuredLogger},
    storage::{FlowStore, JsonlStore, MemoryStore, StaticIdentityResolver},
};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const SERVICE_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting flowscope");

    let config = ServiceConfig::load()?;
    info!(
        instance = %config.instance_name,
        api_port = config.api_port,
        storage = ?config.storage_path,
        "FlowScope configured"
    );

    let health_registry = HealthRegistry::new();
    health_registry.register_all().await;

    let metrics = PipelineMetrics::new();
    let logger = StructuredLogger::new(&config.instance_name);

    let store: Arc<dyn FlowStore> = match config.storage_path {
        Some(ref path) => Arc::new(JsonlStore::open(path).await?),
        None => Arc::new(MemoryStore::new()),
    };

    let resolver = Arc::new(StaticIdentityResolver::new());
    for mapping in &config.identities {
        resolver.insert(mapping.ip.clone(), mapping.identity());
    }

    let graph_engine = GraphEngine::new();
    let analytics = Arc::new(Analytics::new(
        graph_engine.graph(),
        Arc::new(CostEngine::new()),
        Arc::new(CostLedger::new()),
        Arc::new(RateTracker::new()),
    ));
    let baselines = Arc::new(BaselineEngine::new(config.anomaly_threshold));

    // Rebuild state from stored history before accepting traffic
    let now = Utc::now();
    let replay_start = now - Duration::hours(config.replay_hours as i64);
    if let Err(e) = graph_engine
        .load_from_storage(store.as_ref(), replay_start, now)
        .await
    {
        warn!(error = %e, "Graph replay failed, starting with an empty graph");
        health_registry
            .set_degraded(components::GRAPH, "Replay from storage failed")
            .await;
    }

    match BaselineTrainer::new(baselines.clone())
        .train(store.as_ref(), now, config.baseline_lookback_hours)
        .await
    {
        Ok(report) => {
            logger.log_baselines_trained(
                report.baselines_built,
                report.keys_seen,
                config.baseline_lookback_hours,
            );
            metrics.set_baselines(baselines.baselines().len());
        }
        Err(e) => {
            warn!(error = %e, "Baseline training failed, detecting new endpoints only");
            health_registry
                .set_degraded(components::DETECTOR, "Baseline training failed")
                .await;
        }
    }

    let (queue, worker) = CollectorBuilder::new()
        .store(store.clone())
        .sink(analytics.clone())
        .health(health_registry.clone())
        .config(config.collector_config())
        .build()?;

    let detection = DetectionLoop::new(
        baselines.clone(),
        analytics.rates().clone(),
        config.detection_config(),
    )
    .with_health(health_registry.clone())
    .with_logger(logger.clone());

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let worker_handle = tokio::spawn(worker.run(shutdown_tx.subscribe()));
    let detection_handle = tokio::spawn(detection.run(shutdown_tx.subscribe()));

    let app_state = Arc::new(
        api::AppState::new(
            health_registry.clone(),
            queue,
            store.clone(),
            &analytics,
            baselines,
        )
        .with_resolver(resolver),
    );

    health_registry.set_ready(true).await;
    logger.log_startup(SERVICE_VERSION, config.api_port);

    let api_handle = tokio::spawn(api::serve(
        config.api_port,
        app_state,
        shutdown_tx.subscribe(),
    ));

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    logger.log_shutdown("SIGINT received");
    health_registry.set_ready(false).await;

    let _ = shutdown_tx.send(());
    if let Err(e) = worker_handle.await {
        warn!(error = %e, "Batch worker task failed");
    }
    if let Err(e) = detection_handle.await {
        warn!(error = %e, "Detection task failed");
    }
    match api_handle.await {
        Ok(Err(e)) => warn!(error = %e, "API server stopped with error"),
        Err(e) => warn!(error = %e, "API server task failed"),
        Ok(Ok(())) => {}
    }

    info!("Shutdown complete");
    Ok(())
}
