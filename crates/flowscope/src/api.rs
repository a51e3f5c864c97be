//! HTTP query surface, health checks and Prometheus metrics

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use flowscope_core::{
    anomaly::{Anomaly, Baseline, BaselineEngine},
    collector::{Analytics, IngestQueue},
    cost::{CostEngine, CostLedger, PricingRule},
    graph::{GraphSnapshot, TransferGraph},
    health::{ComponentStatus, HealthRegistry},
    models::{TransferEvent, TransferType},
    observability::PipelineMetrics,
    storage::{
        enrich_event, FlowQuery, FlowResult, FlowStore, IdentityResolver, StaticIdentityResolver,
    },
};
use prometheus::{Encoder, TextEncoder};
use chrono::{Duration, Utc};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

/// Default number of results for top-N queries
const DEFAULT_TOP_N: usize = 10;
/// Default hop limit for service subgraphs
const DEFAULT_DEPTH: usize = 2;
/// Stored flow query defaults
const DEFAULT_FLOW_HOURS: i64 = 24;
const DEFAULT_FLOW_LIMIT: usize = 100;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub health_registry: HealthRegistry,
    pub metrics: PipelineMetrics,
    pub queue: IngestQueue,
    pub store: Arc<dyn FlowStore>,
    pub resolver: Arc<dyn IdentityResolver>,
    pub graph: Arc<TransferGraph>,
    pub cost: Arc<CostEngine>,
    pub ledger: Arc<CostLedger>,
    pub baselines: Arc<BaselineEngine>,
}

impl AppState {
    pub fn new(
        health_registry: HealthRegistry,
        queue: IngestQueue,
        store: Arc<dyn FlowStore>,
        analytics: &Analytics,
        baselines: Arc<BaselineEngine>,
    ) -> Self {
        Self {
            health_registry,
            metrics: PipelineMetrics::new(),
            queue,
            store,
            resolver: Arc::new(StaticIdentityResolver::new()),
            graph: analytics.graph().clone(),
            cost: analytics.cost_engine().clone(),
            ledger: analytics.ledger().clone(),
            baselines,
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn IdentityResolver>) -> Self {
        self.resolver = resolver;
        self
    }
}

/// Errors surfaced to API clients
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("invalid request: {0}")]
    BadRequest(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

/// Health check response - returns 200 if healthy, 503 if unhealthy
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health_registry.health().await;

    let status_code = match health.status {
        ComponentStatus::Healthy => StatusCode::OK,
        ComponentStatus::Degraded => StatusCode::OK, // Still operational
        ComponentStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(health))
}

/// Readiness check response - returns 200 if ready, 503 if not ready
async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.health_registry.readiness().await;

    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(readiness))
}

/// Prometheus metrics endpoint
async fn metrics() -> Result<impl IntoResponse, ApiError> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    Ok((
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        buffer,
    ))
}

async fn ingest_events(
    State(state): State<Arc<AppState>>,
    Json(mut events): Json<Vec<TransferEvent>>,
) -> impl IntoResponse {
    for event in &mut events {
        enrich_event(event, state.resolver.as_ref());
    }
    let report = state.queue.ingest(events);
    if report.dropped > 0 {
        warn!(dropped = report.dropped, "Ingestion queue full");
    }
    (StatusCode::ACCEPTED, Json(report))
}

// Graph

#[derive(Debug, Deserialize)]
struct TopParams {
    n: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct DepthParams {
    depth: Option<usize>,
}

async fn graph_snapshot(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.graph.snapshot())
}

async fn graph_stats(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.graph.stats())
}

async fn service_graph(
    State(state): State<Arc<AppState>>,
    Path(service_id): Path<String>,
    Query(params): Query<DepthParams>,
) -> ApiResult<GraphSnapshot> {
    let service_id = service_id.trim_start_matches('/');
    if state.graph.node(service_id).is_none() {
        return Err(ApiError::NotFound(format!("service {}", service_id)));
    }
    let depth = params.depth.unwrap_or(DEFAULT_DEPTH);
    Ok(Json(state.graph.service_graph(service_id, depth)))
}

async fn top_talkers(
    State(state): State<Arc<AppState>>,
    Query(params): Query<TopParams>,
) -> impl IntoResponse {
    Json(state.graph.top_talkers(params.n.unwrap_or(DEFAULT_TOP_N)))
}

async fn top_edges(
    State(state): State<Arc<AppState>>,
    Query(params): Query<TopParams>,
) -> impl IntoResponse {
    Json(state.graph.top_edges(params.n.unwrap_or(DEFAULT_TOP_N)))
}

// Stored flows

#[derive(Debug, Default, Deserialize)]
struct FlowParams {
    src_namespace: Option<String>,
    src_service: Option<String>,
    dst_namespace: Option<String>,
    dst_service: Option<String>,
    transfer_type: Option<TransferType>,
    hours: Option<i64>,
    limit: Option<usize>,
}

async fn query_flows(
    State(state): State<Arc<AppState>>,
    Query(params): Query<FlowParams>,
) -> ApiResult<Vec<FlowResult>> {
    let hours = params.hours.unwrap_or(DEFAULT_FLOW_HOURS);
    if hours <= 0 {
        return Err(ApiError::BadRequest("hours must be positive".to_string()));
    }

    let end = Utc::now();
    let mut query = FlowQuery::new(
        end - Duration::hours(hours),
        end,
        params.limit.unwrap_or(DEFAULT_FLOW_LIMIT),
    );
    query.src_namespace = params.src_namespace;
    query.src_service = params.src_service;
    query.dst_namespace = params.dst_namespace;
    query.dst_service = params.dst_service;
    query.transfer_type = params.transfer_type;

    state
        .store
        .query_flows(&query)
        .await
        .map(Json)
        .map_err(|e| ApiError::Internal(e.to_string()))
}

async fn egress_flows(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.graph.egress_edges())
}

async fn cross_region_flows(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.graph.cross_region_edges())
}

// Costs

#[derive(Debug, Deserialize)]
struct AttributionParams {
    service: Option<String>,
}

async fn cost_summary(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.ledger.summary())
}

async fn cost_attribution(
    State(state): State<Arc<AppState>>,
    Query(params): Query<AttributionParams>,
) -> Result<Response, ApiError> {
    match params.service {
        Some(service) => state
            .ledger
            .attribution(&service)
            .map(|a| Json(a).into_response())
            .ok_or_else(|| ApiError::NotFound(format!("cost attribution for {}", service))),
        None => Ok(Json(state.ledger.attributions()).into_response()),
    }
}

async fn list_pricing_rules(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.cost.pricing_rules())
}

async fn add_pricing_rule(
    State(state): State<Arc<AppState>>,
    Json(rule): Json<PricingRule>,
) -> Result<impl IntoResponse, ApiError> {
    if rule.cost_per_gb < 0.0 || rule.free_tier_gb < 0.0 {
        return Err(ApiError::BadRequest(
            "prices and free tier must not be negative".to_string(),
        ));
    }
    if rule.tiers.iter().any(|t| t.cost_per_gb < 0.0 || t.threshold_gb <= 0.0) {
        return Err(ApiError::BadRequest(
            "tiers need a positive threshold and a non-negative price".to_string(),
        ));
    }

    info!(rule = %rule.name, category = %rule.category, "Pricing rule added");
    state.cost.add_pricing_rule(rule.clone());
    Ok((StatusCode::CREATED, Json(rule)))
}

// Anomalies

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct AcknowledgeRequest {
    acknowledged_by: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ResolveRequest {
    notes: String,
}

async fn list_anomalies(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.baselines.anomalies())
}

async fn active_anomalies(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.baselines.active_anomalies())
}

async fn anomaly_summary(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.baselines.anomaly_summary())
}

async fn get_anomaly(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Anomaly> {
    let id = parse_id(&id)?;
    state
        .baselines
        .anomaly(id)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("anomaly {}", id)))
}

async fn inject_anomaly(
    State(state): State<Arc<AppState>>,
    Json(anomaly): Json<Anomaly>,
) -> impl IntoResponse {
    info!(
        anomaly_id = %anomaly.id,
        anomaly_type = %anomaly.anomaly_type,
        "Anomaly injected"
    );
    state.metrics.inc_anomalies_detected(&anomaly);
    state.baselines.add_anomaly(anomaly.clone());
    (StatusCode::CREATED, Json(anomaly))
}

async fn acknowledge_anomaly(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Option<Json<AcknowledgeRequest>>,
) -> ApiResult<Anomaly> {
    let id = parse_id(&id)?;
    let Json(request) = body.unwrap_or_default();
    state
        .baselines
        .acknowledge(id, &request.acknowledged_by)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("anomaly {}", id)))
}

async fn resolve_anomaly(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Option<Json<ResolveRequest>>,
) -> ApiResult<Anomaly> {
    let id = parse_id(&id)?;
    let Json(request) = body.unwrap_or_default();
    state
        .baselines
        .resolve(id, &request.notes)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("anomaly {}", id)))
}

fn parse_id(id: &str) -> Result<Uuid, ApiError> {
    // A malformed id cannot name a recorded anomaly
    Uuid::parse_str(id).map_err(|_| ApiError::NotFound(format!("anomaly {}", id)))
}

// Baselines

async fn list_baselines(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let baselines: Vec<Baseline> = state
        .baselines
        .baselines()
        .iter()
        .map(|b| b.as_ref().clone())
        .collect();
    Json(baselines)
}

async fn get_baseline(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> ApiResult<Baseline> {
    let key = key.trim_start_matches('/');
    state
        .baselines
        .baseline(key)
        .map(|b| Json(b.as_ref().clone()))
        .ok_or_else(|| ApiError::NotFound(format!("baseline {}", key)))
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .route("/events", post(ingest_events))
        .route("/graph", get(graph_snapshot))
        .route("/graph/stats", get(graph_stats))
        .route("/graph/service/*id", get(service_graph))
        .route("/graph/top-talkers", get(top_talkers))
        .route("/graph/top-edges", get(top_edges))
        .route("/flows", get(query_flows))
        .route("/flows/egress", get(egress_flows))
        .route("/flows/cross-region", get(cross_region_flows))
        .route("/costs/summary", get(cost_summary))
        .route("/costs/attribution", get(cost_attribution))
        .route("/pricing-rules", get(list_pricing_rules).post(add_pricing_rule))
        .route("/anomalies", get(list_anomalies).post(inject_anomaly))
        .route("/anomalies/active", get(active_anomalies))
        .route("/anomalies/summary", get(anomaly_summary))
        .route("/anomalies/:id", get(get_anomaly))
        .route("/anomalies/:id/acknowledge", post(acknowledge_anomaly))
        .route("/anomalies/:id/resolve", post(resolve_anomaly))
        .route("/baselines", get(list_baselines))
        .route("/baselines/*key", get(get_baseline));

    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .nest("/api/v1", api)
        .with_state(state)
}

/// Start the API server
pub async fn serve(
    port: u16,
    state: Arc<AppState>,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    let app = create_router(state);

    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await?;

    Ok(())
}
