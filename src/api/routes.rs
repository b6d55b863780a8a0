//! API route definitions and handlers.

use std::collections::BTreeMap;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{Duration, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::error;

use crate::analysis::{health_score, health_status, Severity};
use crate::api::state::AppState;
use crate::rca::{IncidentFilter, IncidentStatus, RegistryError};

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(endpoint_metrics))
        .route("/incidents", get(list_incidents))
        .route("/incidents/:id", get(get_incident))
        .route("/incidents/:id/acknowledge", post(acknowledge_incident))
        .route("/incidents/:id/resolve", post(resolve_incident))
        .route("/analyze", post(trigger_analysis))
        .route(
            "/injections",
            get(injection_status)
                .post(set_injection)
                .delete(clear_injection),
        )
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Structured error response: input errors surface to the caller, internal
/// errors are logged and reported opaquely.
enum ApiError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    Internal(anyhow::Error),
}

impl From<RegistryError> for ApiError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::NotFound(_) => ApiError::NotFound(e.to_string()),
            RegistryError::AlreadyResolved { .. } => ApiError::Conflict(e.to_string()),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        ApiError::Internal(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
            ApiError::NotFound(m) => (StatusCode::NOT_FOUND, m),
            ApiError::Conflict(m) => (StatusCode::CONFLICT, m),
            ApiError::Internal(e) => {
                error!(error = %e, "internal error serving request");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

fn envelope(data: Value) -> Json<Value> {
    Json(json!({
        "data": data,
        "meta": { "timestamp": Utc::now().to_rfc3339() }
    }))
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

async fn health(State(state): State<AppState>) -> Json<Value> {
    let storage = state.engine.storage_health();
    let status = if storage.degraded { "degraded" } else { "ok" };
    envelope(json!({
        "status": status,
        "version": env!("CARGO_PKG_VERSION"),
        "storage": storage,
        "active_incidents": state.engine.registry().active_count(),
    }))
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct MetricsQuery {
    /// Aggregation window in minutes; defaults to the baseline window.
    window_minutes: Option<i64>,
}

async fn endpoint_metrics(
    State(state): State<AppState>,
    Query(params): Query<MetricsQuery>,
) -> Result<Json<Value>, ApiError> {
    let window = params.window_minutes.unwrap_or(60);
    if window <= 0 {
        return Err(ApiError::BadRequest(
            "window_minutes must be positive".to_string(),
        ));
    }

    let engine = state.engine.clone();
    let metrics = tokio::task::spawn_blocking(move || -> anyhow::Result<Value> {
        let now = Utc::now();
        let since = now - Duration::minutes(window);
        let baselines = engine.baselines();

        let mut out = BTreeMap::new();
        for endpoint in engine.store().distinct_endpoints(since)? {
            let agg = engine.store().aggregate(&endpoint, since, now)?;
            let baseline = baselines.get(&endpoint).map(|b| b.latency_ms);
            let score = health_score(agg.error_rate(), agg.avg_latency_ms, baseline);
            out.insert(
                endpoint,
                json!({
                    "request_count": agg.count,
                    "avg_latency_ms": agg.avg_latency_ms,
                    "error_rate": agg.error_rate(),
                    "baseline_latency_ms": baseline,
                    "status_histogram": agg.status_histogram,
                    "health_score": score,
                    "status": health_status(score),
                }),
            );
        }
        Ok(serde_json::to_value(out)?)
    })
    .await
    .map_err(|e| ApiError::Internal(e.into()))??;

    Ok(envelope(metrics))
}

// ---------------------------------------------------------------------------
// Incidents
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct IncidentQuery {
    severity: Option<Severity>,
    status: Option<IncidentStatus>,
    endpoint: Option<String>,
}

async fn list_incidents(
    State(state): State<AppState>,
    Query(params): Query<IncidentQuery>,
) -> Result<Json<Value>, ApiError> {
    let filter = IncidentFilter {
        severity: params.severity,
        status: params.status,
        endpoint: params.endpoint,
    };
    let incidents = state.engine.registry().list(&filter);
    let total = incidents.len();
    Ok(Json(json!({
        "data": incidents,
        "meta": { "total": total, "timestamp": Utc::now().to_rfc3339() }
    })))
}

async fn get_incident(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let incident = state
        .engine
        .registry()
        .get(&id)
        .ok_or_else(|| ApiError::NotFound(format!("incident not found: {id}")))?;
    Ok(envelope(serde_json::to_value(incident).map_err(anyhow::Error::from)?))
}

async fn acknowledge_incident(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let incident = state.engine.registry().acknowledge(&id, Utc::now())?;
    Ok(envelope(serde_json::to_value(incident).map_err(anyhow::Error::from)?))
}

#[derive(Deserialize, Default)]
struct ResolveBody {
    note: Option<String>,
}

async fn resolve_incident(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<ResolveBody>>,
) -> Result<Json<Value>, ApiError> {
    let note = body.and_then(|Json(b)| b.note);
    let incident = state.engine.registry().resolve(&id, note, Utc::now())?;
    Ok(envelope(serde_json::to_value(incident).map_err(anyhow::Error::from)?))
}

// ---------------------------------------------------------------------------
// Analysis
// ---------------------------------------------------------------------------

async fn trigger_analysis(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let engine = state.engine.clone();
    let report = tokio::task::spawn_blocking(move || engine.run_analysis(Utc::now()))
        .await
        .map_err(|e| ApiError::Internal(e.into()))??;
    Ok(envelope(serde_json::to_value(report).map_err(anyhow::Error::from)?))
}

// ---------------------------------------------------------------------------
// Failure injection
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct SetInjectionBody {
    endpoint: String,
    delay_ms: Option<u64>,
    error_rate: Option<f64>,
}

async fn set_injection(
    State(state): State<AppState>,
    Json(body): Json<SetInjectionBody>,
) -> Result<Json<Value>, ApiError> {
    if body.endpoint.is_empty() {
        return Err(ApiError::BadRequest("endpoint must be non-empty".to_string()));
    }
    if body.delay_ms.is_none() && body.error_rate.is_none() {
        return Err(ApiError::BadRequest(
            "at least one of delay_ms or error_rate is required".to_string(),
        ));
    }
    if let Some(rate) = body.error_rate {
        if !(0.0..=1.0).contains(&rate) {
            return Err(ApiError::BadRequest(
                "error_rate must be within [0, 1]".to_string(),
            ));
        }
    }

    state
        .engine
        .injector()
        .set(&body.endpoint, body.delay_ms, body.error_rate);
    injection_table(&state)
}

#[derive(Deserialize)]
struct ClearInjectionQuery {
    endpoint: Option<String>,
}

async fn clear_injection(
    State(state): State<AppState>,
    Query(params): Query<ClearInjectionQuery>,
) -> Result<Json<Value>, ApiError> {
    match params.endpoint {
        Some(endpoint) => state.engine.injector().clear_endpoint(&endpoint),
        None => state.engine.injector().clear_all(),
    }
    injection_table(&state)
}

async fn injection_status(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    injection_table(&state)
}

fn injection_table(state: &AppState) -> Result<Json<Value>, ApiError> {
    let table = state.engine.injector().snapshot();
    Ok(envelope(json!({ "injections": table })))
}
