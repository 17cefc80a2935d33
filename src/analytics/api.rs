use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{Analyzer, TrafficStore};
use crate::pipeline::adaptive::AdaptiveRateLimiter;

/// Supplies the weighted balancers' current weights to the API.
pub type WeightsFn = Arc<dyn Fn() -> HashMap<String, f64> + Send + Sync>;

#[derive(Clone)]
pub struct AnalyticsState {
    pub analyzer: Arc<Analyzer>,
    pub store: Arc<TrafficStore>,
    pub adaptive: Option<Arc<AdaptiveRateLimiter>>,
    pub weights: Option<WeightsFn>,
    /// Fallback multiplier used to report a limit when the adaptive
    /// limiter is not active.
    pub default_multiplier: f64,
}

/// Read-only traffic-intelligence API, mounted at `/analytics`.
pub fn router(state: AnalyticsState) -> Router {
    Router::new()
        .route("/routes", get(routes))
        .route("/routes/*rest", get(route_history))
        .route("/anomalies", get(anomalies))
        .route("/backends", get(backends))
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct RouteSummary {
    route: String,
    avg_rate: f64,
    avg_latency_ms: f64,
    p99_latency_ms: f64,
    error_rate: f64,
    current_rate_limit: f64,
    anomalies_24h: usize,
}

/// `GET /analytics/routes`: every known route with its baseline and the
/// rate limit currently applied to it.
async fn routes(State(state): State<AnalyticsState>) -> impl IntoResponse {
    let baselines = state.analyzer.all_route_baselines();

    let mut anomaly_counts: HashMap<String, usize> = HashMap::new();
    for anomaly in state.analyzer.recent_anomalies() {
        *anomaly_counts.entry(anomaly.route).or_default() += 1;
    }

    let mut summaries: Vec<RouteSummary> = baselines
        .into_iter()
        .map(|(route, b)| {
            let limit = state
                .adaptive
                .as_ref()
                .and_then(|a| a.current_limit(&route))
                .unwrap_or(b.mean_rate * state.default_multiplier);
            RouteSummary {
                anomalies_24h: anomaly_counts.get(&route).copied().unwrap_or(0),
                route,
                avg_rate: b.mean_rate,
                avg_latency_ms: b.mean_latency_ms,
                p99_latency_ms: b.p99_latency_ms,
                error_rate: b.mean_error_rate,
                current_rate_limit: limit,
            }
        })
        .collect();
    summaries.sort_by(|a, b| a.route.cmp(&b.route));

    Json(json!({ "routes": summaries }))
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    /// Unix seconds; defaults to one hour ago.
    from: Option<i64>,
    /// Unix seconds; defaults to now.
    to: Option<i64>,
}

#[derive(Debug, Serialize)]
struct HistoryPoint {
    timestamp: DateTime<Utc>,
    request_count: u64,
    error_rate: f64,
    avg_latency_ms: f64,
    bytes_in: u64,
    bytes_out: u64,
}

/// `GET /analytics/routes/{route}/history?from&to`: per-bucket time series
/// for one route, defaulting to the last hour.
async fn route_history(
    State(state): State<AnalyticsState>,
    Path(rest): Path<String>,
    Query(q): Query<HistoryQuery>,
) -> impl IntoResponse {
    // The wildcard holds "{route}/history" with the route itself containing
    // slashes, e.g. "api/v1/history".
    let Some(route) = rest.strip_suffix("/history") else {
        return (
            axum::http::StatusCode::NOT_FOUND,
            "unknown analytics endpoint",
        )
            .into_response();
    };
    let route = if route.starts_with('/') {
        route.to_string()
    } else {
        format!("/{route}")
    };

    let to = q
        .to
        .and_then(|s| Utc.timestamp_opt(s, 0).single())
        .unwrap_or_else(Utc::now);
    let from = q
        .from
        .and_then(|s| Utc.timestamp_opt(s, 0).single())
        .unwrap_or_else(|| to - chrono::Duration::hours(1));

    let points: Vec<HistoryPoint> = state
        .store
        .route_buckets(&route, from, to)
        .into_iter()
        .map(|b| HistoryPoint {
            timestamp: b.timestamp,
            request_count: b.request_count,
            error_rate: b.error_rate(),
            avg_latency_ms: b.avg_latency().as_secs_f64() * 1000.0,
            bytes_in: b.bytes_in,
            bytes_out: b.bytes_out,
        })
        .collect();

    Json(json!({
        "route": route,
        "from": from,
        "to": to,
        "history": points,
    }))
    .into_response()
}

/// `GET /analytics/anomalies`: the rolling 24-hour anomaly log.
async fn anomalies(State(state): State<AnalyticsState>) -> impl IntoResponse {
    let anomalies = state.analyzer.recent_anomalies();
    Json(json!({ "count": anomalies.len(), "anomalies": anomalies }))
}

#[derive(Debug, Serialize)]
struct BackendSummary {
    backend: String,
    avg_latency_ms: f64,
    error_rate: f64,
    weight: f64,
}

/// `GET /analytics/backends`: per-backend performance and current weight.
async fn backends(State(state): State<AnalyticsState>) -> impl IntoResponse {
    let weights = state.weights.as_ref().map(|f| f()).unwrap_or_default();

    let mut summaries: Vec<BackendSummary> = state
        .analyzer
        .all_backend_baselines()
        .into_iter()
        .map(|(backend, b)| BackendSummary {
            weight: weights.get(&backend).copied().unwrap_or(0.0),
            backend,
            avg_latency_ms: b.mean_latency_ms,
            error_rate: b.mean_error_rate,
        })
        .collect();
    summaries.sort_by(|a, b| a.backend.cmp(&b.backend));

    Json(json!({ "backends": summaries }))
}
