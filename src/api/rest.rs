//! REST API Handlers
//!
//! Monitoring and administration endpoints for the cache: stats, metrics
//! history, alerts and alert thresholds, pattern invalidation and flush.

use crate::cache::metrics::CacheStats;
use crate::cache::CacheStoreRef;
use crate::error::{Error, ErrorKind};
use crate::monitoring::{
    AlertRecord, AlertThresholds, CacheMonitor, HealthReport, HealthStatus, HistoryBucket,
    HistoryPeriod, MonitorState,
};
use axum::{
    extract::{Json, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Alerts returned when no limit is given
pub const DEFAULT_ALERT_LIMIT: usize = 50;

/// Upper bound on `?limit=`
pub const MAX_ALERT_LIMIT: usize = 1000;

// =============================================================================
// Request/Response Types
// =============================================================================

/// Current cache metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsResponse {
    pub stats: CacheStats,
    pub current_items: u64,
    pub current_memory_bytes: u64,
    pub l1_memory_usage_ratio: f64,
    pub avg_latency_ms: f64,
    pub error_rate: f64,
    pub monitor_state: MonitorState,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HistoryQuery {
    #[serde(default)]
    pub period: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryResponse {
    pub period: HistoryPeriod,
    pub buckets: Vec<HistoryBucket>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AlertsQuery {
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertsResponse {
    pub count: usize,
    pub alerts: Vec<AlertRecord>,
}

/// Threshold update request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertConfigRequest {
    pub threshold_name: String,
    #[serde(default)]
    pub value: Option<f64>,
    #[serde(default)]
    pub enabled: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertConfigResponse {
    pub thresholds: AlertThresholds,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvalidateRequest {
    pub pattern: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvalidateResponse {
    pub pattern: String,
    pub deleted: usize,
}

/// API error response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiErrorResponse {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

fn error_response(status: StatusCode, error: &str, message: impl Into<String>) -> Response {
    (
        status,
        Json(ApiErrorResponse {
            error: error.into(),
            message: message.into(),
            details: None,
        }),
    )
        .into_response()
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = match self.kind() {
            ErrorKind::ValidationError => StatusCode::BAD_REQUEST,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::UpstreamError => StatusCode::BAD_GATEWAY,
            ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };
        error_response(status, &self.kind().to_string(), self.to_string())
    }
}

// =============================================================================
// REST Router
// =============================================================================

/// REST API router builder
pub struct RestRouter {
    cache: CacheStoreRef,
    monitor: Arc<CacheMonitor>,
}

impl RestRouter {
    /// Create a new REST router
    pub fn new(cache: CacheStoreRef, monitor: Arc<CacheMonitor>) -> Self {
        Self { cache, monitor }
    }

    /// Build the Axum router
    pub fn build(self) -> Router {
        let state = AppState {
            cache: self.cache,
            monitor: self.monitor,
        };

        Router::new()
            // Metrics endpoints
            .route("/api/metrics", get(get_metrics))
            .route("/api/metrics/history", get(get_metrics_history))
            // Alert endpoints
            .route("/api/alerts", get(list_alerts))
            .route("/api/alerts/config", get(get_alert_config).post(update_alert_config))
            // Cache administration
            .route("/api/cache/invalidate", post(invalidate_cache))
            .route("/api/cache/flush", post(flush_cache))
            // Health endpoint
            .route("/health", get(health_check))
            .with_state(state)
    }
}

/// Shared application state
#[derive(Clone)]
struct AppState {
    cache: CacheStoreRef,
    monitor: Arc<CacheMonitor>,
}

// =============================================================================
// Handlers
// =============================================================================

/// Current cache stats
async fn get_metrics(State(state): State<AppState>) -> impl IntoResponse {
    let stats = state.cache.stats();
    Json(MetricsResponse {
        current_items: stats.current_items(),
        current_memory_bytes: stats.current_memory_bytes(),
        l1_memory_usage_ratio: stats.l1_memory_usage_ratio(),
        avg_latency_ms: stats.avg_latency_ms(),
        error_rate: stats.error_rate(),
        monitor_state: state.monitor.state(),
        stats,
    })
}

/// Bucketed metrics history
async fn get_metrics_history(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> Response {
    let period = match query.period.as_deref().unwrap_or("hourly").parse::<HistoryPeriod>() {
        Ok(period) => period,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, "invalid_period", e.to_string()),
    };

    let buckets = state.monitor.history(period);
    debug!(period = %period, buckets = buckets.len(), "Serving metrics history");
    Json(HistoryResponse { period, buckets }).into_response()
}

/// Recent alerts, newest first
async fn list_alerts(
    State(state): State<AppState>,
    Query(query): Query<AlertsQuery>,
) -> impl IntoResponse {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_ALERT_LIMIT)
        .min(MAX_ALERT_LIMIT);
    let alerts = state.monitor.alert_manager().alerts(limit);
    Json(AlertsResponse {
        count: alerts.len(),
        alerts,
    })
}

/// Current alert thresholds
async fn get_alert_config(State(state): State<AppState>) -> impl IntoResponse {
    Json(AlertConfigResponse {
        thresholds: state.monitor.alert_manager().thresholds(),
    })
}

/// Update one alert threshold
async fn update_alert_config(
    State(state): State<AppState>,
    Json(request): Json<AlertConfigRequest>,
) -> Response {
    if request.value.is_none() && request.enabled.is_none() {
        return error_response(
            StatusCode::BAD_REQUEST,
            "empty_update",
            "Provide a value, an enabled flag, or both",
        );
    }

    match state.monitor.alert_manager().update_threshold(
        &request.threshold_name,
        request.value,
        request.enabled,
    ) {
        Ok(thresholds) => {
            info!(
                threshold = %request.threshold_name,
                value = ?request.value,
                enabled = ?request.enabled,
                "Alert threshold updated"
            );
            Json(AlertConfigResponse { thresholds }).into_response()
        }
        Err(e) => {
            warn!(threshold = %request.threshold_name, error = %e, "Rejected threshold update");
            e.into_response()
        }
    }
}

/// Delete every key matching a pattern
async fn invalidate_cache(
    State(state): State<AppState>,
    Json(request): Json<InvalidateRequest>,
) -> Response {
    match state.cache.invalidate_pattern(&request.pattern).await {
        Ok(deleted) => Json(InvalidateResponse {
            pattern: request.pattern,
            deleted,
        })
        .into_response(),
        Err(e) => e.into_response(),
    }
}

/// Drop every entry
async fn flush_cache(State(state): State<AppState>) -> impl IntoResponse {
    state.cache.flush().await;
    Json(serde_json::json!({ "status": "flushed" }))
}

/// Health check
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let report: HealthReport = state.monitor.health();
    let status = match report.status {
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
    };
    (status, Json(report))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_mapping() {
        let response = Error::validation("bad").into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = Error::Timeout {
            operation: "redis.get".into(),
            duration: std::time::Duration::from_millis(5),
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[test]
    fn test_config_request_accepts_partial_body() {
        let request: AlertConfigRequest =
            serde_json::from_str(r#"{"threshold_name": "hit_ratio", "enabled": false}"#).unwrap();
        assert_eq!(request.value, None);
        assert_eq!(request.enabled, Some(false));
    }
}
