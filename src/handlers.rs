use crate::config::Config;
use crate::diagnostics::Diagnostics;
use crate::errors::ResilienceError;
use crate::gateway_client::CrmClient;
use crate::models::{AnalyticsSnapshot, HealthReport, HealthStatus};
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, Method, StatusCode},
    Json,
};
use serde_json::{json, Value};
use std::sync::Arc;

/// Shared application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    /// Resilient CRM client; all of its state lives in the state store.
    pub client: CrmClient,
    /// Application configuration.
    pub config: Config,
}

/// Liveness endpoint. Does not touch the CRM.
///
/// # Returns
///
/// * `(StatusCode, Json<serde_json::Value>)` - HTTP 200 OK with service name and version.
pub async fn health() -> (StatusCode, Json<Value>) {
    (
        StatusCode::OK,
        Json(json!({
            "status": "healthy",
            "service": "rust-crm-resilience",
            "version": env!("CARGO_PKG_VERSION")
        })),
    )
}

/// GET /api/v1/health
///
/// Serves the CRM health report, reusing a recent one when available. Answers
/// 503 when the integration is critical so load balancers and uptime monitors
/// can alert on the status code alone.
pub async fn crm_health(State(state): State<Arc<AppState>>) -> (StatusCode, Json<HealthReport>) {
    let report = state.client.recent_health_check().await;
    let status = match report.status {
        HealthStatus::Critical => StatusCode::SERVICE_UNAVAILABLE,
        HealthStatus::Healthy | HealthStatus::Warning => StatusCode::OK,
    };
    (status, Json(report))
}

/// GET /api/v1/health/history
pub async fn health_history(State(state): State<Arc<AppState>>) -> Json<Vec<HealthReport>> {
    Json(state.client.health_history().await)
}

/// GET /api/v1/diagnostics
pub async fn diagnostics(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Diagnostics>, ResilienceError> {
    validate_api_key(&state, &headers)?;
    Ok(Json(state.client.diagnostics().await))
}

/// GET /api/v1/analytics
///
/// Guarded like diagnostics: recent errors carry CRM response bodies.
pub async fn analytics(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<AnalyticsSnapshot>, ResilienceError> {
    validate_api_key(&state, &headers)?;
    Ok(Json(state.client.analytics().snapshot().await))
}

/// ANY /api/v1/crm/*endpoint
///
/// Forwards the request to the CRM through the resilient client. The method,
/// path remainder, query string and JSON body are passed as-is.
///
/// # Arguments
///
/// * `state` - The application state.
/// * `method` - HTTP method of the inbound request.
/// * `endpoint` - CRM path below `/api/v1/crm`.
/// * `params` - Query parameters.
/// * `headers` - Must carry `X-Api-Key` when `INTERNAL_API_KEY` is set.
/// * `body` - Optional JSON body.
///
/// # Returns
///
/// * `Result<Json<Value>, ResilienceError>` - The CRM response body or the mapped error.
pub async fn crm_passthrough(
    State(state): State<Arc<AppState>>,
    method: Method,
    Path(endpoint): Path<String>,
    Query(params): Query<Vec<(String, String)>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ResilienceError> {
    validate_api_key(&state, &headers)?;

    let body: Option<Value> = if body.iter().all(u8::is_ascii_whitespace) {
        None
    } else {
        Some(serde_json::from_slice(&body).map_err(|e| {
            ResilienceError::ValidationError(format!("Request body is not valid JSON: {}", e))
        })?)
    };

    let endpoint = format!("/{}", endpoint.trim_start_matches('/'));
    let params: Vec<(&str, &str)> = params
        .iter()
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect();

    tracing::info!("Passthrough {} {}", method, endpoint);
    let data = state
        .client
        .send(method.as_str(), &endpoint, body.as_ref(), &params)
        .await?;

    Ok(Json(data))
}

/// Validate the internal API key from the X-Api-Key header
fn validate_api_key(state: &AppState, headers: &HeaderMap) -> Result<(), ResilienceError> {
    // No key configured: the service is only reachable from the private network
    let Some(ref expected) = state.config.internal_api_key else {
        return Ok(());
    };

    let provided = headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ResilienceError::Unauthorized("Missing X-Api-Key header".to_string()))?;

    if !constant_time_compare(provided, expected) {
        tracing::warn!("Invalid internal API key received");
        return Err(ResilienceError::Unauthorized("Invalid API key".to_string()));
    }

    Ok(())
}

fn constant_time_compare(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }

    a.as_bytes()
        .iter()
        .zip(b.as_bytes().iter())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y))
        == 0
}
