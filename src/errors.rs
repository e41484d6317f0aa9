use crate::models::RateLimitContext;
use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};
use std::fmt;

/// Errors returned by the CRM resilience layer.
///
/// Every variant produced after dispatch carries the endpoint, method and
/// number of attempts so callers can log or surface it without extra context.
#[derive(Debug, Clone)]
pub enum ResilienceError {
    /// Local budget for the context is spent; no network call was made.
    RateLimitExceeded {
        context: RateLimitContext,
        wait_seconds: u64,
    },
    /// The CRM kept answering 429 until the retry budget ran out.
    RateLimitExceededAfterRetries {
        endpoint: String,
        method: String,
        attempts: u32,
        retry_after: Option<u64>,
    },
    /// Network, DNS or timeout failure.
    TransportError {
        endpoint: String,
        method: String,
        attempts: u32,
        message: String,
    },
    /// 4xx response other than 429. The decoded error body is passed through.
    ClientError {
        endpoint: String,
        method: String,
        status: u16,
        attempts: u32,
        payload: Value,
    },
    /// 5xx or any other status the client does not expect.
    UnexpectedStatus {
        endpoint: String,
        method: String,
        status: u16,
        attempts: u32,
        body: String,
    },
    /// Success status with a body that is not valid JSON.
    InvalidResponse {
        endpoint: String,
        method: String,
        status: u16,
        attempts: u32,
        message: String,
    },
    /// Caller input rejected before dispatch.
    ValidationError(String),
    /// Missing or wrong internal API key on the ops service.
    Unauthorized(String),
    /// State store backend failure.
    StateStore(String),
    /// The client could not be constructed from its configuration.
    Configuration(String),
}

impl ResilienceError {
    /// Key under which this error is counted in `error_patterns`.
    pub fn error_code(&self) -> String {
        match self {
            ResilienceError::RateLimitExceeded { .. } => "local_rate_limit".to_string(),
            ResilienceError::RateLimitExceededAfterRetries { .. } => "http_429".to_string(),
            ResilienceError::TransportError { .. } => "transport_error".to_string(),
            ResilienceError::ClientError { status, .. } => format!("http_{}", status),
            ResilienceError::UnexpectedStatus { status, .. } => format!("http_{}", status),
            ResilienceError::InvalidResponse { .. } => "invalid_response".to_string(),
            ResilienceError::ValidationError(_) => "validation_error".to_string(),
            ResilienceError::Unauthorized(_) => "unauthorized".to_string(),
            ResilienceError::StateStore(_) => "state_store".to_string(),
            ResilienceError::Configuration(_) => "configuration".to_string(),
        }
    }

    /// HTTP status reported by the CRM, when there was one.
    pub fn http_status(&self) -> Option<u16> {
        match self {
            ResilienceError::RateLimitExceededAfterRetries { .. } => Some(429),
            ResilienceError::ClientError { status, .. }
            | ResilienceError::UnexpectedStatus { status, .. }
            | ResilienceError::InvalidResponse { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Number of transport attempts made, zero when nothing was sent.
    pub fn attempts(&self) -> u32 {
        match self {
            ResilienceError::RateLimitExceededAfterRetries { attempts, .. }
            | ResilienceError::TransportError { attempts, .. }
            | ResilienceError::ClientError { attempts, .. }
            | ResilienceError::UnexpectedStatus { attempts, .. }
            | ResilienceError::InvalidResponse { attempts, .. } => *attempts,
            _ => 0,
        }
    }
}

impl fmt::Display for ResilienceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResilienceError::RateLimitExceeded { context, wait_seconds } => write!(
                f,
                "Rate limit exceeded for '{}', retry in {}s",
                context, wait_seconds
            ),
            ResilienceError::RateLimitExceededAfterRetries {
                endpoint,
                method,
                attempts,
                ..
            } => write!(
                f,
                "Rate limit exceeded after {} attempts: {} {}",
                attempts, method, endpoint
            ),
            ResilienceError::TransportError {
                endpoint,
                method,
                attempts,
                message,
            } => write!(
                f,
                "Transport error after {} attempt(s) on {} {}: {}",
                attempts, method, endpoint, message
            ),
            ResilienceError::ClientError {
                endpoint,
                method,
                status,
                payload,
                ..
            } => write!(f, "CRM returned {} for {} {}: {}", status, method, endpoint, payload),
            ResilienceError::UnexpectedStatus {
                endpoint,
                method,
                status,
                body,
                ..
            } => write!(
                f,
                "Unexpected CRM response {} for {} {}: {}",
                status, method, endpoint, body
            ),
            ResilienceError::InvalidResponse {
                endpoint,
                method,
                status,
                message,
                ..
            } => write!(
                f,
                "Invalid CRM response ({}) for {} {}: {}",
                status, method, endpoint, message
            ),
            ResilienceError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
            ResilienceError::Unauthorized(msg) => write!(f, "Unauthorized: {}", msg),
            ResilienceError::StateStore(msg) => write!(f, "State store error: {}", msg),
            ResilienceError::Configuration(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

impl std::error::Error for ResilienceError {}

impl IntoResponse for ResilienceError {
    /// Maps each variant to the status an internal caller of the ops service sees.
    fn into_response(self) -> Response {
        let code = self.error_code();
        let (status, message, details) = match &self {
            ResilienceError::RateLimitExceeded { wait_seconds, .. } => {
                tracing::warn!("{}", self);
                let body = Json(json!({
                    "error": self.to_string(),
                    "code": code,
                    "wait_seconds": wait_seconds,
                }));
                return (
                    StatusCode::TOO_MANY_REQUESTS,
                    [(header::RETRY_AFTER, wait_seconds.to_string())],
                    body,
                )
                    .into_response();
            }
            ResilienceError::RateLimitExceededAfterRetries { .. } => {
                tracing::warn!("{}", self);
                (StatusCode::TOO_MANY_REQUESTS, self.to_string(), Value::Null)
            }
            ResilienceError::TransportError { message, .. } => {
                tracing::error!("{}", self);
                let status = if message.contains("timeout") {
                    StatusCode::GATEWAY_TIMEOUT
                } else {
                    StatusCode::BAD_GATEWAY
                };
                (status, "CRM unreachable".to_string(), Value::Null)
            }
            ResilienceError::ClientError { status, payload, .. } => (
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_REQUEST),
                self.to_string(),
                payload.clone(),
            ),
            ResilienceError::UnexpectedStatus { .. } | ResilienceError::InvalidResponse { .. } => {
                tracing::error!("{}", self);
                (StatusCode::BAD_GATEWAY, "External service error".to_string(), Value::Null)
            }
            ResilienceError::ValidationError(msg) => {
                (StatusCode::BAD_REQUEST, msg.clone(), Value::Null)
            }
            ResilienceError::Unauthorized(msg) => {
                (StatusCode::UNAUTHORIZED, msg.clone(), Value::Null)
            }
            ResilienceError::StateStore(_) | ResilienceError::Configuration(_) => {
                tracing::error!("{}", self);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                    Value::Null,
                )
            }
        };

        let body = Json(json!({
            "error": message,
            "code": code,
            "details": details,
        }));

        (status, body).into_response()
    }
}

impl From<sqlx::Error> for ResilienceError {
    fn from(err: sqlx::Error) -> Self {
        ResilienceError::StateStore(err.to_string())
    }
}

impl From<reqwest::Error> for ResilienceError {
    /// Only reached while building the HTTP client; request failures are classified instead.
    fn from(err: reqwest::Error) -> Self {
        ResilienceError::Configuration(err.to_string())
    }
}

impl From<serde_json::Error> for ResilienceError {
    fn from(err: serde_json::Error) -> Self {
        ResilienceError::StateStore(format!("failed to (de)serialize state: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let err = ResilienceError::ClientError {
            endpoint: "/people/1".to_string(),
            method: "GET".to_string(),
            status: 404,
            attempts: 1,
            payload: json!({"errorMessage": "not found"}),
        };
        assert_eq!(err.error_code(), "http_404");
        assert_eq!(err.http_status(), Some(404));
        assert_eq!(err.attempts(), 1);

        let err = ResilienceError::RateLimitExceeded {
            context: RateLimitContext::Notes,
            wait_seconds: 5,
        };
        assert_eq!(err.error_code(), "local_rate_limit");
        assert_eq!(err.attempts(), 0);
    }

    #[test]
    fn test_display_includes_attempts() {
        let err = ResilienceError::TransportError {
            endpoint: "/identity".to_string(),
            method: "GET".to_string(),
            attempts: 4,
            message: "request timeout".to_string(),
        };
        let text = err.to_string();
        assert!(text.contains("4 attempt"));
        assert!(text.contains("GET /identity"));
    }

    #[test]
    fn test_local_rate_limit_response_sets_retry_after() {
        let err = ResilienceError::RateLimitExceeded {
            context: RateLimitContext::Global,
            wait_seconds: 7,
        };
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers().get(header::RETRY_AFTER).unwrap(), "7");
    }

    #[test]
    fn test_client_error_passes_status_through() {
        let err = ResilienceError::ClientError {
            endpoint: "/people".to_string(),
            method: "POST".to_string(),
            status: 422,
            attempts: 1,
            payload: json!({"errorMessage": "invalid"}),
        };
        assert_eq!(err.into_response().status(), StatusCode::UNPROCESSABLE_ENTITY);
    }
}
