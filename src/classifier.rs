//! Maps raw transport results onto the outcome taxonomy.
//!
//! The classifier is a pure function of its input: classifying the same
//! response twice yields the same [`Outcome`].

use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde_json::Value;
use std::collections::HashMap;

/// HTTP response as read off the wire. Header names are lowercase.
#[derive(Debug, Clone, PartialEq)]
pub struct RawResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: String,
}

impl RawResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            headers: HashMap::new(),
            body: body.into(),
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }
}

/// Transport-level failure: DNS, connect, TLS, timeout or body read.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportFailure {
    pub message: String,
}

impl TransportFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }
}

impl From<reqwest::Error> for TransportFailure {
    fn from(err: reqwest::Error) -> Self {
        let message = if err.is_timeout() {
            format!("request timeout: {}", err)
        } else if err.is_connect() {
            format!("connection failed: {}", err)
        } else {
            format!("request failed: {}", err)
        };
        Self { message }
    }
}

pub type TransportResult = Result<RawResponse, TransportFailure>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeKind {
    Success,
    TransportError,
    InvalidResponse,
    RateLimited,
    ClientError,
    UnexpectedStatus,
}

/// Rate-limit headers as reported by the CRM. Each is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RateLimitHeaders {
    pub limit: Option<u32>,
    pub remaining: Option<u32>,
    pub window_seconds: Option<u64>,
    pub context: Option<String>,
}

impl RateLimitHeaders {
    fn from_response(response: &RawResponse) -> Option<Self> {
        let headers = Self {
            limit: parse_header(response, "x-ratelimit-limit"),
            remaining: parse_header(response, "x-ratelimit-remaining"),
            window_seconds: parse_header(response, "x-ratelimit-window"),
            context: response
                .header("x-ratelimit-context")
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty()),
        };

        if headers == Self::default() {
            None
        } else {
            Some(headers)
        }
    }
}

fn parse_header<T: std::str::FromStr>(response: &RawResponse, name: &str) -> Option<T> {
    response.header(name).and_then(|v| v.trim().parse().ok())
}

#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    pub kind: OutcomeKind,
    pub status_code: Option<u16>,
    /// Decoded body on success, error body (or status text) on client errors.
    pub payload: Option<Value>,
    pub error: Option<String>,
    /// Seconds from `Retry-After`, only for 429.
    pub retry_after: Option<u64>,
    pub rate_limit: Option<RateLimitHeaders>,
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        self.kind == OutcomeKind::Success
    }
}

pub fn classify(result: &TransportResult) -> Outcome {
    classify_at(result, Utc::now())
}

/// Classifies with an explicit clock, used to resolve HTTP-date `Retry-After` values.
pub fn classify_at(result: &TransportResult, now: DateTime<Utc>) -> Outcome {
    let response = match result {
        Ok(response) => response,
        Err(failure) => {
            return Outcome {
                kind: OutcomeKind::TransportError,
                status_code: None,
                payload: None,
                error: Some(failure.message.clone()),
                retry_after: None,
                rate_limit: None,
            }
        }
    };

    let status = response.status;
    let rate_limit = RateLimitHeaders::from_response(response);
    let mut outcome = Outcome {
        kind: OutcomeKind::UnexpectedStatus,
        status_code: Some(status),
        payload: None,
        error: None,
        retry_after: None,
        rate_limit,
    };

    match status {
        200..=299 => {
            if response.body.trim().is_empty() {
                outcome.kind = OutcomeKind::Success;
                outcome.payload = Some(Value::Null);
            } else {
                match serde_json::from_str::<Value>(&response.body) {
                    Ok(body) => {
                        outcome.kind = OutcomeKind::Success;
                        outcome.payload = Some(body);
                    }
                    Err(e) => {
                        outcome.kind = OutcomeKind::InvalidResponse;
                        outcome.error = Some(format!("Failed to parse CRM response: {}", e));
                    }
                }
            }
        }
        429 => {
            outcome.kind = OutcomeKind::RateLimited;
            outcome.retry_after = response
                .header("retry-after")
                .and_then(|value| parse_retry_after(value, now));
            outcome.error = Some("rate limited by CRM".to_string());
        }
        400..=499 => {
            outcome.kind = OutcomeKind::ClientError;
            outcome.payload = Some(
                serde_json::from_str::<Value>(&response.body)
                    .unwrap_or_else(|_| Value::String(status_text(status))),
            );
            outcome.error = Some(status_text(status));
        }
        _ => {
            outcome.error = Some(if response.body.is_empty() {
                status_text(status)
            } else {
                response.body.clone()
            });
        }
    }

    outcome
}

/// `Retry-After` as delta-seconds or an HTTP-date.
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<u64> {
    let value = value.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(seconds);
    }

    DateTime::parse_from_rfc2822(value).ok().map(|date| {
        let millis = (date.with_timezone(&Utc) - now).num_milliseconds().max(0) as u64;
        millis.div_ceil(1000)
    })
}

fn status_text(status: u16) -> String {
    match StatusCode::from_u16(status)
        .ok()
        .and_then(|s| s.canonical_reason())
    {
        Some(reason) => format!("{} {}", status, reason),
        None => status.to_string(),
    }
}
