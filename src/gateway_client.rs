use crate::analytics::Analytics;
use crate::classifier::{
    classify, Outcome, OutcomeKind, RateLimitHeaders, RawResponse, TransportFailure, TransportResult,
};
use crate::config::{Config, ConfigSummary, ResilienceConfig};
use crate::diagnostics::{CacheStats, Diagnostics};
use crate::errors::ResilienceError;
use crate::health::{self, HealthHistory, ProbeResult};
use crate::models::{
    CheckName, HealthReport, HealthStatus, RateLimitContext, RequestOutcome, MAX_WINDOW_SECONDS,
};
use crate::rate_limiter::{resolve_context, RateLimiter};
use crate::retry::RetryPolicy;
use crate::state_store::StateStore;
use chrono::Utc;
use reqwest::{header, Method, Url};
use serde_json::Value;
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

const ALLOWED_METHODS: [Method; 5] = [
    Method::GET,
    Method::POST,
    Method::PUT,
    Method::PATCH,
    Method::DELETE,
];

/// Client for the CRM REST API.
///
/// Every call goes through local rate limiting, classification, bounded
/// retries and analytics. All state lives in the injected [`StateStore`],
/// so a client built fresh for each invocation behaves the same as a
/// long-lived one.
#[derive(Clone)]
pub struct CrmClient {
    http: reqwest::Client,
    base_url: Url,
    token: String,
    system_key: String,
    source_domain: String,
    settings: ResilienceConfig,
    summary: ConfigSummary,
    rate_limiter: Arc<RateLimiter>,
    analytics: Arc<Analytics>,
    history: Arc<HealthHistory>,
    retry_policy: RetryPolicy,
    store: Arc<dyn StateStore>,
}

impl CrmClient {
    /// Creates a new `CrmClient`.
    ///
    /// # Arguments
    ///
    /// * `config` - Credentials, base URL and resilience settings.
    /// * `store` - Shared state for rate limits, analytics and health history.
    ///
    /// Fails with [`ResilienceError::Configuration`] when the base URL is not
    /// a valid URL, or is plain HTTP while TLS is enforced.
    pub fn new(config: &Config, store: Arc<dyn StateStore>) -> Result<Self, ResilienceError> {
        let settings = config.resilience.clone();

        let base_url = Url::parse(&config.crm_base_url).map_err(|e| {
            ResilienceError::Configuration(format!("Invalid CRM base URL: {}", e))
        })?;
        if settings.enforce_tls && base_url.scheme() != "https" {
            return Err(ResilienceError::Configuration(
                "CRM base URL must use https:// while TLS is enforced".to_string(),
            ));
        }

        let http = reqwest::Client::builder()
            .timeout(settings.request_timeout)
            .https_only(settings.enforce_tls)
            .build()
            .map_err(|e| {
                ResilienceError::Configuration(format!("Failed to create CRM client: {}", e))
            })?;

        Ok(Self {
            http,
            base_url,
            token: config.crm_api_token.clone(),
            system_key: config.crm_system_key.clone(),
            source_domain: config.crm_source_domain.clone(),
            summary: config.summary(),
            rate_limiter: Arc::new(RateLimiter::new(store.clone(), settings.budgets.clone())),
            analytics: Arc::new(Analytics::new(store.clone())),
            history: Arc::new(HealthHistory::new(store.clone())),
            retry_policy: RetryPolicy::new(settings.max_retries)
                .with_max_delay(settings.max_retry_delay_seconds),
            settings,
            store,
        })
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    pub fn analytics(&self) -> &Analytics {
        &self.analytics
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Sends one logical request to the CRM.
    ///
    /// # Arguments
    ///
    /// * `method` - One of GET, POST, PUT, PATCH, DELETE.
    /// * `endpoint` - Path relative to the base URL, e.g. `/people/123`.
    /// * `body` - JSON body; not allowed on GET and DELETE.
    /// * `params` - Query parameters appended to the URL.
    ///
    /// # Returns
    ///
    /// * `Result<Value, ResilienceError>` - The decoded response body (`Null`
    ///   for empty bodies), or the terminal error after retries.
    pub async fn send(
        &self,
        method: &str,
        endpoint: &str,
        body: Option<&Value>,
        params: &[(&str, &str)],
    ) -> Result<Value, ResilienceError> {
        let method = validate_request(method, endpoint, body, params)?;
        let url = self.build_url(endpoint, params)?;
        let context = resolve_context(endpoint, &method);

        let admission = self.rate_limiter.admit(context).await;
        if !admission.allowed {
            self.analytics.record_local_refusal(context).await;
            return Err(ResilienceError::RateLimitExceeded {
                context,
                wait_seconds: admission.wait_seconds,
            });
        }

        tracing::info!("CRM {} {} (context '{}')", method, endpoint, context);

        let started_at = Utc::now();
        let mut retry_count = 0u32;
        let mut elapsed_ms = 0u64;

        loop {
            let attempt_started = Instant::now();
            let result = self.execute_attempt(&method, url.clone(), body).await;
            let duration_ms = attempt_started.elapsed().as_millis() as u64;
            elapsed_ms += duration_ms;

            self.analytics.record_attempt(duration_ms, result.is_err()).await;

            let outcome = classify(&result);
            tracing::debug!(
                "Attempt {} for {} {}: {:?} ({}ms)",
                retry_count + 1,
                method,
                endpoint,
                outcome.kind,
                duration_ms
            );

            if let Some(headers) = &outcome.rate_limit {
                self.reconcile_from_headers(context, headers).await;
            }

            let decision = self.retry_policy.should_retry(&outcome, retry_count);
            if decision.retry {
                tracing::warn!(
                    "Retrying {} {} in {}s after {:?} (retry {}/{})",
                    method,
                    endpoint,
                    decision.delay_seconds,
                    outcome.kind,
                    retry_count + 1,
                    self.retry_policy.max_retries
                );
                let delay = self
                    .settings
                    .backoff_unit
                    .saturating_mul(u32::try_from(decision.delay_seconds).unwrap_or(u32::MAX));
                tokio::time::sleep(delay).await;
                retry_count += 1;
                continue;
            }

            let http_status = outcome.status_code;
            let result = finalize(outcome, method.as_str(), endpoint, retry_count + 1);
            let record = RequestOutcome {
                endpoint: endpoint.to_string(),
                method: method.to_string(),
                started_at,
                duration_ms: elapsed_ms,
                http_status,
                success: result.is_ok(),
                retry_count,
                error_code: result.as_ref().err().map(ResilienceError::error_code),
                error_message: result.as_ref().err().map(|e| e.to_string()),
            };
            self.analytics.record_outcome(&record).await;

            if let Err(e) = &result {
                tracing::error!("CRM request failed: {}", e);
            }
            return result;
        }
    }

    pub async fn get(&self, endpoint: &str, params: &[(&str, &str)]) -> Result<Value, ResilienceError> {
        self.send("GET", endpoint, None, params).await
    }

    pub async fn post(&self, endpoint: &str, body: &Value) -> Result<Value, ResilienceError> {
        self.send("POST", endpoint, Some(body), &[]).await
    }

    pub async fn put(&self, endpoint: &str, body: &Value) -> Result<Value, ResilienceError> {
        self.send("PUT", endpoint, Some(body), &[]).await
    }

    pub async fn patch(&self, endpoint: &str, body: &Value) -> Result<Value, ResilienceError> {
        self.send("PATCH", endpoint, Some(body), &[]).await
    }

    pub async fn delete(&self, endpoint: &str) -> Result<Value, ResilienceError> {
        self.send("DELETE", endpoint, None, &[]).await
    }

    /// Runs the five health checks, records the report in history and returns it.
    pub async fn health_check(&self) -> HealthReport {
        let thresholds = &self.settings.thresholds;
        let probe = self.probe_identity().await;

        let snapshot = self.analytics.snapshot().await;
        let buckets = self.rate_limiter.buckets().await;
        let now = Utc::now();

        let mut checks = BTreeMap::new();
        checks.insert(
            CheckName::Connectivity,
            health::check_connectivity(&probe, thresholds),
        );
        checks.insert(
            CheckName::Authentication,
            health::check_authentication(
                !self.token.trim().is_empty(),
                &probe,
                snapshot.last_success_at,
                now,
                thresholds,
            ),
        );
        checks.insert(
            CheckName::RateLimiting,
            health::check_rate_limiting(&buckets, thresholds),
        );
        checks.insert(
            CheckName::Performance,
            health::check_performance(&snapshot, thresholds),
        );
        checks.insert(
            CheckName::TransportSecurity,
            health::check_transport_security(&self.base_url, self.settings.enforce_tls),
        );

        let report = health::build_report(checks, now);
        match report.status {
            HealthStatus::Healthy => tracing::info!("CRM health: healthy ({})", report.score),
            HealthStatus::Warning => tracing::warn!("CRM health: warning ({})", report.score),
            HealthStatus::Critical => tracing::error!("CRM health: critical ({})", report.score),
        }

        self.history.append(&report).await;
        report
    }

    /// Last recorded report while it is younger than the configured
    /// `report_max_age`, otherwise a fresh [`CrmClient::health_check`].
    ///
    /// Keeps frequent pollers from spending CRM budget on identity probes.
    pub async fn recent_health_check(&self) -> HealthReport {
        let max_age = self.settings.thresholds.report_max_age;
        if let Some(report) = self.history.latest_within(max_age, Utc::now()).await {
            tracing::debug!("Serving cached CRM health report from {}", report.generated_at);
            return report;
        }
        self.health_check().await
    }

    /// Health reports of the last 24 hours, oldest first.
    pub async fn health_history(&self) -> Vec<HealthReport> {
        self.history.entries().await
    }

    pub async fn diagnostics(&self) -> Diagnostics {
        let buckets = self.rate_limiter.buckets().await;
        let snapshot = self.analytics.snapshot().await;
        let quality = self.analytics.connection_quality().await;
        let last_health = self.history.entries().await.pop();
        let cache = CacheStats {
            backend: self.store.backend(),
            entry_count: self.store.entry_count(),
        };

        Diagnostics::assemble(
            self.summary.clone(),
            buckets,
            &snapshot,
            quality,
            cache,
            last_health,
            Utc::now(),
        )
    }

    async fn probe_identity(&self) -> ProbeResult {
        let started = Instant::now();
        match self.get(&self.settings.thresholds.identity_endpoint, &[]).await {
            Ok(_) => ProbeResult::Succeeded {
                duration_ms: started.elapsed().as_millis() as u64,
            },
            Err(ResilienceError::RateLimitExceeded { wait_seconds, .. }) => {
                ProbeResult::Throttled { wait_seconds }
            }
            Err(e) => match e.http_status() {
                Some(status) => ProbeResult::Rejected {
                    status,
                    message: e.to_string(),
                },
                None => ProbeResult::Unreachable {
                    message: e.to_string(),
                },
            },
        }
    }

    fn build_url(&self, endpoint: &str, params: &[(&str, &str)]) -> Result<Url, ResilienceError> {
        let base = self.base_url.as_str().trim_end_matches('/');
        let raw = format!("{}/{}", base, endpoint.trim_start_matches('/'));
        let parsed = if params.is_empty() {
            Url::parse(&raw)
        } else {
            Url::parse_with_params(&raw, params)
        };
        parsed.map_err(|e| {
            ResilienceError::ValidationError(format!("Invalid endpoint '{}': {}", endpoint, e))
        })
    }

    async fn execute_attempt(&self, method: &Method, url: Url, body: Option<&Value>) -> TransportResult {
        let mut request = self
            .http
            .request(method.clone(), url)
            .header(header::AUTHORIZATION, format!("Bearer {}", self.token))
            .header(header::ACCEPT, "application/json")
            .header("X-System-Key", &self.system_key)
            .header("X-Request-ID", Uuid::new_v4().to_string())
            .header("X-Source-Domain", &self.source_domain);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(TransportFailure::from)?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect();
        let body = response.text().await.map_err(TransportFailure::from)?;

        Ok(RawResponse { status, headers, body })
    }

    /// Applies server-reported limits. The header context wins when it names a
    /// known bucket; a missing or out-of-range window falls back to the
    /// configured one.
    async fn reconcile_from_headers(&self, request_context: RateLimitContext, headers: &RateLimitHeaders) {
        let (Some(limit), Some(remaining)) = (headers.limit, headers.remaining) else {
            return;
        };

        let context = headers
            .context
            .as_deref()
            .and_then(|name| RateLimitContext::from_str(name).ok())
            .unwrap_or(request_context);
        let window = match headers.window_seconds {
            Some(window) if (1..=MAX_WINDOW_SECONDS).contains(&window) => window,
            Some(window) => {
                tracing::warn!("Ignoring out-of-range rate limit window from server: {}s", window);
                self.rate_limiter.default_window(context)
            }
            None => self.rate_limiter.default_window(context),
        };

        self.rate_limiter
            .reconcile(context, limit, remaining, window)
            .await;
    }
}

/// Checks caller input before anything is admitted or sent.
pub fn validate_request(
    method: &str,
    endpoint: &str,
    body: Option<&Value>,
    params: &[(&str, &str)],
) -> Result<Method, ResilienceError> {
    let method = Method::from_str(&method.trim().to_ascii_uppercase())
        .ok()
        .filter(|m| ALLOWED_METHODS.contains(m))
        .ok_or_else(|| ResilienceError::ValidationError(format!("Unsupported HTTP method '{}'", method)))?;

    if endpoint.trim().is_empty() {
        return Err(ResilienceError::ValidationError(
            "Endpoint cannot be empty".to_string(),
        ));
    }
    if endpoint.contains("://") || endpoint.starts_with("//") {
        return Err(ResilienceError::ValidationError(format!(
            "Endpoint must be relative to the base URL: '{}'",
            endpoint
        )));
    }
    if endpoint.chars().any(char::is_whitespace) {
        return Err(ResilienceError::ValidationError(format!(
            "Endpoint cannot contain whitespace: '{}'",
            endpoint
        )));
    }
    let path = endpoint.split('?').next().unwrap_or_default();
    if path.split('/').any(|segment| segment == "..") {
        return Err(ResilienceError::ValidationError(format!(
            "Endpoint cannot contain '..' segments: '{}'",
            endpoint
        )));
    }

    if body.is_some() && (method == Method::GET || method == Method::DELETE) {
        return Err(ResilienceError::ValidationError(format!(
            "{} requests cannot carry a body",
            method
        )));
    }
    if params.iter().any(|(name, _)| name.trim().is_empty()) {
        return Err(ResilienceError::ValidationError(
            "Query parameter names cannot be empty".to_string(),
        ));
    }

    Ok(method)
}

/// Turns the last attempt's outcome into the caller-facing result.
fn finalize(outcome: Outcome, method: &str, endpoint: &str, attempts: u32) -> Result<Value, ResilienceError> {
    let endpoint = endpoint.to_string();
    let method = method.to_string();
    let status = outcome.status_code.unwrap_or_default();

    match outcome.kind {
        OutcomeKind::Success => Ok(outcome.payload.unwrap_or(Value::Null)),
        OutcomeKind::TransportError => Err(ResilienceError::TransportError {
            endpoint,
            method,
            attempts,
            message: outcome.error.unwrap_or_else(|| "unknown transport error".to_string()),
        }),
        OutcomeKind::RateLimited => Err(ResilienceError::RateLimitExceededAfterRetries {
            endpoint,
            method,
            attempts,
            retry_after: outcome.retry_after,
        }),
        OutcomeKind::ClientError => Err(ResilienceError::ClientError {
            endpoint,
            method,
            status,
            attempts,
            payload: outcome.payload.unwrap_or(Value::Null),
        }),
        OutcomeKind::UnexpectedStatus => Err(ResilienceError::UnexpectedStatus {
            endpoint,
            method,
            status,
            attempts,
            body: outcome.error.unwrap_or_default(),
        }),
        OutcomeKind::InvalidResponse => Err(ResilienceError::InvalidResponse {
            endpoint,
            method,
            status,
            attempts,
            message: outcome.error.unwrap_or_default(),
        }),
    }
}
