use crate::models::{Limit, RateLimitContext};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub crm_base_url: String,
    pub crm_api_token: String,
    pub crm_system_key: String,
    pub crm_source_domain: String,
    pub state_store_url: Option<String>, // Postgres; in-process store when absent
    pub internal_api_key: Option<String>,
    pub resilience: ResilienceConfig,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let mut resilience = ResilienceConfig::default();
        if let Ok(retries) = std::env::var("CRM_MAX_RETRIES") {
            resilience.max_retries = retries
                .parse()
                .map_err(|_| anyhow::anyhow!("CRM_MAX_RETRIES must be a non-negative number"))?;
        }
        if let Ok(enforce) = std::env::var("CRM_ENFORCE_TLS") {
            resilience.enforce_tls = match enforce.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" => true,
                "0" | "false" | "no" => false,
                _ => anyhow::bail!("CRM_ENFORCE_TLS must be true or false"),
            };
        }

        let config = Self {
            port: std::env::var("PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("PORT must be a valid number between 1-65535"))?,
            crm_base_url: std::env::var("CRM_BASE_URL")
                .map_err(|_| anyhow::anyhow!("CRM_BASE_URL environment variable required"))
                .and_then(|url| {
                    if url.trim().is_empty() {
                        anyhow::bail!("CRM_BASE_URL cannot be empty");
                    }
                    if !url.starts_with("http://") && !url.starts_with("https://") {
                        anyhow::bail!("CRM_BASE_URL must start with http:// or https://");
                    }
                    Ok(url)
                })?,
            crm_api_token: std::env::var("CRM_API_TOKEN")
                .map_err(|_| anyhow::anyhow!("CRM_API_TOKEN environment variable required"))
                .and_then(|token| {
                    if token.trim().is_empty() {
                        anyhow::bail!("CRM_API_TOKEN cannot be empty");
                    }
                    Ok(token)
                })?,
            crm_system_key: std::env::var("CRM_SYSTEM_KEY")
                .map_err(|_| anyhow::anyhow!("CRM_SYSTEM_KEY environment variable required"))
                .and_then(|key| {
                    if key.trim().is_empty() {
                        anyhow::bail!("CRM_SYSTEM_KEY cannot be empty");
                    }
                    Ok(key)
                })?,
            crm_source_domain: std::env::var("CRM_SOURCE_DOMAIN")
                .ok()
                .filter(|s| !s.trim().is_empty())
                .unwrap_or_else(|| "localhost".to_string()),
            state_store_url: std::env::var("STATE_STORE_URL")
                .ok()
                .filter(|s| !s.trim().is_empty()),
            internal_api_key: std::env::var("INTERNAL_API_KEY")
                .ok()
                .filter(|s| !s.trim().is_empty()),
            resilience,
        };

        // Log successful configuration load (without sensitive values)
        tracing::info!("Configuration loaded successfully");
        tracing::debug!("CRM Base URL: {}", config.crm_base_url);
        tracing::debug!("CRM Source Domain: {}", config.crm_source_domain);
        if config.state_store_url.is_some() {
            tracing::info!("Postgres state store configured");
        }
        if !config.resilience.enforce_tls {
            tracing::warn!("TLS enforcement disabled for CRM transport");
        }
        tracing::debug!("Server Port: {}", config.port);

        Ok(config)
    }

    /// Configuration view safe to show on operator dashboards.
    pub fn summary(&self) -> ConfigSummary {
        ConfigSummary {
            crm_base_url: self.crm_base_url.clone(),
            crm_source_domain: self.crm_source_domain.clone(),
            token_configured: !self.crm_api_token.trim().is_empty(),
            system_key_configured: !self.crm_system_key.trim().is_empty(),
            state_store: if self.state_store_url.is_some() { "postgres" } else { "memory" },
            request_timeout_secs: self.resilience.request_timeout.as_secs(),
            max_retries: self.resilience.max_retries,
            enforce_tls: self.resilience.enforce_tls,
            budgets: self.resilience.budgets.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConfigSummary {
    pub crm_base_url: String,
    pub crm_source_domain: String,
    pub token_configured: bool,
    pub system_key_configured: bool,
    pub state_store: &'static str,
    pub request_timeout_secs: u64,
    pub max_retries: u32,
    pub enforce_tls: bool,
    pub budgets: RateLimitBudgets,
}

/// Tunables of the resilience layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResilienceConfig {
    /// Per-attempt transport timeout (default 30s).
    pub request_timeout: Duration,
    /// Retries per logical request (default 3).
    pub max_retries: u32,
    /// Length of one backoff "second" (default 1s).
    pub backoff_unit: Duration,
    /// Longest backoff in backoff units (default 30). A server asking for
    /// more ends the request instead.
    pub max_retry_delay_seconds: u64,
    /// Refuse plain-HTTP transport (default true).
    pub enforce_tls: bool,
    pub budgets: RateLimitBudgets,
    pub thresholds: HealthThresholds,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            max_retries: 3,
            backoff_unit: Duration::from_secs(1),
            max_retry_delay_seconds: crate::retry::DEFAULT_MAX_DELAY_SECONDS,
            enforce_tls: true,
            budgets: RateLimitBudgets::default(),
            thresholds: HealthThresholds::default(),
        }
    }
}

/// Budget of one rate-limit context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Budget {
    pub limit: Limit,
    pub window_seconds: u64,
}

impl Budget {
    pub const fn limited(limit: u32, window_seconds: u64) -> Self {
        Self { limit: Limit::Limited(limit), window_seconds }
    }

    pub const fn unlimited(window_seconds: u64) -> Self {
        Self { limit: Limit::Unlimited, window_seconds }
    }
}

/// Fixed-window budgets, one named field per context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitBudgets {
    pub events_post: Budget,
    pub events_get: Budget,
    pub people_put: Budget,
    pub notes: Budget,
    pub global: Budget,
}

impl Default for RateLimitBudgets {
    fn default() -> Self {
        Self {
            events_post: Budget::unlimited(10),
            events_get: Budget::limited(20, 10),
            people_put: Budget::limited(25, 10),
            notes: Budget::limited(10, 10),
            global: Budget::limited(250, 10),
        }
    }
}

impl RateLimitBudgets {
    pub fn for_context(&self, context: RateLimitContext) -> Budget {
        match context {
            RateLimitContext::EventsPost => self.events_post,
            RateLimitContext::EventsGet => self.events_get,
            RateLimitContext::PeoplePut => self.people_put,
            RateLimitContext::Notes => self.notes,
            RateLimitContext::Global => self.global,
        }
    }
}

/// Fixed thresholds used by the health checks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthThresholds {
    /// Cheap endpoint used for the live connectivity round-trip.
    pub identity_endpoint: String,
    /// Connectivity passes below this round-trip time, warns above it.
    pub connectivity_budget_ms: u64,
    /// Authentication warns when the last success is older than this.
    pub auth_recent_success: Duration,
    /// The ops health endpoint reuses a report younger than this instead of
    /// probing the CRM again.
    pub report_max_age: Duration,
    /// Rate limiting warns when any bucket is above this utilization (percent).
    pub rate_limit_warn_utilization: f64,
    pub max_avg_response_ms: f64,
    pub warn_avg_response_ms: f64,
    pub min_success_rate: f64,
    pub warn_success_rate: f64,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            identity_endpoint: "/identity".to_string(),
            connectivity_budget_ms: 5_000,
            auth_recent_success: Duration::from_secs(3600),
            report_max_age: Duration::from_secs(30),
            rate_limit_warn_utilization: 90.0,
            max_avg_response_ms: 2_000.0,
            warn_avg_response_ms: 5_000.0,
            min_success_rate: 90.0,
            warn_success_rate: 75.0,
        }
    }
}
