use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::str::FromStr;

/// Upper bound on the latency samples kept in the analytics snapshot.
pub const MAX_RESPONSE_TIME_SAMPLES: usize = 100;
/// Upper bound on the latency samples kept for connection quality.
pub const MAX_CONNECTION_SAMPLES: usize = 50;
/// Upper bound on the recent-error ring shown in diagnostics.
pub const MAX_RECENT_ERRORS: usize = 20;

// ============ Rate Limiting ============

/// A named bucket of API usage sharing one budget and window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RateLimitContext {
    EventsPost,
    EventsGet,
    PeoplePut,
    Notes,
    Global,
}

impl RateLimitContext {
    pub const ALL: [RateLimitContext; 5] = [
        RateLimitContext::EventsPost,
        RateLimitContext::EventsGet,
        RateLimitContext::PeoplePut,
        RateLimitContext::Notes,
        RateLimitContext::Global,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RateLimitContext::EventsPost => "events-post",
            RateLimitContext::EventsGet => "events-get",
            RateLimitContext::PeoplePut => "people-put",
            RateLimitContext::Notes => "notes",
            RateLimitContext::Global => "global",
        }
    }
}

impl fmt::Display for RateLimitContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RateLimitContext {
    type Err = String;

    /// Parses the context names the CRM reports in `X-RateLimit-Context`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('_', "-");
        RateLimitContext::ALL
            .into_iter()
            .find(|ctx| ctx.as_str() == normalized)
            .ok_or_else(|| format!("unknown rate limit context: {}", s))
    }
}

/// Request budget of a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Limit {
    Limited(u32),
    Unlimited,
}

/// Longest window a bucket may span. Larger values, stored or reported by
/// the server, are treated as one day.
pub const MAX_WINDOW_SECONDS: u64 = 86_400;

fn window_span(window_seconds: u64) -> chrono::Duration {
    chrono::Duration::try_seconds(window_seconds.min(MAX_WINDOW_SECONDS) as i64)
        .unwrap_or_else(|| chrono::Duration::seconds(MAX_WINDOW_SECONDS as i64))
}

/// Fixed-window usage counter for one [`RateLimitContext`].
///
/// `used` is advisory until the bucket has been reconciled with the
/// limits reported by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitBucket {
    pub context: RateLimitContext,
    pub limit: Limit,
    pub window_seconds: u64,
    pub used: u32,
    pub reset_at: DateTime<Utc>,
}

impl RateLimitBucket {
    /// Creates an empty bucket whose first window starts at `now`.
    pub fn new(context: RateLimitContext, limit: Limit, window_seconds: u64, now: DateTime<Utc>) -> Self {
        Self {
            context,
            limit,
            window_seconds: window_seconds.min(MAX_WINDOW_SECONDS),
            used: 0,
            reset_at: now + window_span(window_seconds),
        }
    }

    /// Starts a fresh window if the current one has elapsed.
    ///
    /// Returns `true` when the bucket was reset.
    pub fn reset_if_elapsed(&mut self, now: DateTime<Utc>) -> bool {
        if now >= self.reset_at {
            self.used = 0;
            self.reset_at = now + window_span(self.window_seconds);
            true
        } else {
            false
        }
    }

    /// Whole seconds until the window resets, rounded up.
    pub fn seconds_until_reset(&self, now: DateTime<Utc>) -> u64 {
        let millis = (self.reset_at - now).num_milliseconds().max(0) as u64;
        millis.div_ceil(1000)
    }

    /// Percentage of the budget consumed, `None` for unlimited buckets.
    pub fn utilization(&self) -> Option<f64> {
        match self.limit {
            Limit::Unlimited => None,
            Limit::Limited(0) => Some(100.0),
            Limit::Limited(limit) => Some(self.used as f64 / limit as f64 * 100.0),
        }
    }
}

// ============ Requests ============

/// Record of one logical request, created when the dispatcher finalizes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestOutcome {
    pub endpoint: String,
    pub method: String,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub http_status: Option<u16>,
    pub success: bool,
    pub retry_count: u32,
    /// Key under which failures are counted in `error_patterns`.
    pub error_code: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
}

impl RequestOutcome {
    /// Key used for the per-endpoint statistics map, e.g. `"GET /people"`.
    pub fn endpoint_key(&self) -> String {
        format!("{} {}", self.method, self.endpoint)
    }
}

// ============ Analytics ============

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EndpointStats {
    pub calls: u64,
    pub successes: u64,
    pub failures: u64,
    pub avg_response_time_ms: f64,
}

/// A failed request as shown to operators in diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub at: DateTime<Utc>,
    pub endpoint: String,
    pub method: String,
    pub code: String,
    pub http_status: Option<u16>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Rolling request counters, persisted after every call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsSnapshot {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub requests_today: u64,
    /// Day `requests_today` refers to.
    pub stats_date: NaiveDate,
    pub avg_response_time_ms: f64,
    pub min_response_time_ms: Option<u64>,
    pub max_response_time_ms: Option<u64>,
    pub response_time_samples: VecDeque<u64>,
    pub uptime_percentage: f64,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub error_patterns: BTreeMap<String, u64>,
    pub endpoint_stats: BTreeMap<String, EndpointStats>,
    pub recent_errors: VecDeque<ErrorRecord>,
}

impl AnalyticsSnapshot {
    pub fn new(today: NaiveDate) -> Self {
        Self {
            total_requests: 0,
            successful_requests: 0,
            failed_requests: 0,
            requests_today: 0,
            stats_date: today,
            avg_response_time_ms: 0.0,
            min_response_time_ms: None,
            max_response_time_ms: None,
            response_time_samples: VecDeque::new(),
            uptime_percentage: 100.0,
            last_success_at: None,
            last_failure_at: None,
            error_patterns: BTreeMap::new(),
            endpoint_stats: BTreeMap::new(),
            recent_errors: VecDeque::new(),
        }
    }

    /// Success rate in percent; 100 when nothing has been recorded yet.
    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            100.0
        } else {
            self.successful_requests as f64 / self.total_requests as f64 * 100.0
        }
    }

    /// Resets the daily counters when `today` is a different day than the stored one.
    pub fn roll_day(&mut self, today: NaiveDate) {
        if self.stats_date != today {
            self.stats_date = today;
            self.requests_today = 0;
        }
    }

    /// Folds one outcome into the counters.
    pub fn apply(&mut self, outcome: &RequestOutcome, now: DateTime<Utc>) {
        self.roll_day(now.date_naive());

        self.total_requests += 1;
        self.requests_today += 1;

        if outcome.success {
            self.successful_requests += 1;
            self.last_success_at = Some(now);
        } else {
            self.failed_requests += 1;
            self.last_failure_at = Some(now);
            let code = outcome
                .error_code
                .clone()
                .unwrap_or_else(|| "unknown".to_string());
            *self.error_patterns.entry(code.clone()).or_insert(0) += 1;

            self.recent_errors.push_back(ErrorRecord {
                at: now,
                endpoint: outcome.endpoint.clone(),
                method: outcome.method.clone(),
                code,
                http_status: outcome.http_status,
                message: outcome.error_message.clone(),
            });
            while self.recent_errors.len() > MAX_RECENT_ERRORS {
                self.recent_errors.pop_front();
            }
        }

        self.response_time_samples.push_back(outcome.duration_ms);
        while self.response_time_samples.len() > MAX_RESPONSE_TIME_SAMPLES {
            self.response_time_samples.pop_front();
        }
        self.avg_response_time_ms = mean(&self.response_time_samples);
        self.min_response_time_ms = Some(
            self.min_response_time_ms
                .map_or(outcome.duration_ms, |min| min.min(outcome.duration_ms)),
        );
        self.max_response_time_ms = Some(
            self.max_response_time_ms
                .map_or(outcome.duration_ms, |max| max.max(outcome.duration_ms)),
        );
        self.uptime_percentage = self.success_rate();

        let stats = self.endpoint_stats.entry(outcome.endpoint_key()).or_default();
        stats.calls += 1;
        if outcome.success {
            stats.successes += 1;
        } else {
            stats.failures += 1;
        }
        stats.avg_response_time_ms +=
            (outcome.duration_ms as f64 - stats.avg_response_time_ms) / stats.calls as f64;
    }
}

/// Latency and drop history of the transport, independent of HTTP status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionQuality {
    pub latency_samples: VecDeque<u64>,
    pub attempts: u64,
    pub drops: u64,
    pub stability_score: f64,
    pub last_checked_at: Option<DateTime<Utc>>,
}

impl Default for ConnectionQuality {
    fn default() -> Self {
        Self {
            latency_samples: VecDeque::new(),
            attempts: 0,
            drops: 0,
            stability_score: 100.0,
            last_checked_at: None,
        }
    }
}

impl ConnectionQuality {
    /// Records one transport attempt. Stability is recomputed only when the attempt dropped.
    pub fn record_attempt(&mut self, duration_ms: u64, dropped: bool, now: DateTime<Utc>) {
        self.attempts += 1;
        self.last_checked_at = Some(now);

        self.latency_samples.push_back(duration_ms);
        while self.latency_samples.len() > MAX_CONNECTION_SAMPLES {
            self.latency_samples.pop_front();
        }

        if dropped {
            self.drops += 1;
            self.stability_score = (100.0 - 2.0 * self.drop_rate_percent()).max(0.0);
        }
    }

    pub fn drop_rate_percent(&self) -> f64 {
        if self.attempts == 0 {
            0.0
        } else {
            self.drops as f64 / self.attempts as f64 * 100.0
        }
    }

    pub fn avg_latency_ms(&self) -> f64 {
        mean(&self.latency_samples)
    }

    /// Combined 0-100 score of stability and recent latency.
    pub fn quality_score(&self) -> u8 {
        let latency_score = (100.0 - self.avg_latency_ms() / 50.0).clamp(0.0, 100.0);
        ((self.stability_score + latency_score) / 2.0).round() as u8
    }
}

fn mean(samples: &VecDeque<u64>) -> f64 {
    if samples.is_empty() {
        0.0
    } else {
        samples.iter().sum::<u64>() as f64 / samples.len() as f64
    }
}

// ============ Health ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Pass,
    Warn,
    Fail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckName {
    Connectivity,
    Authentication,
    RateLimiting,
    Performance,
    TransportSecurity,
}

impl CheckName {
    pub const ALL: [CheckName; 5] = [
        CheckName::Connectivity,
        CheckName::Authentication,
        CheckName::RateLimiting,
        CheckName::Performance,
        CheckName::TransportSecurity,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CheckName::Connectivity => "connectivity",
            CheckName::Authentication => "authentication",
            CheckName::RateLimiting => "rate_limiting",
            CheckName::Performance => "performance",
            CheckName::TransportSecurity => "transport_security",
        }
    }
}

/// Result of a single health check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    pub status: CheckStatus,
    pub detail: String,
}

impl CheckResult {
    pub fn pass(detail: impl Into<String>) -> Self {
        Self { status: CheckStatus::Pass, detail: detail.into() }
    }

    pub fn warn(detail: impl Into<String>) -> Self {
        Self { status: CheckStatus::Warn, detail: detail.into() }
    }

    pub fn fail(detail: impl Into<String>) -> Self {
        Self { status: CheckStatus::Fail, detail: detail.into() }
    }
}

/// Scored outcome of a health check run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub score: u8,
    pub checks: BTreeMap<CheckName, CheckResult>,
    pub recommendations: Vec<String>,
    pub generated_at: DateTime<Utc>,
}
