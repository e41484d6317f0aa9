//! Operator-facing snapshot of the client's state.

use crate::config::ConfigSummary;
use crate::models::{
    AnalyticsSnapshot, ConnectionQuality, ErrorRecord, HealthReport, Limit, RateLimitBucket,
    RateLimitContext,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Serialize)]
pub struct RateLimitStatus {
    pub context: RateLimitContext,
    pub limit: Limit,
    pub used: u32,
    /// `None` for unlimited contexts.
    pub remaining: Option<u32>,
    pub window_seconds: u64,
    pub reset_in_seconds: u64,
    pub utilization_percent: Option<f64>,
}

impl RateLimitStatus {
    fn from_bucket(bucket: &RateLimitBucket, now: DateTime<Utc>) -> Self {
        Self {
            context: bucket.context,
            limit: bucket.limit,
            used: bucket.used,
            remaining: match bucket.limit {
                Limit::Limited(limit) => Some(limit.saturating_sub(bucket.used)),
                Limit::Unlimited => None,
            },
            window_seconds: bucket.window_seconds,
            reset_in_seconds: bucket.seconds_until_reset(now),
            utilization_percent: bucket.utilization(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionReport {
    pub quality_score: u8,
    pub stability_score: f64,
    pub avg_latency_ms: f64,
    pub drop_rate_percent: f64,
    pub attempts: u64,
    pub drops: u64,
    pub last_checked_at: Option<DateTime<Utc>>,
}

impl From<&ConnectionQuality> for ConnectionReport {
    fn from(quality: &ConnectionQuality) -> Self {
        Self {
            quality_score: quality.quality_score(),
            stability_score: quality.stability_score,
            avg_latency_ms: quality.avg_latency_ms(),
            drop_rate_percent: quality.drop_rate_percent(),
            attempts: quality.attempts,
            drops: quality.drops,
            last_checked_at: quality.last_checked_at,
        }
    }
}

/// State store statistics.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub backend: &'static str,
    pub entry_count: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalyticsSummary {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub requests_today: u64,
    pub success_rate: f64,
    pub avg_response_time_ms: f64,
    pub min_response_time_ms: Option<u64>,
    pub max_response_time_ms: Option<u64>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
}

impl From<&AnalyticsSnapshot> for AnalyticsSummary {
    fn from(snapshot: &AnalyticsSnapshot) -> Self {
        Self {
            total_requests: snapshot.total_requests,
            successful_requests: snapshot.successful_requests,
            failed_requests: snapshot.failed_requests,
            requests_today: snapshot.requests_today,
            success_rate: snapshot.success_rate(),
            avg_response_time_ms: snapshot.avg_response_time_ms,
            min_response_time_ms: snapshot.min_response_time_ms,
            max_response_time_ms: snapshot.max_response_time_ms,
            last_success_at: snapshot.last_success_at,
            last_failure_at: snapshot.last_failure_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Diagnostics {
    pub generated_at: DateTime<Utc>,
    pub configuration: ConfigSummary,
    pub rate_limits: Vec<RateLimitStatus>,
    /// Newest first.
    pub recent_errors: Vec<ErrorRecord>,
    pub error_patterns: BTreeMap<String, u64>,
    pub connection: ConnectionReport,
    pub cache: CacheStats,
    pub analytics: AnalyticsSummary,
    pub last_health: Option<HealthReport>,
}

impl Diagnostics {
    pub fn assemble(
        configuration: ConfigSummary,
        buckets: Vec<RateLimitBucket>,
        snapshot: &AnalyticsSnapshot,
        quality: ConnectionQuality,
        cache: CacheStats,
        last_health: Option<HealthReport>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            generated_at: now,
            configuration,
            rate_limits: buckets
                .iter()
                .map(|bucket| RateLimitStatus::from_bucket(bucket, now))
                .collect(),
            recent_errors: snapshot.recent_errors.iter().rev().cloned().collect(),
            error_patterns: snapshot.error_patterns.clone(),
            connection: ConnectionReport::from(&quality),
            cache,
            analytics: AnalyticsSummary::from(snapshot),
            last_health,
        }
    }
}
