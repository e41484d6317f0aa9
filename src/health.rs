//! Composite health check of the CRM integration.
//!
//! Five independent checks each yield Pass, Warn or Fail. The score is the
//! share of passing checks; warnings count as not passed.

use crate::config::HealthThresholds;
use crate::models::{
    AnalyticsSnapshot, CheckName, CheckResult, CheckStatus, HealthReport, HealthStatus,
    RateLimitBucket,
};
use crate::state_store::{load_json, save_json, StateStore};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

const HISTORY_KEY: &str = "health:history";
const HISTORY_RETENTION_HOURS: i64 = 24;
/// Newest reports kept regardless of age.
pub const DEFAULT_HISTORY_MAX_ENTRIES: usize = 500;

/// Result of the live connectivity round-trip.
#[derive(Debug, Clone, PartialEq)]
pub enum ProbeResult {
    /// The identity endpoint answered with a success status.
    Succeeded { duration_ms: u64 },
    /// The CRM answered, but not with success.
    Rejected { status: u16, message: String },
    /// The probe never got a response.
    Unreachable { message: String },
    /// The local rate limiter refused the probe.
    Throttled { wait_seconds: u64 },
}

pub fn check_connectivity(probe: &ProbeResult, thresholds: &HealthThresholds) -> CheckResult {
    match probe {
        ProbeResult::Succeeded { duration_ms } if *duration_ms <= thresholds.connectivity_budget_ms => {
            CheckResult::pass(format!("Identity endpoint answered in {}ms", duration_ms))
        }
        ProbeResult::Succeeded { duration_ms } => CheckResult::warn(format!(
            "Identity endpoint answered in {}ms (budget {}ms)",
            duration_ms, thresholds.connectivity_budget_ms
        )),
        ProbeResult::Rejected { status, message } => {
            CheckResult::warn(format!("CRM reachable but answered {}: {}", status, message))
        }
        ProbeResult::Throttled { wait_seconds } => CheckResult::warn(format!(
            "Probe skipped, local rate limit resets in {}s",
            wait_seconds
        )),
        ProbeResult::Unreachable { message } => {
            CheckResult::fail(format!("CRM unreachable: {}", message))
        }
    }
}

pub fn check_authentication(
    token_configured: bool,
    probe: &ProbeResult,
    last_success_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    thresholds: &HealthThresholds,
) -> CheckResult {
    if !token_configured {
        return CheckResult::fail("No API token configured");
    }
    if let ProbeResult::Rejected { status: status @ (401 | 403), .. } = probe {
        return CheckResult::fail(format!("CRM rejected the credentials ({})", status));
    }

    let window = chrono::Duration::from_std(thresholds.auth_recent_success)
        .unwrap_or_else(|_| chrono::Duration::hours(1));
    match last_success_at {
        Some(at) if now - at <= window => {
            CheckResult::pass(format!("Last successful request at {}", at.to_rfc3339()))
        }
        Some(at) => CheckResult::warn(format!(
            "No successful request since {}",
            at.to_rfc3339()
        )),
        None => CheckResult::warn("No successful request recorded yet"),
    }
}

pub fn check_rate_limiting(buckets: &[RateLimitBucket], thresholds: &HealthThresholds) -> CheckResult {
    let busiest = buckets
        .iter()
        .filter_map(|bucket| bucket.utilization().map(|u| (bucket, u)))
        .max_by(|a, b| a.1.total_cmp(&b.1));

    match busiest {
        Some((bucket, utilization)) if utilization >= 100.0 => CheckResult::fail(format!(
            "Budget for '{}' exhausted ({:.0}%)",
            bucket.context, utilization
        )),
        Some((bucket, utilization)) if utilization > thresholds.rate_limit_warn_utilization => {
            CheckResult::warn(format!(
                "Budget for '{}' at {:.0}%",
                bucket.context, utilization
            ))
        }
        Some((bucket, utilization)) => CheckResult::pass(format!(
            "Highest utilization '{}' at {:.0}%",
            bucket.context, utilization
        )),
        None => CheckResult::pass("No limited buckets"),
    }
}

pub fn check_performance(snapshot: &AnalyticsSnapshot, thresholds: &HealthThresholds) -> CheckResult {
    if snapshot.total_requests == 0 {
        return CheckResult::pass("No traffic recorded yet");
    }

    let avg = snapshot.avg_response_time_ms;
    let success_rate = snapshot.success_rate();
    let detail = format!("Average {:.0}ms, success rate {:.1}%", avg, success_rate);

    if avg < thresholds.max_avg_response_ms && success_rate >= thresholds.min_success_rate {
        CheckResult::pass(detail)
    } else if avg < thresholds.warn_avg_response_ms && success_rate >= thresholds.warn_success_rate {
        CheckResult::warn(detail)
    } else {
        CheckResult::fail(detail)
    }
}

pub fn check_transport_security(base_url: &Url, enforce_tls: bool) -> CheckResult {
    match (base_url.scheme(), enforce_tls) {
        ("https", true) => CheckResult::pass("HTTPS enforced for every request"),
        ("https", false) => {
            CheckResult::warn("Base URL is HTTPS but the client does not enforce TLS")
        }
        (scheme, _) => CheckResult::fail(format!("CRM traffic uses plain {}", scheme)),
    }
}

/// Fixed remediation hints per check.
pub fn recommendations_for(name: CheckName, status: CheckStatus) -> &'static [&'static str] {
    match (name, status) {
        (_, CheckStatus::Pass) => &[],
        (CheckName::Connectivity, CheckStatus::Warn) => &[
            "CRM responds slowly or with errors; check the provider status page",
        ],
        (CheckName::Connectivity, CheckStatus::Fail) => &[
            "Verify outbound network access and DNS resolution for the CRM host",
            "Confirm the configured base URL is correct",
        ],
        (CheckName::Authentication, CheckStatus::Warn) => &[
            "No recent successful call; confirm the integration is receiving traffic",
        ],
        (CheckName::Authentication, CheckStatus::Fail) => &[
            "Check that the API token is set and has not been revoked",
            "Regenerate the API key in the CRM admin and update CRM_API_TOKEN",
        ],
        (CheckName::RateLimiting, CheckStatus::Warn) => &[
            "Usage is close to the rate budget; spread requests or batch updates",
        ],
        (CheckName::RateLimiting, CheckStatus::Fail) => &[
            "A rate budget is exhausted; reduce request volume until the window resets",
            "Review callers for polling loops or duplicate syncs",
        ],
        (CheckName::Performance, CheckStatus::Warn) => &[
            "Response times or success rate are degrading; review recent error patterns",
        ],
        (CheckName::Performance, CheckStatus::Fail) => &[
            "Response times or success rate are below acceptable levels",
            "Inspect recent errors in diagnostics for the dominant failure code",
        ],
        (CheckName::TransportSecurity, CheckStatus::Warn) => &[
            "Enable CRM_ENFORCE_TLS so requests never fall back to plain HTTP",
        ],
        (CheckName::TransportSecurity, CheckStatus::Fail) => &[
            "Use an https:// base URL for the CRM API",
        ],
    }
}

/// Scores a set of checks into a report.
pub fn build_report(checks: BTreeMap<CheckName, CheckResult>, now: DateTime<Utc>) -> HealthReport {
    let passed = checks
        .values()
        .filter(|check| check.status == CheckStatus::Pass)
        .count();
    let score = (passed as f64 / CheckName::ALL.len() as f64 * 100.0).round() as u8;

    let status = if score >= 90 {
        HealthStatus::Healthy
    } else if score >= 70 {
        HealthStatus::Warning
    } else {
        HealthStatus::Critical
    };

    let recommendations = checks
        .iter()
        .flat_map(|(name, check)| recommendations_for(*name, check.status))
        .map(|s| s.to_string())
        .collect();

    HealthReport {
        status,
        score,
        checks,
        recommendations,
        generated_at: now,
    }
}

/// Rolling history of health reports, pruned beyond 24 hours and beyond
/// `max_entries` reports.
pub struct HealthHistory {
    store: Arc<dyn StateStore>,
    max_entries: usize,
}

impl HealthHistory {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self {
            store,
            max_entries: DEFAULT_HISTORY_MAX_ENTRIES,
        }
    }

    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries.max(1);
        self
    }

    pub async fn append(&self, report: &HealthReport) {
        let mut entries = self.entries_at(report.generated_at).await;
        entries.push(report.clone());
        if entries.len() > self.max_entries {
            let excess = entries.len() - self.max_entries;
            entries.drain(..excess);
        }

        let ttl = Duration::from_secs(HISTORY_RETENTION_HOURS as u64 * 3600);
        if let Err(e) = save_json(self.store.as_ref(), HISTORY_KEY, &entries, ttl).await {
            tracing::warn!("Could not persist health history: {}", e);
        }
    }

    pub async fn entries(&self) -> Vec<HealthReport> {
        self.entries_at(Utc::now()).await
    }

    /// Newest report, if it was generated less than `max_age` ago.
    pub async fn latest_within(&self, max_age: Duration, now: DateTime<Utc>) -> Option<HealthReport> {
        let max_age = chrono::Duration::from_std(max_age).ok()?;
        self.entries_at(now)
            .await
            .pop()
            .filter(|report| now - report.generated_at < max_age)
    }

    async fn entries_at(&self, now: DateTime<Utc>) -> Vec<HealthReport> {
        let entries: Vec<HealthReport> = match load_json(self.store.as_ref(), HISTORY_KEY).await {
            Ok(entries) => entries.unwrap_or_default(),
            Err(e) => {
                tracing::warn!("Could not load health history: {}", e);
                Vec::new()
            }
        };

        let cutoff = now - chrono::Duration::hours(HISTORY_RETENTION_HOURS);
        entries
            .into_iter()
            .filter(|report| report.generated_at > cutoff)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Limit, RateLimitContext, RequestOutcome};
    use crate::state_store::MokaStateStore;

    fn all_with(status: CheckStatus) -> BTreeMap<CheckName, CheckResult> {
        CheckName::ALL
            .into_iter()
            .map(|name| {
                (
                    name,
                    CheckResult {
                        status,
                        detail: String::new(),
                    },
                )
            })
            .collect()
    }

    #[test]
    fn test_all_passing_is_healthy() {
        let report = build_report(all_with(CheckStatus::Pass), Utc::now());
        assert_eq!(report.status, HealthStatus::Healthy);
        assert_eq!(report.score, 100);
        assert!(report.recommendations.is_empty());
    }

    #[test]
    fn test_two_failures_is_critical() {
        let mut checks = all_with(CheckStatus::Pass);
        checks.insert(CheckName::Connectivity, CheckResult::fail("down"));
        checks.insert(CheckName::Performance, CheckResult::fail("slow"));

        let report = build_report(checks, Utc::now());
        assert_eq!(report.status, HealthStatus::Critical);
        assert_eq!(report.score, 60);
        assert_eq!(report.recommendations.len(), 4);
    }

    #[test]
    fn test_one_warning_is_warning() {
        let mut checks = all_with(CheckStatus::Pass);
        checks.insert(CheckName::RateLimiting, CheckResult::warn("busy"));

        let report = build_report(checks, Utc::now());
        assert_eq!(report.score, 80);
        assert_eq!(report.status, HealthStatus::Warning);
        assert_eq!(report.recommendations.len(), 1);
    }

    #[test]
    fn test_connectivity_check() {
        let thresholds = HealthThresholds::default();
        let ok = check_connectivity(&ProbeResult::Succeeded { duration_ms: 120 }, &thresholds);
        assert_eq!(ok.status, CheckStatus::Pass);

        let slow = check_connectivity(&ProbeResult::Succeeded { duration_ms: 9_000 }, &thresholds);
        assert_eq!(slow.status, CheckStatus::Warn);

        let down = check_connectivity(
            &ProbeResult::Unreachable { message: "connection refused".to_string() },
            &thresholds,
        );
        assert_eq!(down.status, CheckStatus::Fail);
    }

    #[test]
    fn test_authentication_check() {
        let thresholds = HealthThresholds::default();
        let now = Utc::now();
        let probe = ProbeResult::Succeeded { duration_ms: 50 };

        let recent = check_authentication(true, &probe, Some(now), now, &thresholds);
        assert_eq!(recent.status, CheckStatus::Pass);

        let stale = check_authentication(
            true,
            &probe,
            Some(now - chrono::Duration::hours(2)),
            now,
            &thresholds,
        );
        assert_eq!(stale.status, CheckStatus::Warn);

        let missing = check_authentication(false, &probe, Some(now), now, &thresholds);
        assert_eq!(missing.status, CheckStatus::Fail);

        let rejected = ProbeResult::Rejected { status: 401, message: "unauthorized".to_string() };
        let revoked = check_authentication(true, &rejected, Some(now), now, &thresholds);
        assert_eq!(revoked.status, CheckStatus::Fail);
    }

    #[test]
    fn test_rate_limiting_check() {
        let thresholds = HealthThresholds::default();
        let now = Utc::now();
        let mut notes = RateLimitBucket::new(RateLimitContext::Notes, Limit::Limited(10), 10, now);
        let events = RateLimitBucket::new(RateLimitContext::EventsPost, Limit::Unlimited, 10, now);

        notes.used = 9;
        assert_eq!(
            check_rate_limiting(&[notes.clone(), events.clone()], &thresholds).status,
            CheckStatus::Pass
        );

        let mut people = RateLimitBucket::new(RateLimitContext::PeoplePut, Limit::Limited(25), 10, now);
        people.used = 24;
        assert_eq!(
            check_rate_limiting(&[notes.clone(), people], &thresholds).status,
            CheckStatus::Warn
        );

        notes.used = 10;
        assert_eq!(check_rate_limiting(&[notes], &thresholds).status, CheckStatus::Fail);
        assert_eq!(check_rate_limiting(&[events], &thresholds).status, CheckStatus::Pass);
    }

    #[test]
    fn test_performance_check() {
        let thresholds = HealthThresholds::default();
        let now = Utc::now();
        let mut snapshot = AnalyticsSnapshot::new(now.date_naive());
        assert_eq!(check_performance(&snapshot, &thresholds).status, CheckStatus::Pass);

        let outcome = |success: bool, duration_ms: u64| RequestOutcome {
            endpoint: "/people".to_string(),
            method: "GET".to_string(),
            started_at: now,
            duration_ms,
            http_status: Some(200),
            success,
            retry_count: 0,
            error_code: None,
            error_message: None,
        };

        for _ in 0..9 {
            snapshot.apply(&outcome(true, 300), now);
        }
        snapshot.apply(&outcome(false, 300), now);
        assert_eq!(check_performance(&snapshot, &thresholds).status, CheckStatus::Pass);

        snapshot.apply(&outcome(false, 300), now);
        // 9/11 = 81.8%
        assert_eq!(check_performance(&snapshot, &thresholds).status, CheckStatus::Warn);

        for _ in 0..20 {
            snapshot.apply(&outcome(false, 9_000), now);
        }
        assert_eq!(check_performance(&snapshot, &thresholds).status, CheckStatus::Fail);
    }

    #[test]
    fn test_transport_security_check() {
        let https = Url::parse("https://api.example-crm.com/v1").unwrap();
        let http = Url::parse("http://api.example-crm.com/v1").unwrap();

        assert_eq!(check_transport_security(&https, true).status, CheckStatus::Pass);
        assert_eq!(check_transport_security(&https, false).status, CheckStatus::Warn);
        assert_eq!(check_transport_security(&http, false).status, CheckStatus::Fail);
    }

    #[tokio::test]
    async fn test_history_prunes_old_reports() {
        let history = HealthHistory::new(Arc::new(MokaStateStore::default()));
        let now = Utc::now();

        history
            .append(&build_report(all_with(CheckStatus::Pass), now - chrono::Duration::hours(30)))
            .await;
        history
            .append(&build_report(all_with(CheckStatus::Fail), now - chrono::Duration::hours(2)))
            .await;
        history.append(&build_report(all_with(CheckStatus::Pass), now)).await;

        let entries = history.entries().await;
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].status, HealthStatus::Critical);
    }

    #[tokio::test]
    async fn test_history_keeps_newest_entries() {
        let history = HealthHistory::new(Arc::new(MokaStateStore::default())).with_max_entries(5);
        let start = Utc::now() - chrono::Duration::minutes(30);

        for minute in 0..12 {
            let at = start + chrono::Duration::minutes(minute);
            history.append(&build_report(all_with(CheckStatus::Pass), at)).await;
        }

        let entries = history.entries().await;
        assert_eq!(entries.len(), 5);
        assert_eq!(entries[0].generated_at, start + chrono::Duration::minutes(7));
        assert_eq!(entries[4].generated_at, start + chrono::Duration::minutes(11));
    }

    #[tokio::test]
    async fn test_latest_within_ignores_stale_reports() {
        let history = HealthHistory::new(Arc::new(MokaStateStore::default()));
        let now = Utc::now();
        assert!(history.latest_within(Duration::from_secs(30), now).await.is_none());

        let report = build_report(all_with(CheckStatus::Pass), now - chrono::Duration::seconds(10));
        history.append(&report).await;

        assert_eq!(history.latest_within(Duration::from_secs(30), now).await, Some(report));
        assert!(history.latest_within(Duration::from_secs(5), now).await.is_none());
    }
}
