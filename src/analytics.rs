//! Rolling request analytics and connection quality.
//!
//! Both records are read-modify-written in the state store on every call.
//! A store failure is logged and skipped; analytics never fail a request.

use crate::models::{AnalyticsSnapshot, ConnectionQuality, RateLimitContext, RequestOutcome};
use crate::state_store::{load_json, save_json, StateStore};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

const SNAPSHOT_KEY: &str = "analytics:snapshot";
const CONNECTION_KEY: &str = "analytics:connection_quality";
const ANALYTICS_TTL: Duration = Duration::from_secs(30 * 24 * 3600);

pub struct Analytics {
    store: Arc<dyn StateStore>,
}

impl Analytics {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    /// Folds a finished request into the snapshot.
    pub async fn record_outcome(&self, outcome: &RequestOutcome) {
        self.record_outcome_at(outcome, Utc::now()).await
    }

    pub async fn record_outcome_at(&self, outcome: &RequestOutcome, now: DateTime<Utc>) {
        let mut snapshot = self.load_snapshot(now).await;
        snapshot.apply(outcome, now);
        self.persist(SNAPSHOT_KEY, &snapshot).await;

        if outcome.success {
            tracing::debug!(
                "Recorded {} {} ({}ms, {} retries)",
                outcome.method,
                outcome.endpoint,
                outcome.duration_ms,
                outcome.retry_count
            );
        } else {
            tracing::debug!(
                "Recorded failed {} {}: {:?}",
                outcome.method,
                outcome.endpoint,
                outcome.error_code
            );
        }
    }

    /// Counts a local rate-limit refusal. No request reached the network,
    /// so only the error pattern is incremented.
    pub async fn record_local_refusal(&self, context: RateLimitContext) {
        let now = Utc::now();
        let mut snapshot = self.load_snapshot(now).await;
        *snapshot
            .error_patterns
            .entry("local_rate_limit".to_string())
            .or_insert(0) += 1;
        self.persist(SNAPSHOT_KEY, &snapshot).await;
        tracing::debug!("Recorded local rate limit refusal for '{}'", context);
    }

    /// Records one transport attempt for connection quality.
    pub async fn record_attempt(&self, duration_ms: u64, dropped: bool) {
        let now = Utc::now();
        let mut quality = self.connection_quality().await;
        quality.record_attempt(duration_ms, dropped, now);
        if dropped {
            tracing::debug!(
                "Transport drop recorded, stability now {:.1}",
                quality.stability_score
            );
        }
        self.persist(CONNECTION_KEY, &quality).await;
    }

    pub async fn snapshot(&self) -> AnalyticsSnapshot {
        self.load_snapshot(Utc::now()).await
    }

    pub async fn connection_quality(&self) -> ConnectionQuality {
        match load_json::<ConnectionQuality>(self.store.as_ref(), CONNECTION_KEY).await {
            Ok(Some(quality)) => quality,
            Ok(None) => ConnectionQuality::default(),
            Err(e) => {
                tracing::warn!("Could not load connection quality: {}", e);
                ConnectionQuality::default()
            }
        }
    }

    /// Stored snapshot with the daily rollover applied.
    async fn load_snapshot(&self, now: DateTime<Utc>) -> AnalyticsSnapshot {
        let today = now.date_naive();
        let mut snapshot = match load_json::<AnalyticsSnapshot>(self.store.as_ref(), SNAPSHOT_KEY).await {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => AnalyticsSnapshot::new(today),
            Err(e) => {
                tracing::warn!("Could not load analytics snapshot: {}", e);
                AnalyticsSnapshot::new(today)
            }
        };
        snapshot.roll_day(today);
        snapshot
    }

    async fn persist<T: serde::Serialize + Sync>(&self, key: &str, value: &T) {
        if let Err(e) = save_json(self.store.as_ref(), key, value, ANALYTICS_TTL).await {
            tracing::warn!("Could not persist '{}': {}", key, e);
        }
    }
}
