//! Per-endpoint-class fixed-window rate limiting.
//!
//! Buckets live in the shared [`StateStore`] and are read-modify-written on
//! every admission, so two concurrent invocations may both pass the check
//! before either persists. The local counter only exists to fail fast;
//! [`RateLimiter::reconcile`] overwrites it with the server's numbers after
//! every response that carries rate-limit headers.

use crate::config::RateLimitBudgets;
use crate::models::{Limit, RateLimitBucket, RateLimitContext, MAX_WINDOW_SECONDS};
use crate::state_store::{load_json, save_json, StateStore};
use chrono::{DateTime, Utc};
use regex::Regex;
use reqwest::Method;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

/// Extra lifetime given to stored buckets past their window.
const BUCKET_TTL_GRACE: Duration = Duration::from_secs(300);

struct ContextRule {
    method: Option<Method>,
    pattern: Regex,
    context: RateLimitContext,
    specificity: u8,
}

static CONTEXT_RULES: OnceLock<Vec<ContextRule>> = OnceLock::new();

fn context_rules() -> &'static [ContextRule] {
    CONTEXT_RULES.get_or_init(|| {
        vec![
            ContextRule {
                method: Some(Method::POST),
                pattern: Regex::new(r"^(/v\d+)?/events/?$").unwrap(),
                context: RateLimitContext::EventsPost,
                specificity: 3,
            },
            ContextRule {
                method: Some(Method::GET),
                pattern: Regex::new(r"^(/v\d+)?/events(/|$)").unwrap(),
                context: RateLimitContext::EventsGet,
                specificity: 3,
            },
            ContextRule {
                method: Some(Method::PUT),
                pattern: Regex::new(r"^(/v\d+)?/people/[^/]+/?$").unwrap(),
                context: RateLimitContext::PeoplePut,
                specificity: 3,
            },
            ContextRule {
                method: None,
                pattern: Regex::new(r"^(/v\d+)?/notes(/|$)").unwrap(),
                context: RateLimitContext::Notes,
                specificity: 2,
            },
        ]
    })
}

/// Maps an endpoint path and method to its rate-limit context.
///
/// Query strings are ignored. The most specific matching rule wins; paths
/// no rule matches fall back to [`RateLimitContext::Global`].
pub fn resolve_context(endpoint: &str, method: &Method) -> RateLimitContext {
    let path = endpoint.split('?').next().unwrap_or_default();
    let path = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path)
    };

    context_rules()
        .iter()
        .filter(|rule| rule.method.as_ref().map_or(true, |m| m == method))
        .filter(|rule| rule.pattern.is_match(&path))
        .max_by_key(|rule| rule.specificity)
        .map(|rule| rule.context)
        .unwrap_or(RateLimitContext::Global)
}

/// Result of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    pub allowed: bool,
    /// Seconds until the window resets; zero when allowed.
    pub wait_seconds: u64,
}

impl Admission {
    fn allowed() -> Self {
        Self { allowed: true, wait_seconds: 0 }
    }
}

pub struct RateLimiter {
    store: Arc<dyn StateStore>,
    budgets: RateLimitBudgets,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn StateStore>, budgets: RateLimitBudgets) -> Self {
        Self { store, budgets }
    }

    fn key(context: RateLimitContext) -> String {
        format!("ratelimit:{}", context)
    }

    /// Checks the budget of `context` and consumes one unit if allowed.
    pub async fn admit(&self, context: RateLimitContext) -> Admission {
        self.admit_at(context, Utc::now()).await
    }

    pub async fn admit_at(&self, context: RateLimitContext, now: DateTime<Utc>) -> Admission {
        let mut bucket = self.load(context, now).await;
        let was_reset = bucket.reset_if_elapsed(now);

        match bucket.limit {
            Limit::Unlimited => return Admission::allowed(),
            Limit::Limited(limit) if bucket.used >= limit => {
                if was_reset {
                    // A zero limit stays exhausted even in a fresh window
                    self.save(&bucket).await;
                }
                let wait_seconds = bucket.seconds_until_reset(now);
                tracing::warn!(
                    "Rate limit reached for '{}' ({}/{}), resets in {}s",
                    context,
                    bucket.used,
                    limit,
                    wait_seconds
                );
                return Admission { allowed: false, wait_seconds };
            }
            Limit::Limited(_) => {}
        }

        bucket.used += 1;
        self.save(&bucket).await;
        Admission::allowed()
    }

    /// Overwrites local state with the limits the server reported.
    pub async fn reconcile(
        &self,
        context: RateLimitContext,
        limit: u32,
        remaining: u32,
        window_seconds: u64,
    ) -> RateLimitBucket {
        self.reconcile_at(context, limit, remaining, window_seconds, Utc::now())
            .await
    }

    pub async fn reconcile_at(
        &self,
        context: RateLimitContext,
        limit: u32,
        remaining: u32,
        window_seconds: u64,
        now: DateTime<Utc>,
    ) -> RateLimitBucket {
        let mut bucket = RateLimitBucket::new(context, Limit::Limited(limit), window_seconds, now);
        bucket.used = limit.saturating_sub(remaining);

        tracing::debug!(
            "Reconciled '{}' with server: {}/{} used, window {}s",
            context,
            bucket.used,
            limit,
            window_seconds
        );
        self.save(&bucket).await;
        bucket
    }

    /// Current bucket for `context`, as the next admission would see it.
    pub async fn bucket(&self, context: RateLimitContext) -> RateLimitBucket {
        let now = Utc::now();
        let mut bucket = self.load(context, now).await;
        bucket.reset_if_elapsed(now);
        bucket
    }

    /// All buckets, in context order.
    pub async fn buckets(&self) -> Vec<RateLimitBucket> {
        let mut buckets = Vec::with_capacity(RateLimitContext::ALL.len());
        for context in RateLimitContext::ALL {
            buckets.push(self.bucket(context).await);
        }
        buckets
    }

    /// Configured window for `context`, used when the server omits one.
    pub fn default_window(&self, context: RateLimitContext) -> u64 {
        self.budgets.for_context(context).window_seconds
    }

    /// Persisted bucket, or a fresh one from the configured budget.
    ///
    /// Store failures are logged and treated as an empty bucket: accounting
    /// is advisory and must not block the call.
    async fn load(&self, context: RateLimitContext, now: DateTime<Utc>) -> RateLimitBucket {
        match load_json::<RateLimitBucket>(self.store.as_ref(), &Self::key(context)).await {
            Ok(Some(bucket)) => bucket,
            Ok(None) => self.fresh_bucket(context, now),
            Err(e) => {
                tracing::warn!("Could not load rate limit bucket '{}': {}", context, e);
                self.fresh_bucket(context, now)
            }
        }
    }

    fn fresh_bucket(&self, context: RateLimitContext, now: DateTime<Utc>) -> RateLimitBucket {
        let budget = self.budgets.for_context(context);
        RateLimitBucket::new(context, budget.limit, budget.window_seconds, now)
    }

    async fn save(&self, bucket: &RateLimitBucket) {
        let ttl = Duration::from_secs(bucket.window_seconds.min(MAX_WINDOW_SECONDS))
            .saturating_add(BUCKET_TTL_GRACE);
        if let Err(e) = save_json(self.store.as_ref(), &Self::key(bucket.context), bucket, ttl).await {
            tracing::warn!("Could not persist rate limit bucket '{}': {}", bucket.context, e);
        }
    }

    #[cfg(test)]
    pub(crate) async fn put_bucket(&self, bucket: &RateLimitBucket) {
        self.save(bucket).await;
    }
}
