//! Tiered admission control over a shared counter store.
//!
//! Each tier is an ordered list of quota rules. Admission walks the rules,
//! asking the store for one atomic compare-and-increment per rule; the first
//! rejection wins and any increments already applied in the same call are
//! handed back.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use jobstream_types::config::GlobalConfig;
use jobstream_types::error::{CounterStoreError, RateLimitExceeded};
use jobstream_types::usage::{
    CounterKey, QuotaGrant, QuotaRule, RemainingQuota, TierPolicy, UsageSnapshot,
};

use super::store::{CounterStore, IncrementOutcome};

/// Back-off suggested when a concurrency gauge is full.
pub const CONCURRENCY_RETRY_AFTER: Duration = Duration::from_secs(5);

/// Reasons admission can fail.
#[derive(Debug, thiserror::Error)]
pub enum AdmissionError {
    #[error(transparent)]
    Exceeded(#[from] RateLimitExceeded),

    #[error("unknown quota tier '{0}'")]
    UnknownTier(String),

    #[error(transparent)]
    Store(#[from] CounterStoreError),
}

/// Rate limiter keyed by (identity, tier).
pub struct TieredRateLimiter<C: CounterStore> {
    store: C,
    tiers: HashMap<String, TierPolicy>,
    assignments: HashMap<String, String>,
    default_tier: String,
}

impl<C: CounterStore> TieredRateLimiter<C> {
    pub fn new(store: C, tiers: Vec<TierPolicy>, default_tier: impl Into<String>) -> Self {
        Self {
            store,
            tiers: tiers.into_iter().map(|t| (t.name.clone(), t)).collect(),
            assignments: HashMap::new(),
            default_tier: default_tier.into(),
        }
    }

    /// Build from the `tiers`, `tier_assignments` and `default_tier` settings.
    pub fn from_config(store: C, config: &GlobalConfig) -> Self {
        let mut limiter = Self::new(store, config.tiers.clone(), config.default_tier.clone());
        limiter.assignments = config.tier_assignments.clone();
        limiter
    }

    pub fn with_assignment(mut self, identity: impl Into<String>, tier: impl Into<String>) -> Self {
        self.assignments.insert(identity.into(), tier.into());
        self
    }

    /// Tier assigned to `identity`, or the default tier.
    pub fn tier_for(&self, identity: &str) -> &str {
        self.assignments
            .get(identity)
            .map(String::as_str)
            .unwrap_or(&self.default_tier)
    }

    pub fn store(&self) -> &C {
        &self.store
    }

    pub async fn check_and_increment(
        &self,
        identity: &str,
        tier: &str,
        cost: u64,
        bypass: bool,
    ) -> Result<QuotaGrant, AdmissionError> {
        self.check_and_increment_at(identity, tier, cost, bypass, Utc::now())
            .await
    }

    /// Admission evaluated at an explicit instant.
    pub async fn check_and_increment_at(
        &self,
        identity: &str,
        tier: &str,
        cost: u64,
        bypass: bool,
        now: DateTime<Utc>,
    ) -> Result<QuotaGrant, AdmissionError> {
        if bypass {
            tracing::debug!(identity, tier, "quota bypassed");
            return Ok(QuotaGrant {
                bypassed: true,
                remaining: Vec::new(),
            });
        }

        let policy = self
            .tiers
            .get(tier)
            .ok_or_else(|| AdmissionError::UnknownTier(tier.to_string()))?;

        let mut applied: Vec<CounterKey> = Vec::with_capacity(policy.rules.len());
        let mut remaining = Vec::with_capacity(policy.rules.len());

        for rule in &policy.rules {
            let window = Window::containing(rule, now);
            let key = CounterKey::for_rule(identity, tier, rule, window.start_ts);

            let outcome = match self
                .store
                .try_increment(&key, cost, rule.limit, window.resets_at)
                .await
            {
                Ok(outcome) => outcome,
                Err(e) => {
                    self.compensate(&applied, cost).await;
                    return Err(e.into());
                }
            };

            match outcome {
                IncrementOutcome::Accepted { count } => {
                    applied.push(key);
                    remaining.push(RemainingQuota {
                        dimension: rule.dimension,
                        remaining: rule.limit.saturating_sub(count),
                        resets_at: window.resets_at,
                    });
                }
                IncrementOutcome::Rejected { count } => {
                    self.compensate(&applied, cost).await;

                    let retry_after = match window.resets_at {
                        Some(at) => (at - now)
                            .to_std()
                            .unwrap_or(Duration::ZERO)
                            .max(Duration::from_secs(1)),
                        None => CONCURRENCY_RETRY_AFTER,
                    };
                    tracing::info!(
                        identity,
                        tier,
                        dimension = %rule.dimension,
                        count,
                        limit = rule.limit,
                        retry_after_secs = retry_after.as_secs(),
                        "rate limit exceeded"
                    );
                    return Err(RateLimitExceeded {
                        identity: identity.to_string(),
                        tier: tier.to_string(),
                        dimension: rule.dimension,
                        retry_after,
                        usage: UsageSnapshot {
                            identity: identity.to_string(),
                            tier: tier.to_string(),
                            dimension: rule.dimension,
                            window_start: window.start,
                            count,
                            limit: rule.limit,
                        },
                    }
                    .into());
                }
            }
        }

        Ok(QuotaGrant {
            bypassed: false,
            remaining,
        })
    }

    /// Return `cost` to every concurrency gauge of `tier`.
    ///
    /// Windowed counters are left alone: a finished request still counts
    /// against its window.
    pub async fn release(&self, identity: &str, tier: &str, cost: u64) -> Result<(), AdmissionError> {
        let policy = self
            .tiers
            .get(tier)
            .ok_or_else(|| AdmissionError::UnknownTier(tier.to_string()))?;

        for rule in policy.rules.iter().filter(|r| r.window_secs.is_none()) {
            let key = CounterKey::for_rule(identity, tier, rule, 0);
            self.store.decrement(&key, cost).await?;
        }
        Ok(())
    }

    /// Current counter values for every rule of `tier`.
    pub async fn usage(
        &self,
        identity: &str,
        tier: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<UsageSnapshot>, AdmissionError> {
        let policy = self
            .tiers
            .get(tier)
            .ok_or_else(|| AdmissionError::UnknownTier(tier.to_string()))?;

        let mut snapshots = Vec::with_capacity(policy.rules.len());
        for rule in &policy.rules {
            let window = Window::containing(rule, now);
            let key = CounterKey::for_rule(identity, tier, rule, window.start_ts);
            snapshots.push(UsageSnapshot {
                identity: identity.to_string(),
                tier: tier.to_string(),
                dimension: rule.dimension,
                window_start: window.start,
                count: self.store.current(&key).await?,
                limit: rule.limit,
            });
        }
        Ok(snapshots)
    }

    async fn compensate(&self, applied: &[CounterKey], cost: u64) {
        for key in applied {
            if let Err(e) = self.store.decrement(key, cost).await {
                tracing::warn!(key = %key, error = %e, "failed to compensate quota increment");
            }
        }
    }
}

/// The fixed window a rule's counter falls in at a given instant.
struct Window {
    start_ts: i64,
    start: Option<DateTime<Utc>>,
    resets_at: Option<DateTime<Utc>>,
}

impl Window {
    fn containing(rule: &QuotaRule, now: DateTime<Utc>) -> Self {
        match rule.window_secs {
            Some(secs) if secs > 0 => {
                let len = secs as i64;
                let ts = now.timestamp();
                let start_ts = ts - ts.rem_euclid(len);
                Self {
                    start_ts,
                    start: Utc.timestamp_opt(start_ts, 0).single(),
                    resets_at: Utc.timestamp_opt(start_ts + len, 0).single(),
                }
            }
            _ => Self {
                start_ts: 0,
                start: None,
                resets_at: None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::InMemoryCounterStore;
    use chrono::Duration as ChronoDuration;
    use jobstream_types::usage::QuotaDimension;

    fn trial_tier() -> TierPolicy {
        TierPolicy {
            name: "trial".into(),
            rules: vec![QuotaRule::daily_requests(5)],
        }
    }

    fn limiter(tiers: Vec<TierPolicy>) -> TieredRateLimiter<InMemoryCounterStore> {
        TieredRateLimiter::new(InMemoryCounterStore::new(), tiers, "trial")
    }

    fn noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 18, 12, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn five_per_day_then_rejected_until_rollover() {
        let limiter = limiter(vec![trial_tier()]);
        let now = noon();

        for i in 0..5 {
            let grant = limiter
                .check_and_increment_at("acme", "trial", 1, false, now)
                .await
                .unwrap();
            assert_eq!(grant.remaining[0].remaining, 4 - i);
        }

        let err = limiter
            .check_and_increment_at("acme", "trial", 1, false, now)
            .await
            .unwrap_err();
        let AdmissionError::Exceeded(exceeded) = err else {
            panic!("expected RateLimitExceeded");
        };
        assert_eq!(exceeded.dimension, QuotaDimension::Requests);
        assert_eq!(exceeded.usage.count, 5);
        assert_eq!(exceeded.usage.limit, 5);
        assert_eq!(exceeded.retry_after, Duration::from_secs(12 * 3600));

        let tomorrow = now + ChronoDuration::days(1);
        assert!(
            limiter
                .check_and_increment_at("acme", "trial", 1, false, tomorrow)
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn retry_after_is_at_least_one_second() {
        let limiter = limiter(vec![trial_tier()]);
        let almost_midnight = Utc.with_ymd_and_hms(2026, 10, 18, 23, 59, 59).unwrap()
            + ChronoDuration::milliseconds(900);

        for _ in 0..5 {
            limiter
                .check_and_increment_at("acme", "trial", 1, false, almost_midnight)
                .await
                .unwrap();
        }
        let err = limiter
            .check_and_increment_at("acme", "trial", 1, false, almost_midnight)
            .await
            .unwrap_err();
        let AdmissionError::Exceeded(exceeded) = err else {
            panic!("expected RateLimitExceeded");
        };
        assert_eq!(exceeded.retry_after, Duration::from_secs(1));
    }

    #[tokio::test]
    async fn identities_are_counted_separately() {
        let limiter = limiter(vec![trial_tier()]);
        for _ in 0..5 {
            limiter
                .check_and_increment_at("acme", "trial", 1, false, noon())
                .await
                .unwrap();
        }
        assert!(
            limiter
                .check_and_increment_at("globex", "trial", 1, false, noon())
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn later_rejection_compensates_earlier_increments() {
        let tier = TierPolicy {
            name: "trial".into(),
            rules: vec![QuotaRule::daily_requests(10), QuotaRule::concurrent(1)],
        };
        let limiter = limiter(vec![tier]);

        limiter
            .check_and_increment_at("acme", "trial", 1, false, noon())
            .await
            .unwrap();
        let err = limiter
            .check_and_increment_at("acme", "trial", 1, false, noon())
            .await
            .unwrap_err();
        let AdmissionError::Exceeded(exceeded) = err else {
            panic!("expected RateLimitExceeded");
        };
        assert_eq!(exceeded.dimension, QuotaDimension::ConcurrentExecutions);
        assert_eq!(exceeded.retry_after, CONCURRENCY_RETRY_AFTER);

        // The rejected call must not have consumed a daily request.
        let usage = limiter.usage("acme", "trial", noon()).await.unwrap();
        assert_eq!(usage[0].count, 1);
        assert_eq!(usage[1].count, 1);
    }

    #[tokio::test]
    async fn release_frees_concurrency_but_not_window() {
        let tier = TierPolicy {
            name: "trial".into(),
            rules: vec![QuotaRule::daily_requests(10), QuotaRule::concurrent(1)],
        };
        let limiter = limiter(vec![tier]);

        limiter
            .check_and_increment_at("acme", "trial", 1, false, noon())
            .await
            .unwrap();
        limiter.release("acme", "trial", 1).await.unwrap();
        limiter
            .check_and_increment_at("acme", "trial", 1, false, noon())
            .await
            .unwrap();

        let usage = limiter.usage("acme", "trial", noon()).await.unwrap();
        assert_eq!(usage[0].count, 2);
        assert_eq!(usage[1].count, 1);
    }

    #[tokio::test]
    async fn hourly_and_daily_request_rules_count_independently() {
        let tier = TierPolicy {
            name: "trial".into(),
            rules: vec![
                QuotaRule {
                    dimension: QuotaDimension::Requests,
                    window_secs: Some(3600),
                    limit: 10,
                },
                QuotaRule::daily_requests(100),
            ],
        };
        let limiter = limiter(vec![tier]);
        // Both windows start at midnight.
        let half_past_midnight = Utc.with_ymd_and_hms(2026, 10, 18, 0, 30, 0).unwrap();

        let mut accepted = 0;
        for _ in 0..10 {
            if limiter
                .check_and_increment_at("acme", "trial", 1, false, half_past_midnight)
                .await
                .is_ok()
            {
                accepted += 1;
            }
        }
        assert_eq!(accepted, 10);

        let usage = limiter.usage("acme", "trial", half_past_midnight).await.unwrap();
        assert_eq!(usage[0].count, 10);
        assert_eq!(usage[1].count, 10);

        let err = limiter
            .check_and_increment_at("acme", "trial", 1, false, half_past_midnight)
            .await
            .unwrap_err();
        let AdmissionError::Exceeded(exceeded) = err else {
            panic!("expected RateLimitExceeded");
        };
        assert_eq!(exceeded.usage.limit, 10);
        assert_eq!(exceeded.retry_after, Duration::from_secs(1800));

        // The daily counter survives the hourly rollover.
        let next_hour = half_past_midnight + ChronoDuration::hours(1);
        limiter
            .check_and_increment_at("acme", "trial", 1, false, next_hour)
            .await
            .unwrap();
        let usage = limiter.usage("acme", "trial", next_hour).await.unwrap();
        assert_eq!(usage[0].count, 1);
        assert_eq!(usage[1].count, 11);
    }

    #[tokio::test]
    async fn bypass_skips_all_checks() {
        let limiter = limiter(vec![trial_tier()]);
        for _ in 0..5 {
            limiter
                .check_and_increment_at("acme", "trial", 1, false, noon())
                .await
                .unwrap();
        }
        let grant = limiter
            .check_and_increment_at("acme", "trial", 1, true, noon())
            .await
            .unwrap();
        assert!(grant.bypassed);

        let usage = limiter.usage("acme", "trial", noon()).await.unwrap();
        assert_eq!(usage[0].count, 5);
    }

    #[tokio::test]
    async fn unknown_tier_is_an_error() {
        let limiter = limiter(vec![trial_tier()]);
        let err = limiter
            .check_and_increment("acme", "gold", 1, false)
            .await
            .unwrap_err();
        assert!(matches!(err, AdmissionError::UnknownTier(t) if t == "gold"));
    }

    #[test]
    fn tier_for_uses_assignments_then_default() {
        let config = GlobalConfig {
            tier_assignments: [("acme".to_string(), "paid".to_string())].into_iter().collect(),
            ..GlobalConfig::default()
        };
        let limiter = TieredRateLimiter::from_config(InMemoryCounterStore::new(), &config);
        assert_eq!(limiter.tier_for("acme"), "paid");
        assert_eq!(limiter.tier_for("someone"), "free");
    }
}
