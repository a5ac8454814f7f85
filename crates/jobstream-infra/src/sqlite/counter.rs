//! SQLite usage counter store.
//!
//! `try_increment` is one `INSERT .. ON CONFLICT DO UPDATE .. WHERE` statement:
//! the limit check and the add happen inside SQLite, so any number of worker
//! processes sharing the database file cannot push a counter past its limit.

use chrono::{DateTime, SecondsFormat, Utc};
use jobstream_core::ratelimit::{CounterStore, IncrementOutcome};
use jobstream_types::error::CounterStoreError;
use jobstream_types::usage::CounterKey;

use super::pool::DatabasePool;

/// SQLite-backed implementation of `CounterStore`.
#[derive(Clone)]
pub struct SqliteCounterStore {
    pool: DatabasePool,
}

impl SqliteCounterStore {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    /// Delete counters whose window has expired. Returns the number removed.
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, CounterStoreError> {
        let result = sqlx::query(
            "DELETE FROM usage_counters WHERE expires_at IS NOT NULL AND expires_at <= ?",
        )
        .bind(format_expiry(&now))
        .execute(&self.pool.writer)
        .await
        .map_err(map_err)?;
        Ok(result.rows_affected())
    }
}

/// Fixed-width UTC timestamps so expiry compares correctly as text.
fn format_expiry(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn map_err(e: sqlx::Error) -> CounterStoreError {
    match e {
        sqlx::Error::PoolClosed | sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => {
            CounterStoreError::Unavailable(e.to_string())
        }
        other => CounterStoreError::Query(other.to_string()),
    }
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn to_u64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

impl CounterStore for SqliteCounterStore {
    async fn try_increment(
        &self,
        key: &CounterKey,
        cost: u64,
        limit: u64,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<IncrementOutcome, CounterStoreError> {
        let applied: Option<i64> = sqlx::query_scalar(
            r#"INSERT INTO usage_counters
               (identity, tier, dimension, window_secs, window_start, count, expires_at)
               SELECT ?1, ?2, ?3, ?4, ?5, ?6, ?7 WHERE ?6 <= ?8
               ON CONFLICT(identity, tier, dimension, window_secs, window_start) DO UPDATE SET
                 count = usage_counters.count + excluded.count
               WHERE usage_counters.count + excluded.count <= ?8
               RETURNING count"#,
        )
        .bind(&key.identity)
        .bind(&key.tier)
        .bind(key.dimension.as_str())
        .bind(to_i64(key.window_secs))
        .bind(key.window_start)
        .bind(to_i64(cost))
        .bind(expires_at.as_ref().map(format_expiry))
        .bind(to_i64(limit))
        .fetch_optional(&self.pool.writer)
        .await
        .map_err(map_err)?;

        match applied {
            Some(count) => Ok(IncrementOutcome::Accepted { count: to_u64(count) }),
            None => Ok(IncrementOutcome::Rejected {
                count: self.current(key).await?,
            }),
        }
    }

    async fn decrement(&self, key: &CounterKey, amount: u64) -> Result<u64, CounterStoreError> {
        let remaining: Option<i64> = sqlx::query_scalar(
            r#"UPDATE usage_counters SET count = MAX(count - ?, 0)
               WHERE identity = ? AND tier = ? AND dimension = ? AND window_secs = ? AND window_start = ?
               RETURNING count"#,
        )
        .bind(to_i64(amount))
        .bind(&key.identity)
        .bind(&key.tier)
        .bind(key.dimension.as_str())
        .bind(to_i64(key.window_secs))
        .bind(key.window_start)
        .fetch_optional(&self.pool.writer)
        .await
        .map_err(map_err)?;

        Ok(remaining.map(to_u64).unwrap_or(0))
    }

    async fn current(&self, key: &CounterKey) -> Result<u64, CounterStoreError> {
        let count: Option<i64> = sqlx::query_scalar(
            r#"SELECT count FROM usage_counters
               WHERE identity = ? AND tier = ? AND dimension = ? AND window_secs = ? AND window_start = ?"#,
        )
        .bind(&key.identity)
        .bind(&key.tier)
        .bind(key.dimension.as_str())
        .bind(to_i64(key.window_secs))
        .bind(key.window_start)
        .fetch_optional(&self.pool.writer)
        .await
        .map_err(map_err)?;

        Ok(count.map(to_u64).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite::test_pool;
    use chrono::{Duration, TimeZone};
    use jobstream_core::ratelimit::TieredRateLimiter;
    use jobstream_types::usage::{QuotaDimension, QuotaRule, TierPolicy};
    use std::sync::Arc;

    fn key(dimension: QuotaDimension, window_start: i64) -> CounterKey {
        let window_secs = match dimension {
            QuotaDimension::Requests => 86_400,
            QuotaDimension::ConcurrentExecutions => 0,
        };
        CounterKey {
            identity: "acme".into(),
            tier: "free".into(),
            dimension,
            window_secs,
            window_start,
        }
    }

    #[tokio::test]
    async fn increment_respects_limit() {
        let store = SqliteCounterStore::new(test_pool().await);
        let k = key(QuotaDimension::Requests, 1_700_000_000);

        assert_eq!(
            store.try_increment(&k, 3, 4, None).await.unwrap(),
            IncrementOutcome::Accepted { count: 3 }
        );
        assert_eq!(
            store.try_increment(&k, 2, 4, None).await.unwrap(),
            IncrementOutcome::Rejected { count: 3 }
        );
        assert_eq!(
            store.try_increment(&k, 1, 4, None).await.unwrap(),
            IncrementOutcome::Accepted { count: 4 }
        );
    }

    #[tokio::test]
    async fn first_increment_above_limit_creates_nothing() {
        let store = SqliteCounterStore::new(test_pool().await);
        let k = key(QuotaDimension::Requests, 0);

        assert_eq!(
            store.try_increment(&k, 5, 2, None).await.unwrap(),
            IncrementOutcome::Rejected { count: 0 }
        );
        assert_eq!(store.current(&k).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn decrement_saturates_at_zero() {
        let store = SqliteCounterStore::new(test_pool().await);
        let k = key(QuotaDimension::ConcurrentExecutions, 0);
        store.try_increment(&k, 2, 5, None).await.unwrap();

        assert_eq!(store.decrement(&k, 1).await.unwrap(), 1);
        assert_eq!(store.decrement(&k, 10).await.unwrap(), 0);
        assert_eq!(
            store
                .decrement(&key(QuotaDimension::ConcurrentExecutions, 7), 1)
                .await
                .unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn concurrent_increments_never_exceed_limit() {
        let store = Arc::new(SqliteCounterStore::new(test_pool().await));
        let k = key(QuotaDimension::Requests, 0);

        let mut handles = Vec::new();
        for _ in 0..40 {
            let store = Arc::clone(&store);
            let k = k.clone();
            handles.push(tokio::spawn(async move {
                store.try_increment(&k, 1, 7, None).await.unwrap()
            }));
        }

        let mut accepted = 0;
        for handle in handles {
            if matches!(handle.await.unwrap(), IncrementOutcome::Accepted { .. }) {
                accepted += 1;
            }
        }
        assert_eq!(accepted, 7);
        assert_eq!(store.current(&k).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn two_stores_on_one_file_share_counters() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("shared.db").display());
        let a = SqliteCounterStore::new(DatabasePool::new(&url).await.unwrap());
        let b = SqliteCounterStore::new(DatabasePool::new(&url).await.unwrap());
        let k = key(QuotaDimension::Requests, 0);

        assert!(matches!(
            a.try_increment(&k, 1, 2, None).await.unwrap(),
            IncrementOutcome::Accepted { .. }
        ));
        assert!(matches!(
            b.try_increment(&k, 1, 2, None).await.unwrap(),
            IncrementOutcome::Accepted { count: 2 }
        ));
        assert!(matches!(
            a.try_increment(&k, 1, 2, None).await.unwrap(),
            IncrementOutcome::Rejected { count: 2 }
        ));
    }

    #[tokio::test]
    async fn purge_removes_only_expired_windows() {
        let store = SqliteCounterStore::new(test_pool().await);
        let now = Utc::now();
        let old = key(QuotaDimension::Requests, 1);
        let live = key(QuotaDimension::Requests, 2);
        let gauge = key(QuotaDimension::ConcurrentExecutions, 0);
        store.try_increment(&old, 1, 5, Some(now - Duration::hours(1))).await.unwrap();
        store.try_increment(&live, 1, 5, Some(now + Duration::hours(1))).await.unwrap();
        store.try_increment(&gauge, 1, 5, None).await.unwrap();

        assert_eq!(store.purge_expired(now).await.unwrap(), 1);
        assert_eq!(store.current(&old).await.unwrap(), 0);
        assert_eq!(store.current(&live).await.unwrap(), 1);
        assert_eq!(store.current(&gauge).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn same_window_start_different_lengths_do_not_collide() {
        let store = SqliteCounterStore::new(test_pool().await);
        let midnight = 1_760_745_600;
        let now = Utc::now();
        let hourly = CounterKey {
            window_secs: 3600,
            ..key(QuotaDimension::Requests, midnight)
        };
        let daily = key(QuotaDimension::Requests, midnight);

        store.try_increment(&daily, 1, 100, Some(now + Duration::days(1))).await.unwrap();
        store.try_increment(&hourly, 1, 10, Some(now - Duration::seconds(1))).await.unwrap();
        assert_eq!(store.current(&hourly).await.unwrap(), 1);
        assert_eq!(store.current(&daily).await.unwrap(), 1);

        // Purging the expired hourly window leaves the daily count intact.
        assert_eq!(store.purge_expired(now).await.unwrap(), 1);
        assert_eq!(store.current(&hourly).await.unwrap(), 0);
        assert_eq!(store.current(&daily).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn limiter_over_sqlite_counts_hourly_and_daily_rules_separately() {
        let store = SqliteCounterStore::new(test_pool().await);
        let tier = TierPolicy {
            name: "free".into(),
            rules: vec![
                QuotaRule {
                    dimension: QuotaDimension::Requests,
                    window_secs: Some(3600),
                    limit: 10,
                },
                QuotaRule::daily_requests(100),
            ],
        };
        let limiter = TieredRateLimiter::new(store, vec![tier], "free");
        let half_past_midnight = Utc.with_ymd_and_hms(2026, 10, 18, 0, 30, 0).unwrap();

        for _ in 0..10 {
            limiter
                .check_and_increment_at("acme", "free", 1, false, half_past_midnight)
                .await
                .unwrap();
        }
        let usage = limiter.usage("acme", "free", half_past_midnight).await.unwrap();
        assert_eq!(usage.iter().map(|u| u.count).collect::<Vec<_>>(), vec![10, 10]);
    }

    #[tokio::test]
    async fn limiter_over_sqlite_rejects_sixth_daily_request() {
        let store = SqliteCounterStore::new(test_pool().await);
        let tier = TierPolicy {
            name: "free".into(),
            rules: vec![QuotaRule::daily_requests(5)],
        };
        let limiter = TieredRateLimiter::new(store, vec![tier], "free");

        for _ in 0..5 {
            limiter.check_and_increment("acme", "free", 1, false).await.unwrap();
        }
        assert!(limiter.check_and_increment("acme", "free", 1, false).await.is_err());
        limiter.check_and_increment("globex", "free", 1, false).await.unwrap();
    }
}
