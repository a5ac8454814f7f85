//! Resource providers backed by infrastructure.

use std::time::Duration;

use chrono::Utc;
use jobstream_core::lifecycle::{BackgroundTask, ProviderError, ProviderFuture, ResourceProvider};

use crate::sqlite::{DatabasePool, SqliteCounterStore};

/// The shared SQLite pool. Verified on start, closed on stop.
pub struct DatabaseProvider {
    pool: DatabasePool,
}

impl DatabaseProvider {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

impl ResourceProvider for DatabaseProvider {
    fn name(&self) -> &str {
        "database"
    }

    fn start(&self) -> ProviderFuture<'_> {
        Box::pin(async move {
            self.pool
                .ping()
                .await
                .map_err(|e| ProviderError::new(format!("database unreachable: {e}")))?;
            tracing::info!("database pool ready");
            Ok(())
        })
    }

    fn stop(&self) -> ProviderFuture<'_> {
        Box::pin(async move {
            self.pool.close().await;
            tracing::info!("database pool closed");
            Ok(())
        })
    }
}

/// Periodically deletes usage counters whose window has expired.
pub fn counter_purge_task(store: SqliteCounterStore, interval: Duration) -> BackgroundTask {
    BackgroundTask::new("counter-purge", move |shutdown| {
        let store = store.clone();
        async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => match store.purge_expired(Utc::now()).await {
                        Ok(0) => {}
                        Ok(purged) => tracing::debug!(purged, "purged expired usage counters"),
                        Err(e) => tracing::warn!(error = %e, "usage counter purge failed"),
                    },
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite::test_pool;

    #[tokio::test]
    async fn database_provider_starts_and_closes_pool() {
        let pool = test_pool().await;
        let provider = DatabaseProvider::new(pool.clone());

        provider.start().await.unwrap();
        provider.stop().await.unwrap();
        assert!(pool.writer.is_closed());
        assert!(provider.start().await.is_err());
    }

    #[tokio::test]
    async fn purge_task_runs_until_stopped() {
        let pool = test_pool().await;
        let task = counter_purge_task(SqliteCounterStore::new(pool), Duration::from_millis(10));

        task.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        task.stop().await.unwrap();
    }
}
