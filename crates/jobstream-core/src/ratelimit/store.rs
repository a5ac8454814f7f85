//! Counter store port and its in-memory implementation.
//!
//! The store owns atomicity: `try_increment` is a single compare-and-increment
//! against the shared counter, never a read followed by a write. Independent
//! worker processes rely on the infra (SQLite) implementation for this; the
//! in-memory store gives the same guarantee within one process via DashMap's
//! per-shard entry lock.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use jobstream_types::error::CounterStoreError;
use jobstream_types::usage::CounterKey;

/// Result of an atomic compare-and-increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncrementOutcome {
    /// The increment was applied; `count` is the new value.
    Accepted { count: u64 },
    /// Applying the cost would exceed the limit; `count` is unchanged.
    Rejected { count: u64 },
}

/// Shared usage counter storage.
pub trait CounterStore: Send + Sync {
    /// Atomically add `cost` if the result stays within `limit`.
    ///
    /// `expires_at` marks when the counter may be discarded; `None` keeps it
    /// until explicitly decremented.
    fn try_increment(
        &self,
        key: &CounterKey,
        cost: u64,
        limit: u64,
        expires_at: Option<DateTime<Utc>>,
    ) -> impl std::future::Future<Output = Result<IncrementOutcome, CounterStoreError>> + Send;

    /// Atomically subtract `amount`, saturating at zero. Returns the new value.
    fn decrement(
        &self,
        key: &CounterKey,
        amount: u64,
    ) -> impl std::future::Future<Output = Result<u64, CounterStoreError>> + Send;

    /// Current value (0 when absent).
    fn current(
        &self,
        key: &CounterKey,
    ) -> impl std::future::Future<Output = Result<u64, CounterStoreError>> + Send;
}

#[derive(Debug, Clone, Copy)]
struct CounterEntry {
    count: u64,
    expires_at: Option<DateTime<Utc>>,
}

/// Process-local counter store.
#[derive(Debug, Default)]
pub struct InMemoryCounterStore {
    counters: DashMap<CounterKey, CounterEntry>,
}

impl InMemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop counters whose expiry has passed.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let before = self.counters.len();
        self.counters
            .retain(|_, entry| entry.expires_at.is_none_or(|at| at > now));
        before - self.counters.len()
    }
}

impl CounterStore for InMemoryCounterStore {
    async fn try_increment(
        &self,
        key: &CounterKey,
        cost: u64,
        limit: u64,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<IncrementOutcome, CounterStoreError> {
        // The entry guard holds the shard lock for the whole check-and-add.
        let mut entry = self
            .counters
            .entry(key.clone())
            .or_insert(CounterEntry { count: 0, expires_at });

        let next = entry.count.saturating_add(cost);
        if next > limit {
            return Ok(IncrementOutcome::Rejected { count: entry.count });
        }
        entry.count = next;
        Ok(IncrementOutcome::Accepted { count: next })
    }

    async fn decrement(&self, key: &CounterKey, amount: u64) -> Result<u64, CounterStoreError> {
        match self.counters.get_mut(key) {
            Some(mut entry) => {
                entry.count = entry.count.saturating_sub(amount);
                Ok(entry.count)
            }
            None => Ok(0),
        }
    }

    async fn current(&self, key: &CounterKey) -> Result<u64, CounterStoreError> {
        Ok(self.counters.get(key).map(|entry| entry.count).unwrap_or(0))
    }
}
