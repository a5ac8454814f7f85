//! Quota and usage types for tiered admission control.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What a quota rule counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaDimension {
    /// Executions started within the rule's window.
    Requests,
    /// Executions currently in flight. Released when an execution terminates.
    ConcurrentExecutions,
}

impl QuotaDimension {
    pub fn as_str(self) -> &'static str {
        match self {
            QuotaDimension::Requests => "requests",
            QuotaDimension::ConcurrentExecutions => "concurrent_executions",
        }
    }
}

impl fmt::Display for QuotaDimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single limit within a tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaRule {
    pub dimension: QuotaDimension,
    /// Fixed window length. `None` means the counter is a gauge with no window.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_secs: Option<u64>,
    pub limit: u64,
}

impl QuotaRule {
    pub fn daily_requests(limit: u64) -> Self {
        Self {
            dimension: QuotaDimension::Requests,
            window_secs: Some(86_400),
            limit,
        }
    }

    pub fn concurrent(limit: u64) -> Self {
        Self {
            dimension: QuotaDimension::ConcurrentExecutions,
            window_secs: None,
            limit,
        }
    }
}

/// A named quota class with its ordered rule set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierPolicy {
    pub name: String,
    #[serde(default)]
    pub rules: Vec<QuotaRule>,
}

/// Identifies one usage counter in the counter store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CounterKey {
    pub identity: String,
    pub tier: String,
    pub dimension: QuotaDimension,
    /// Window length of the owning rule; 0 for gauges. Rules of the same
    /// dimension with different windows never share a counter.
    pub window_secs: u64,
    /// Unix timestamp of the window start; 0 for gauges.
    pub window_start: i64,
}

impl CounterKey {
    /// The counter `rule` uses for the window starting at `window_start`.
    pub fn for_rule(
        identity: impl Into<String>,
        tier: impl Into<String>,
        rule: &QuotaRule,
        window_start: i64,
    ) -> Self {
        Self {
            identity: identity.into(),
            tier: tier.into(),
            dimension: rule.dimension,
            window_secs: rule.window_secs.unwrap_or(0),
            window_start,
        }
    }
}

impl fmt::Display for CounterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}/{}:{}",
            self.identity, self.tier, self.dimension, self.window_secs, self.window_start
        )
    }
}

/// Point-in-time view of one counter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageSnapshot {
    pub identity: String,
    pub tier: String,
    pub dimension: QuotaDimension,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_start: Option<DateTime<Utc>>,
    pub count: u64,
    pub limit: u64,
}

/// Remaining allowance for one rule after a successful admission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemainingQuota {
    pub dimension: QuotaDimension,
    pub remaining: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resets_at: Option<DateTime<Utc>>,
}

/// Result of a successful admission check.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaGrant {
    /// True when quota checks were skipped for a trusted execution.
    pub bypassed: bool,
    pub remaining: Vec<RemainingQuota>,
}
