//! Global configuration types for jobstream.
//!
//! `GlobalConfig` represents the top-level `config.toml` controlling worker
//! concurrency, stream retention, quota tiers, and the trigger handlers
//! registered at boot.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::usage::{QuotaRule, TierPolicy};

/// Top-level configuration. All fields have sensible defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalConfig {
    /// Tier used for identities without an explicit assignment.
    #[serde(default = "default_tier")]
    pub default_tier: String,

    #[serde(default)]
    pub worker: WorkerConfig,

    #[serde(default)]
    pub stream: StreamConfig,

    /// Quota tiers. Defaults to a `free` and a `paid` tier.
    #[serde(default = "default_tiers")]
    pub tiers: Vec<TierPolicy>,

    /// Identity -> tier name.
    #[serde(default)]
    pub tier_assignments: HashMap<String, String>,

    /// Trigger handlers registered at boot, in order.
    #[serde(default)]
    pub handlers: Vec<HandlerConfig>,
}

fn default_tier() -> String {
    "free".to_string()
}

fn default_tiers() -> Vec<TierPolicy> {
    vec![
        TierPolicy {
            name: "free".to_string(),
            rules: vec![QuotaRule::daily_requests(50), QuotaRule::concurrent(2)],
        },
        TierPolicy {
            name: "paid".to_string(),
            rules: vec![QuotaRule::daily_requests(5_000), QuotaRule::concurrent(20)],
        },
    ]
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            default_tier: default_tier(),
            worker: WorkerConfig::default(),
            stream: StreamConfig::default(),
            tiers: default_tiers(),
            tier_assignments: HashMap::new(),
            handlers: Vec::new(),
        }
    }
}

/// Worker pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Number of worker tasks pulling from the execution queue.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Bounded queue capacity between `submit` and the workers.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Seconds an execution claim survives without a heartbeat before other
    /// workers may fail it as orphaned.
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,
}

fn default_concurrency() -> usize {
    4
}

fn default_queue_capacity() -> usize {
    256
}

fn default_lease_secs() -> u64 {
    60
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            queue_capacity: default_queue_capacity(),
            lease_secs: default_lease_secs(),
        }
    }
}

/// Stream channel retention and liveness settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// How long published messages stay available to late subscribers.
    #[serde(default = "default_backlog_ttl_secs")]
    pub backlog_ttl_secs: u64,
    /// Maximum retained messages per channel.
    #[serde(default = "default_backlog_capacity")]
    pub backlog_capacity: usize,
    /// A channel silent for this long is presumed to belong to a crashed worker.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// How often the sweeper checks for idle and expired channels.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn default_backlog_ttl_secs() -> u64 {
    300
}

fn default_backlog_capacity() -> usize {
    1024
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_sweep_interval_secs() -> u64 {
    15
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            backlog_ttl_secs: default_backlog_ttl_secs(),
            backlog_capacity: default_backlog_capacity(),
            idle_timeout_secs: default_idle_timeout_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

/// A trigger handler declared in configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandlerConfig {
    pub provider: String,
    pub event_type: String,
    /// Defaults to `{provider}.{event_type}`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Payload conditions every accepted event must satisfy.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub require: BTreeMap<String, Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usage::QuotaDimension;

    #[test]
    fn test_global_config_default_values() {
        let config = GlobalConfig::default();
        assert_eq!(config.default_tier, "free");
        assert_eq!(config.worker.concurrency, 4);
        assert_eq!(config.stream.backlog_ttl_secs, 300);
        assert_eq!(config.tiers.len(), 2);
        assert!(config.handlers.is_empty());
    }

    #[test]
    fn test_global_config_deserialize_with_defaults() {
        let config: GlobalConfig = toml::from_str("").unwrap();
        assert_eq!(config.default_tier, "free");
        assert_eq!(config.stream.idle_timeout_secs, 600);
        assert_eq!(config.tiers[0].name, "free");
    }

    #[test]
    fn test_global_config_deserialize_with_values() {
        let toml_str = r#"
default_tier = "trial"

[worker]
concurrency = 8

[stream]
idle_timeout_secs = 30

[[tiers]]
name = "trial"

[[tiers.rules]]
dimension = "requests"
window_secs = 86400
limit = 5

[tier_assignments]
acme = "trial"

[[handlers]]
provider = "github"
event_type = "push"

[handlers.require]
"/ref" = "refs/heads/main"
"#;
        let config: GlobalConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.default_tier, "trial");
        assert_eq!(config.worker.concurrency, 8);
        assert_eq!(config.worker.queue_capacity, 256);
        assert_eq!(config.worker.lease_secs, 60);
        assert_eq!(config.stream.idle_timeout_secs, 30);
        assert_eq!(config.tiers.len(), 1);
        assert_eq!(config.tiers[0].rules[0].dimension, QuotaDimension::Requests);
        assert_eq!(config.tier_assignments["acme"], "trial");
        assert_eq!(config.handlers.len(), 1);
        assert_eq!(config.handlers[0].require.len(), 1);
    }
}
