//! Global configuration loader for jobstream.
//!
//! Reads `config.toml` from the data directory (`~/.jobstream/` in production)
//! and deserializes it into [`GlobalConfig`]. Falls back to sensible defaults
//! when the file is missing or malformed.

use std::path::{Path, PathBuf};

use jobstream_types::config::GlobalConfig;

/// Resolve the data directory from environment or platform defaults.
///
/// Priority:
/// 1. `JOBSTREAM_DATA_DIR` environment variable
/// 2. `~/.jobstream`
pub fn resolve_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("JOBSTREAM_DATA_DIR") {
        return PathBuf::from(dir);
    }

    if let Some(home) = dirs::home_dir() {
        return home.join(".jobstream");
    }

    // Last resort: current directory
    PathBuf::from(".jobstream")
}

/// Load global configuration from `{data_dir}/config.toml`.
///
/// - If the file does not exist, returns [`GlobalConfig::default()`].
/// - If the file exists but fails to parse, logs a warning and returns the default.
/// - Tiers referenced by `default_tier` or `tier_assignments` that are not
///   defined are reported as warnings; admission for them fails at runtime.
pub async fn load_global_config(data_dir: &Path) -> GlobalConfig {
    let config_path = data_dir.join("config.toml");

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config.toml found at {}, using defaults", config_path.display());
            return GlobalConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", config_path.display());
            return GlobalConfig::default();
        }
    };

    let config = match toml::from_str::<GlobalConfig>(&content) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!(
                "Failed to parse {}: {err}, using defaults",
                config_path.display()
            );
            return GlobalConfig::default();
        }
    };

    for tier in undefined_tiers(&config) {
        tracing::warn!(tier, "config references an undefined quota tier");
    }
    config
}

/// Tier names referenced by the config but missing from `tiers`.
pub fn undefined_tiers(config: &GlobalConfig) -> Vec<String> {
    let defined = |name: &str| config.tiers.iter().any(|t| t.name == name);
    let mut missing: Vec<String> = std::iter::once(config.default_tier.as_str())
        .chain(config.tier_assignments.values().map(String::as_str))
        .filter(|name| !defined(name))
        .map(str::to_string)
        .collect();
    missing.sort();
    missing.dedup();
    missing
}
