//! Health and quota usage endpoints.

use axum::Json;
use axum::extract::{Path, State};
use chrono::Utc;
use serde::Serialize;
use serde_json::{Value, json};

use jobstream_core::ratelimit::AdmissionError;
use jobstream_types::usage::UsageSnapshot;

use crate::http::error::AppError;
use crate::http::response::{ApiResponse, RequestTimer};
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct UsageReport {
    pub identity: String,
    pub tier: String,
    pub counters: Vec<UsageSnapshot>,
}

/// GET /api/v1/usage/:identity - Current quota counters for an identity.
pub async fn get_usage(
    State(state): State<AppState>,
    Path(identity): Path<String>,
) -> Result<Json<ApiResponse<UsageReport>>, AppError> {
    let timer = RequestTimer::start();
    let limiter = state.dispatcher.limiter();
    let tier = limiter.tier_for(&identity).to_string();

    let counters = limiter
        .usage(&identity, &tier, Utc::now())
        .await
        .map_err(|e| match e {
            AdmissionError::UnknownTier(tier) => {
                AppError::NotFound(format!("quota tier '{tier}' is not configured"))
            }
            other => AppError::Internal(other.to_string()),
        })?;

    Ok(Json(timer.respond(UsageReport {
        identity,
        tier,
        counters,
    })))
}

/// GET /health - Liveness plus worker runtime state.
pub async fn health_check(State(state): State<AppState>) -> Json<Value> {
    let uptime = state.runtime.uptime().await;
    Json(json!({
        "status": if uptime.is_some() { "ok" } else { "stopped" },
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": uptime.map(|d| d.as_secs()),
        "open_streams": state.dispatcher.streams().len(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::test_state;
    use jobstream_types::config::GlobalConfig;

    #[tokio::test]
    async fn usage_reports_every_rule_of_the_tier() {
        let state = test_state(GlobalConfig::default()).await;
        let Json(resp) = get_usage(State(state), Path("acme".into())).await.unwrap();

        let report = resp.data.unwrap();
        assert_eq!(report.tier, "free");
        assert_eq!(report.counters.len(), 2);
        assert!(report.counters.iter().all(|c| c.count == 0));
    }

    #[tokio::test]
    async fn usage_for_undefined_tier_is_404() {
        let mut config = GlobalConfig::default();
        config.tier_assignments.insert("acme".into(), "gold".into());
        let state = test_state(config).await;

        let err = get_usage(State(state), Path("acme".into())).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn health_reflects_runtime() {
        let state = test_state(GlobalConfig::default()).await;
        let Json(before) = health_check(State(state.clone())).await;
        assert_eq!(before["status"], "stopped");

        state.runtime.startup().await.unwrap();
        let Json(after) = health_check(State(state.clone())).await;
        assert_eq!(after["status"], "ok");
        state.runtime.shutdown().await;
    }
}
