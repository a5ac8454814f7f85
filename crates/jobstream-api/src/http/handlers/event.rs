//! Inbound provider events.
//!
//! Integration adapters (or provider webhooks) post raw event payloads here.
//! Each event is resolved through the trigger registry and every workflow it
//! fires is submitted independently.

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use jobstream_types::trigger::InboundEvent;

use crate::http::error::AppError;
use crate::http::response::{ApiResponse, RequestTimer};
use crate::state::AppState;

/// Per-workflow result of one ingested event.
#[derive(Debug, Serialize)]
pub struct FiredExecution {
    pub workflow_id: Uuid,
    pub owner: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// POST /api/v1/events/:provider/:event_type
///
/// The body is parsed as JSON best-effort; a non-JSON body becomes `null`.
/// Rejections of individual workflows are reported per entry and never fail
/// the request.
pub async fn ingest_event(
    State(state): State<AppState>,
    Path((provider, event_type)): Path<(String, String)>,
    body: Bytes,
) -> Result<(StatusCode, Json<ApiResponse<Vec<FiredExecution>>>), AppError> {
    let timer = RequestTimer::start();
    let payload: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
    let event = InboundEvent::new(provider, event_type, payload);

    let outcomes = state
        .dispatcher
        .ingest(&event)
        .await
        .map_err(|e| AppError::Internal(e.to_string()))?;

    let fired = outcomes
        .into_iter()
        .map(|o| {
            let (execution_id, error) = match o.result {
                Ok(id) => (Some(id), None),
                Err(e) => (None, Some(e.to_string())),
            };
            FiredExecution {
                workflow_id: o.workflow_id,
                owner: o.owner,
                execution_id,
                error,
            }
        })
        .collect();

    Ok((StatusCode::ACCEPTED, Json(timer.respond(fired))))
}
