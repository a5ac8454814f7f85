//! Workflow handlers for the REST API.
//!
//! Endpoints for storing workflow definitions, submitting executions, and
//! listing an individual workflow's executions.

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

use jobstream_core::dispatch::ExecutionRequest;
use jobstream_core::repository::{ExecutionRepository, WorkflowStore};
use jobstream_types::execution::Execution;
use jobstream_types::workflow::Workflow;

use crate::http::error::AppError;
use crate::http::response::{ApiResponse, RequestTimer};
use crate::state::AppState;

// ---------------------------------------------------------------------------
// Query parameters and bodies
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct ListWorkflowsQuery {
    pub owner: Option<String>,
}

/// Query parameters for listing a workflow's executions.
#[derive(Debug, Deserialize)]
pub struct ListExecutionsQuery {
    /// Maximum number of executions to return (default 20).
    #[serde(default = "default_execution_limit")]
    pub limit: u32,
}

fn default_execution_limit() -> u32 {
    20
}

/// Body of a manual execution request.
#[derive(Debug, Default, Deserialize)]
pub struct SubmitExecutionBody {
    /// Free-form input recorded on the execution's trigger context.
    #[serde(default)]
    pub input: Option<Value>,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// POST /api/v1/workflows - Insert or replace a workflow definition.
pub async fn save_workflow(
    State(state): State<AppState>,
    Json(workflow): Json<Workflow>,
) -> Result<Json<ApiResponse<Workflow>>, AppError> {
    let timer = RequestTimer::start();
    state.dispatcher.workflows().save(&workflow).await?;
    tracing::info!(workflow_id = %workflow.id, owner = workflow.owner.as_str(), "workflow saved");

    let href = format!("/api/v1/workflows/{}", workflow.id);
    Ok(Json(timer.respond(workflow).with_link("self", &href)))
}

/// GET /api/v1/workflows - List workflows, optionally by owner.
pub async fn list_workflows(
    State(state): State<AppState>,
    Query(query): Query<ListWorkflowsQuery>,
) -> Result<Json<ApiResponse<Vec<Workflow>>>, AppError> {
    let timer = RequestTimer::start();
    let workflows = state
        .dispatcher
        .workflows()
        .list(query.owner.as_deref())
        .await?;
    Ok(Json(timer.respond(workflows).with_link("self", "/api/v1/workflows")))
}

/// GET /api/v1/workflows/:id
pub async fn get_workflow(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<Workflow>>, AppError> {
    let timer = RequestTimer::start();
    let workflow = state
        .dispatcher
        .workflows()
        .get(&id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("workflow {id} not found")))?;

    Ok(Json(
        timer
            .respond(workflow)
            .with_link("executions", &format!("/api/v1/workflows/{id}/executions")),
    ))
}

/// POST /api/v1/workflows/:id/executions - Submit a manual execution.
///
/// Returns 202 once the execution is queued; progress is observed through
/// the stream link.
pub async fn submit_execution(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    body: Option<Json<SubmitExecutionBody>>,
) -> Result<(StatusCode, Json<ApiResponse<Value>>), AppError> {
    let timer = RequestTimer::start();
    let input = body.and_then(|Json(b)| b.input);

    let execution_id = state
        .dispatcher
        .submit(ExecutionRequest::manual(id, input))
        .await?;

    let resp = timer
        .respond(serde_json::json!({
            "execution_id": execution_id,
            "workflow_id": id,
            "status": "pending",
        }))
        .with_link("self", &format!("/api/v1/executions/{execution_id}"))
        .with_link("stream", &format!("/api/v1/executions/{execution_id}/stream"));

    Ok((StatusCode::ACCEPTED, Json(resp)))
}

/// GET /api/v1/workflows/:id/executions - Most recent executions first.
pub async fn list_executions(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<ListExecutionsQuery>,
) -> Result<Json<ApiResponse<Vec<Execution>>>, AppError> {
    let timer = RequestTimer::start();
    let executions = state
        .dispatcher
        .executions()
        .list_for_workflow(&id, query.limit.min(200))
        .await?;
    Ok(Json(timer.respond(executions)))
}
