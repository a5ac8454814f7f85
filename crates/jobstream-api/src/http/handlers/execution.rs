//! Execution status, cancellation, and live output streaming.

use std::convert::Infallible;
use std::time::Duration;

use axum::Json;
use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures_util::{Stream, StreamExt};
use serde_json::{Value, json};
use uuid::Uuid;

use jobstream_core::stream::StreamError;
use jobstream_types::execution::Execution;
use jobstream_types::stream::{EnvelopeType, StreamEnvelope};

use crate::http::error::AppError;
use crate::http::response::{ApiResponse, RequestTimer};
use crate::state::AppState;

/// GET /api/v1/executions/:id
pub async fn get_execution(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<Execution>>, AppError> {
    let timer = RequestTimer::start();
    let execution = state
        .dispatcher
        .get_execution(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("execution {id} not found")))?;

    Ok(Json(
        timer
            .respond(execution)
            .with_link("stream", &format!("/api/v1/executions/{id}/stream")),
    ))
}

/// POST /api/v1/executions/:id/cancel
///
/// `cancelled` is false when the execution had already ended.
pub async fn cancel_execution(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<Value>>, AppError> {
    let timer = RequestTimer::start();
    let cancelled = match state.dispatcher.cancel(id) {
        Ok(cancelled) => cancelled,
        // The channel may have been swept after the execution finished.
        Err(StreamError::UnknownChannel(_)) => {
            if state.dispatcher.get_execution(id).await?.is_none() {
                return Err(AppError::NotFound(format!("execution {id} not found")));
            }
            false
        }
        Err(e) => return Err(e.into()),
    };

    Ok(Json(timer.respond(json!({
        "execution_id": id,
        "cancelled": cancelled,
    }))))
}

/// GET /api/v1/executions/:id/stream - Server-Sent Events.
///
/// Replays the retained backlog, then follows live output. Each event is
/// named after the envelope type and carries the envelope JSON; the stream
/// ends after the terminal event.
pub async fn stream_execution(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    let envelopes = state.dispatcher.streams().subscribe(id)?;
    tracing::debug!(execution_id = %id, "stream subscriber attached");

    let events = envelopes.map(|envelope| Ok::<_, Infallible>(to_event(&envelope)));
    Ok(Sse::new(events).keep_alive(KeepAlive::new().interval(Duration::from_secs(15))))
}

fn event_name(kind: EnvelopeType) -> &'static str {
    match kind {
        EnvelopeType::Data => "data",
        EnvelopeType::Done => "done",
        EnvelopeType::Cancelled => "cancelled",
        EnvelopeType::Error => "error",
    }
}

fn to_event(envelope: &StreamEnvelope) -> Event {
    let data = serde_json::to_string(envelope).unwrap_or_default();
    Event::default()
        .event(event_name(envelope.kind))
        .id(envelope.seq.to_string())
        .data(data)
}
