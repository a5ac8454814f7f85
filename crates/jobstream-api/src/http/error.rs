//! Application error type mapping to HTTP status codes and envelope format.

use axum::Json;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde_json::json;

use jobstream_core::dispatch::SubmitError;
use jobstream_core::stream::StreamError;
use jobstream_types::error::{RateLimitExceeded, RepositoryError, ValidationError};

use super::response::{ApiErrorDetail, ApiResponse};

/// Application-level error that maps to HTTP responses.
#[derive(Debug)]
pub enum AppError {
    /// Resource does not exist.
    NotFound(String),
    /// The workflow cannot run; every violation is reported.
    Validation(ValidationError),
    /// Quota exhausted.
    RateLimited(RateLimitExceeded),
    /// Generic internal error.
    Internal(String),
}

impl From<SubmitError> for AppError {
    fn from(e: SubmitError) -> Self {
        match e {
            SubmitError::WorkflowNotFound(id) => AppError::NotFound(format!("workflow {id} not found")),
            SubmitError::Validation(v) => AppError::Validation(v),
            SubmitError::RateLimited(r) => AppError::RateLimited(r),
            other => AppError::Internal(other.to_string()),
        }
    }
}

impl From<StreamError> for AppError {
    fn from(e: StreamError) -> Self {
        match e {
            StreamError::UnknownChannel(id) => {
                AppError::NotFound(format!("no stream for execution {id}"))
            }
            other => AppError::Internal(other.to_string()),
        }
    }
}

impl From<RepositoryError> for AppError {
    fn from(e: RepositoryError) -> Self {
        match e {
            RepositoryError::NotFound => AppError::NotFound("entity not found".to_string()),
            other => AppError::Internal(other.to_string()),
        }
    }
}

impl AppError {
    fn status(&self) -> StatusCode {
        match self {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn details(&self) -> Vec<ApiErrorDetail> {
        match self {
            AppError::NotFound(msg) => vec![ApiErrorDetail::new("NOT_FOUND", msg.clone())],
            AppError::Validation(err) => err
                .violations
                .iter()
                .map(|v| {
                    ApiErrorDetail::new("VALIDATION_ERROR", v.to_string())
                        .with_details(json!({ "violation": v.code() }))
                })
                .collect(),
            AppError::RateLimited(err) => vec![
                ApiErrorDetail::new("RATE_LIMITED", err.to_string()).with_details(json!({
                    "retry_after_secs": err.retry_after.as_secs(),
                    "usage": err.usage,
                })),
            ],
            AppError::Internal(msg) => vec![ApiErrorDetail::new("INTERNAL_ERROR", msg.clone())],
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if let AppError::Internal(msg) = &self {
            tracing::error!(error = %msg, "request failed");
        }

        let status = self.status();
        let mut response = (status, Json(ApiResponse::errors(self.details()))).into_response();

        if let AppError::RateLimited(err) = &self {
            let secs = err.retry_after.as_secs().max(1);
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use jobstream_types::error::Violation;
    use jobstream_types::usage::{QuotaDimension, UsageSnapshot};
    use uuid::Uuid;

    #[test]
    fn validation_maps_to_422_with_every_violation() {
        let err = AppError::Validation(ValidationError {
            workflow_id: Uuid::nil(),
            violations: vec![Violation::NotActivated, Violation::NoSteps],
        });
        assert_eq!(err.details().len(), 2);
        assert_eq!(err.into_response().status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[test]
    fn rate_limit_sets_retry_after() {
        let err = AppError::RateLimited(RateLimitExceeded {
            identity: "acme".into(),
            tier: "free".into(),
            dimension: QuotaDimension::Requests,
            retry_after: Duration::from_secs(42),
            usage: UsageSnapshot {
                identity: "acme".into(),
                tier: "free".into(),
                dimension: QuotaDimension::Requests,
                window_start: None,
                count: 5,
                limit: 5,
            },
        });

        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "42");
    }

    #[test]
    fn submit_errors_map_by_kind() {
        let not_found: AppError = SubmitError::WorkflowNotFound(Uuid::nil()).into();
        assert_eq!(not_found.status(), StatusCode::NOT_FOUND);

        let full: AppError = SubmitError::QueueFull.into();
        assert_eq!(full.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
