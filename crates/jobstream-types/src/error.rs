use std::fmt;
use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use crate::execution::ExecutionStatus;
use crate::usage::{QuotaDimension, UsageSnapshot};

/// Errors from repository operations (used by trait definitions in jobstream-core).
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database connection error")]
    Connection,

    #[error("query error: {0}")]
    Query(String),

    #[error("entity not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),
}

/// Errors from the usage counter store.
#[derive(Debug, Error)]
pub enum CounterStoreError {
    #[error("counter store unavailable: {0}")]
    Unavailable(String),

    #[error("counter store query failed: {0}")]
    Query(String),
}

/// An execution status change that would move backward or leave a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid execution transition: {from} -> {to}")]
pub struct InvalidTransition {
    pub from: ExecutionStatus,
    pub to: ExecutionStatus,
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// One failed execution precondition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    NotActivated,
    NoSteps,
    MissingTrigger,
    DuplicateStepId(String),
    BlankInstruction(String),
}

impl Violation {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            Violation::NotActivated => "not_activated",
            Violation::NoSteps => "no_steps",
            Violation::MissingTrigger => "missing_trigger",
            Violation::DuplicateStepId(_) => "duplicate_step_id",
            Violation::BlankInstruction(_) => "blank_instruction",
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Violation::NotActivated => f.write_str("workflow is not activated"),
            Violation::NoSteps => f.write_str("workflow has no steps"),
            Violation::MissingTrigger => f.write_str("workflow has no trigger configuration"),
            Violation::DuplicateStepId(id) => write!(f, "step id '{id}' is used more than once"),
            Violation::BlankInstruction(id) => write!(f, "step '{id}' has a blank instruction"),
        }
    }
}

/// Every violation found for a workflow, reported together.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("workflow {workflow_id} cannot run: {}", join_violations(.violations))]
pub struct ValidationError {
    pub workflow_id: Uuid,
    pub violations: Vec<Violation>,
}

fn join_violations(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

// ---------------------------------------------------------------------------
// Rate limiting
// ---------------------------------------------------------------------------

/// Admission rejected because a quota rule is exhausted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error(
    "rate limit exceeded for '{identity}' on tier '{tier}' ({dimension}); retry after {}s",
    .retry_after.as_secs()
)]
pub struct RateLimitExceeded {
    pub identity: String,
    pub tier: String,
    pub dimension: QuotaDimension,
    pub retry_after: Duration,
    pub usage: UsageSnapshot,
}
