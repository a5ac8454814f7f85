//! Execution tracking types.
//!
//! An `Execution` is one run of a workflow. Its status only ever moves
//! forward: pending -> running -> streaming -> {completed | cancelled | failed}.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::InvalidTransition;
use crate::trigger::TriggerContext;

// ---------------------------------------------------------------------------
// ExecutionStatus
// ---------------------------------------------------------------------------

/// Lifecycle status of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Streaming,
    Completed,
    Cancelled,
    Failed,
}

impl ExecutionStatus {
    fn rank(self) -> u8 {
        match self {
            ExecutionStatus::Pending => 0,
            ExecutionStatus::Running => 1,
            ExecutionStatus::Streaming => 2,
            ExecutionStatus::Completed | ExecutionStatus::Cancelled | ExecutionStatus::Failed => 3,
        }
    }

    pub const ALL: [ExecutionStatus; 6] = [
        ExecutionStatus::Pending,
        ExecutionStatus::Running,
        ExecutionStatus::Streaming,
        ExecutionStatus::Completed,
        ExecutionStatus::Cancelled,
        ExecutionStatus::Failed,
    ];

    pub fn is_terminal(self) -> bool {
        self.rank() == 3
    }

    /// Forward-only: the target must rank strictly after the current status.
    pub fn can_transition_to(self, next: ExecutionStatus) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }

    /// Statuses a stored record may hold for a write of `self` to apply.
    pub fn predecessors(self) -> impl Iterator<Item = ExecutionStatus> {
        Self::ALL.into_iter().filter(move |s| s.can_transition_to(self))
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Streaming => "streaming",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Cancelled => "cancelled",
            ExecutionStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ExecutionStatus::Pending),
            "running" => Ok(ExecutionStatus::Running),
            "streaming" => Ok(ExecutionStatus::Streaming),
            "completed" => Ok(ExecutionStatus::Completed),
            "cancelled" => Ok(ExecutionStatus::Cancelled),
            "failed" => Ok(ExecutionStatus::Failed),
            other => Err(format!("invalid execution status: '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

/// One run of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    /// UUIDv7 execution ID. Also the ID of its stream channel.
    pub id: Uuid,
    pub workflow_id: Uuid,
    /// Identity charged for this execution.
    pub owner: String,
    /// Quota tier the execution was admitted under.
    pub tier: String,
    /// Admitted without consuming quota (trusted or system-confirmed).
    #[serde(default)]
    pub quota_bypassed: bool,
    pub status: ExecutionStatus,
    pub trigger: TriggerContext,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Dispatcher instance that admitted the execution and owns its stream.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_by: Option<Uuid>,
    /// Last lease renewal by the owning dispatcher.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat_at: Option<DateTime<Utc>>,
}

impl Execution {
    /// A fresh pending execution.
    pub fn pending(
        workflow_id: Uuid,
        owner: impl Into<String>,
        tier: impl Into<String>,
        trigger: TriggerContext,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            workflow_id,
            owner: owner.into(),
            tier: tier.into(),
            quota_bypassed: false,
            status: ExecutionStatus::Pending,
            trigger,
            started_at: Utc::now(),
            completed_at: None,
            error: None,
            claimed_by: None,
            heartbeat_at: None,
        }
    }

    /// Record `instance` as the owner with a fresh lease.
    pub fn claim(&mut self, instance: Uuid, now: DateTime<Utc>) {
        self.claimed_by = Some(instance);
        self.heartbeat_at = Some(now);
    }

    /// True when no lease renewal happened within `lease` of `now`.
    /// Unclaimed records fall back to their start time.
    pub fn lease_expired(&self, now: DateTime<Utc>, lease: chrono::Duration) -> bool {
        self.heartbeat_at.unwrap_or(self.started_at) + lease < now
    }

    /// The stream channel owned by this execution.
    pub fn stream_channel_id(&self) -> Uuid {
        self.id
    }

    /// Move to `next`, stamping the completion time on terminal states.
    pub fn transition(&mut self, next: ExecutionStatus) -> Result<(), InvalidTransition> {
        if !self.status.can_transition_to(next) {
            return Err(InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        if next.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Execution {
        Execution::pending(Uuid::now_v7(), "user", "free", TriggerContext::Manual { input: None })
    }

    #[test]
    fn happy_path_transitions() {
        let mut exec = sample();
        exec.transition(ExecutionStatus::Running).unwrap();
        exec.transition(ExecutionStatus::Streaming).unwrap();
        exec.transition(ExecutionStatus::Completed).unwrap();
        assert!(exec.completed_at.is_some());
    }

    #[test]
    fn backward_transition_rejected() {
        let mut exec = sample();
        exec.transition(ExecutionStatus::Streaming).unwrap();
        let err = exec.transition(ExecutionStatus::Running).unwrap_err();
        assert_eq!(err.from, ExecutionStatus::Streaming);
        assert_eq!(err.to, ExecutionStatus::Running);
    }

    #[test]
    fn terminal_is_final() {
        let mut exec = sample();
        exec.transition(ExecutionStatus::Failed).unwrap();
        assert!(exec.transition(ExecutionStatus::Completed).is_err());
        assert!(exec.transition(ExecutionStatus::Cancelled).is_err());
    }

    #[test]
    fn same_status_is_not_a_transition() {
        assert!(!ExecutionStatus::Running.can_transition_to(ExecutionStatus::Running));
    }

    #[test]
    fn status_parses_persisted_strings() {
        assert_eq!("streaming".parse::<ExecutionStatus>().unwrap(), ExecutionStatus::Streaming);
        assert_eq!(ExecutionStatus::Cancelled.to_string(), "cancelled");
        assert!("paused".parse::<ExecutionStatus>().is_err());
    }

    #[test]
    fn predecessors_rank_strictly_lower() {
        let before_failed: Vec<_> = ExecutionStatus::Failed.predecessors().collect();
        assert_eq!(
            before_failed,
            vec![ExecutionStatus::Pending, ExecutionStatus::Running, ExecutionStatus::Streaming]
        );
        assert_eq!(ExecutionStatus::Running.predecessors().count(), 1);
        assert_eq!(ExecutionStatus::Pending.predecessors().count(), 0);
    }

    #[test]
    fn lease_expires_after_last_heartbeat() {
        let lease = chrono::Duration::seconds(60);
        let mut exec = sample();
        let claimed_at = exec.started_at + chrono::Duration::minutes(5);
        exec.claim(Uuid::now_v7(), claimed_at);

        assert!(!exec.lease_expired(claimed_at + chrono::Duration::seconds(59), lease));
        assert!(exec.lease_expired(claimed_at + chrono::Duration::seconds(61), lease));

        // Unclaimed records age from their start time.
        let unclaimed = sample();
        assert!(unclaimed.lease_expired(unclaimed.started_at + chrono::Duration::minutes(2), lease));
    }
}
