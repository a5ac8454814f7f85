//! Workflow domain types for jobstream.
//!
//! A `Workflow` is a user-owned, ordered list of steps plus activation state
//! and the trigger configuration that links it to an inbound event source.
//! Workflows are mutated only by their owner and are deactivated rather than
//! deleted while trigger registrations still point at them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::trigger::EventFilter;

// ---------------------------------------------------------------------------
// Workflow
// ---------------------------------------------------------------------------

/// A user-defined workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    /// UUIDv7 assigned on creation. Generated when absent from imported files.
    #[serde(default = "Uuid::now_v7")]
    pub id: Uuid,
    /// Human-readable title.
    pub title: String,
    /// Identity that owns this workflow (and pays its quota).
    pub owner: String,
    /// Whether the workflow may be executed.
    #[serde(default)]
    pub activated: bool,
    /// Ordered step specifications handed to the agent runner.
    #[serde(default)]
    pub steps: Vec<StepSpec>,
    /// Event source that fires this workflow. `None` means unconfigured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger: Option<TriggerConfig>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl Workflow {
    /// Create an inactive workflow with no steps and no trigger.
    pub fn new(title: impl Into<String>, owner: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            title: title.into(),
            owner: owner.into(),
            activated: false,
            steps: Vec::new(),
            trigger: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A single step of a workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepSpec {
    /// Step ID, unique within the workflow (e.g. "summarize").
    pub id: String,
    /// Display name.
    pub name: String,
    /// Free-text instruction passed to the agent runner.
    pub instruction: String,
}

/// Which provider event starts a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerConfig {
    /// Integration provider (e.g. "github", "slack").
    pub provider: String,
    /// Provider-specific event type (e.g. "push", "message").
    pub event_type: String,
    /// Payload conditions that must hold for the trigger to fire.
    #[serde(default, skip_serializing_if = "EventFilter::is_empty")]
    pub filter: EventFilter,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn new_workflow_is_inactive_and_empty() {
        let wf = Workflow::new("Digest", "user-1");
        assert!(!wf.activated);
        assert!(wf.steps.is_empty());
        assert!(wf.trigger.is_none());
        assert_eq!(wf.owner, "user-1");
    }

    #[test]
    fn deserialize_minimal_yaml_shaped_json() {
        let value = json!({
            "id": Uuid::now_v7(),
            "title": "PR reviewer",
            "owner": "acme",
            "activated": true,
            "steps": [
                { "id": "read", "name": "Read diff", "instruction": "Summarize the diff" }
            ],
            "trigger": {
                "provider": "github",
                "event_type": "pull_request",
                "filter": { "/action": "opened" }
            }
        });

        let wf: Workflow = serde_json::from_value(value).unwrap();
        assert!(wf.activated);
        assert_eq!(wf.steps.len(), 1);
        let trigger = wf.trigger.unwrap();
        assert_eq!(trigger.provider, "github");
        assert!(!trigger.filter.is_empty());
    }

    #[test]
    fn missing_activated_defaults_to_false() {
        let value = json!({
            "id": Uuid::now_v7(),
            "title": "t",
            "owner": "o",
        });
        let wf: Workflow = serde_json::from_value(value).unwrap();
        assert!(!wf.activated);
        assert!(wf.steps.is_empty());
    }
}
