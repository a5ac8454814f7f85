//! Trigger types: normalized inbound events, registrations, and the context
//! an execution records about what started it.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// InboundEvent
// ---------------------------------------------------------------------------

/// A provider event after normalization by an integration adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundEvent {
    pub provider: String,
    pub event_type: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default = "Utc::now")]
    pub received_at: DateTime<Utc>,
}

impl InboundEvent {
    /// Build an event received now.
    pub fn new(provider: impl Into<String>, event_type: impl Into<String>, payload: Value) -> Self {
        Self {
            provider: provider.into(),
            event_type: event_type.into(),
            payload,
            received_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// EventFilter
// ---------------------------------------------------------------------------

/// Equality conditions on an event payload.
///
/// Keys are JSON pointers (`/pull_request/base/ref`); a bare key such as
/// `action` is treated as `/action`. Every condition must hold. An empty
/// filter matches any payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventFilter(pub BTreeMap<String, Value>);

impl EventFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a condition, builder style.
    pub fn require(mut self, pointer: impl Into<String>, expected: Value) -> Self {
        self.0.insert(pointer.into(), expected);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether every condition holds for `payload`.
    pub fn matches(&self, payload: &Value) -> bool {
        self.0.iter().all(|(key, expected)| {
            let found = if key.starts_with('/') {
                payload.pointer(key)
            } else {
                payload.pointer(&format!("/{key}"))
            };
            found == Some(expected)
        })
    }
}

// ---------------------------------------------------------------------------
// TriggerRegistration
// ---------------------------------------------------------------------------

/// Links an event source to a workflow owned by `owner`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerRegistration {
    pub workflow_id: Uuid,
    pub provider: String,
    pub event_type: String,
    #[serde(default)]
    pub filter: EventFilter,
    pub owner: String,
}

// ---------------------------------------------------------------------------
// TriggerContext
// ---------------------------------------------------------------------------

/// What started an execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum TriggerContext {
    /// Fired by an inbound provider event.
    Event {
        provider: String,
        event_type: String,
        payload: Value,
        received_at: DateTime<Utc>,
    },
    /// Invoked directly by a user or the API.
    Manual {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        input: Option<Value>,
    },
}

impl TriggerContext {
    /// Short label used in logs and persisted rows.
    pub fn kind(&self) -> &'static str {
        match self {
            TriggerContext::Event { .. } => "event",
            TriggerContext::Manual { .. } => "manual",
        }
    }
}

impl From<&InboundEvent> for TriggerContext {
    fn from(event: &InboundEvent) -> Self {
        TriggerContext::Event {
            provider: event.provider.clone(),
            event_type: event.event_type.clone(),
            payload: event.payload.clone(),
            received_at: event.received_at,
        }
    }
}
