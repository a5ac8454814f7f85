//! Trigger registry: (provider, event type) -> handler.
//!
//! Populated once at boot from an explicit, ordered list of handler
//! constructors, then shared behind an `Arc` and never mutated again, so
//! lookups and `resolve` take no lock.

use std::collections::HashMap;
use std::sync::Arc;

use jobstream_types::error::RepositoryError;
use jobstream_types::trigger::{InboundEvent, TriggerRegistration};

use super::handler::{HandlerConstructor, TriggerHandler};
use crate::repository::WorkflowStore;

/// A handler with the same (provider, event type) or name is already registered.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DuplicateHandlerError {
    #[error("a handler for ({provider}, {event_type}) is already registered")]
    Event { provider: String, event_type: String },

    #[error("a handler named '{0}' is already registered")]
    Name(String),
}

/// Errors from resolving an inbound event.
#[derive(Debug, thiserror::Error)]
pub enum TriggerError {
    #[error("failed to load trigger registrations: {0}")]
    Store(#[from] RepositoryError),
}

type EventKey = (String, String);

/// Immutable-after-boot map of trigger handlers.
#[derive(Default)]
pub struct TriggerRegistry {
    by_event: HashMap<EventKey, Arc<dyn TriggerHandler>>,
    by_name: HashMap<String, Arc<dyn TriggerHandler>>,
}

impl TriggerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Invoke each constructor in order and register its handler.
    pub fn boot(constructors: Vec<HandlerConstructor>) -> Result<Self, DuplicateHandlerError> {
        let mut registry = Self::new();
        for construct in constructors {
            registry.register(construct())?;
        }
        tracing::info!(handler_count = registry.len(), "trigger registry booted");
        Ok(registry)
    }

    /// Insert a handler keyed by (provider, event type) and by name.
    pub fn register(&mut self, handler: Arc<dyn TriggerHandler>) -> Result<(), DuplicateHandlerError> {
        let key = (handler.provider().to_string(), handler.event_type().to_string());
        if self.by_event.contains_key(&key) {
            return Err(DuplicateHandlerError::Event {
                provider: key.0,
                event_type: key.1,
            });
        }
        if self.by_name.contains_key(handler.name()) {
            return Err(DuplicateHandlerError::Name(handler.name().to_string()));
        }

        tracing::debug!(
            handler = handler.name(),
            provider = key.0.as_str(),
            event_type = key.1.as_str(),
            "registered trigger handler"
        );
        self.by_name.insert(handler.name().to_string(), Arc::clone(&handler));
        self.by_event.insert(key, handler);
        Ok(())
    }

    pub fn get_handler_by_event(&self, provider: &str, event_type: &str) -> Option<&Arc<dyn TriggerHandler>> {
        self.by_event
            .get(&(provider.to_string(), event_type.to_string()))
    }

    pub fn get_handler_by_name(&self, name: &str) -> Option<&Arc<dyn TriggerHandler>> {
        self.by_name.get(name)
    }

    pub fn len(&self) -> usize {
        self.by_event.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_event.is_empty()
    }

    /// Resolve an inbound event into the registrations it fires.
    ///
    /// No handler, or a handler whose predicate rejects the event, yields an
    /// empty list rather than an error.
    pub async fn resolve<S: WorkflowStore>(
        &self,
        store: &S,
        event: &InboundEvent,
    ) -> Result<Vec<TriggerRegistration>, TriggerError> {
        let Some(handler) = self.get_handler_by_event(&event.provider, &event.event_type) else {
            tracing::debug!(
                provider = event.provider.as_str(),
                event_type = event.event_type.as_str(),
                "no trigger handler for event"
            );
            return Ok(Vec::new());
        };

        if !handler.accepts(event) {
            tracing::debug!(handler = handler.name(), "event rejected by handler predicate");
            return Ok(Vec::new());
        }

        let candidates = store
            .list_active_triggers(&event.provider, &event.event_type)
            .await?;
        let selected = handler.select(event, candidates);

        tracing::info!(
            handler = handler.name(),
            registrations = selected.len(),
            "resolved inbound event"
        );
        Ok(selected)
    }
}

impl std::fmt::Debug for TriggerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.by_name.keys().collect();
        names.sort();
        f.debug_struct("TriggerRegistry")
            .field("handlers", &names)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::InMemoryWorkflowStore;
    use crate::trigger::handler::EventFilterHandler;
    use jobstream_types::trigger::EventFilter;
    use jobstream_types::workflow::{StepSpec, TriggerConfig, Workflow};
    use serde_json::json;

    fn handler(provider: &str, event_type: &str) -> Arc<dyn TriggerHandler> {
        Arc::new(EventFilterHandler::new(provider, event_type))
    }

    fn workflow_for(owner: &str, filter: EventFilter) -> Workflow {
        let mut wf = Workflow::new(format!("{owner}-wf"), owner);
        wf.activated = true;
        wf.steps.push(StepSpec {
            id: "s1".into(),
            name: "Step".into(),
            instruction: "do it".into(),
        });
        wf.trigger = Some(TriggerConfig {
            provider: "github".into(),
            event_type: "push".into(),
            filter,
        });
        wf
    }

    #[test]
    fn duplicate_event_key_rejected() {
        let mut registry = TriggerRegistry::new();
        registry.register(handler("github", "push")).unwrap();
        let err = registry.register(handler("github", "push")).unwrap_err();
        assert!(matches!(err, DuplicateHandlerError::Event { .. }));
    }

    #[test]
    fn duplicate_name_rejected() {
        let mut registry = TriggerRegistry::new();
        registry
            .register(Arc::new(EventFilterHandler::new("github", "push").named("x")))
            .unwrap();
        let err = registry
            .register(Arc::new(EventFilterHandler::new("gitlab", "push").named("x")))
            .unwrap_err();
        assert_eq!(err, DuplicateHandlerError::Name("x".into()));
    }

    #[test]
    fn lookups_return_none_when_missing() {
        let registry = TriggerRegistry::new();
        assert!(registry.get_handler_by_event("github", "push").is_none());
        assert!(registry.get_handler_by_name("github.push").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn boot_runs_constructors_in_order() {
        let constructors: Vec<HandlerConstructor> = vec![
            Box::new(|| handler("github", "push")),
            Box::new(|| handler("slack", "message")),
        ];
        let registry = TriggerRegistry::boot(constructors).unwrap();
        assert_eq!(registry.len(), 2);
        assert!(registry.get_handler_by_name("slack.message").is_some());
        assert!(registry.get_handler_by_event("github", "push").is_some());
    }

    #[test]
    fn boot_fails_on_duplicate() {
        let constructors: Vec<HandlerConstructor> = vec![
            Box::new(|| handler("github", "push")),
            Box::new(|| handler("github", "push")),
        ];
        assert!(TriggerRegistry::boot(constructors).is_err());
    }

    #[tokio::test]
    async fn resolve_fans_out_to_matching_registrations() {
        let store = InMemoryWorkflowStore::new();
        store.save(&workflow_for("alice", EventFilter::new())).await.unwrap();
        store
            .save(&workflow_for("bob", EventFilter::new().require("repo", json!("api"))))
            .await
            .unwrap();
        store
            .save(&workflow_for("carol", EventFilter::new().require("repo", json!("web"))))
            .await
            .unwrap();

        let mut registry = TriggerRegistry::new();
        registry.register(handler("github", "push")).unwrap();

        let event = InboundEvent::new("github", "push", json!({ "repo": "api" }));
        let regs = registry.resolve(&store, &event).await.unwrap();

        let mut owners: Vec<&str> = regs.iter().map(|r| r.owner.as_str()).collect();
        owners.sort();
        assert_eq!(owners, vec!["alice", "bob"]);
    }

    #[tokio::test]
    async fn resolve_without_handler_is_empty() {
        let store = InMemoryWorkflowStore::new();
        store.save(&workflow_for("alice", EventFilter::new())).await.unwrap();

        let registry = TriggerRegistry::new();
        let event = InboundEvent::new("github", "push", json!({}));
        assert!(registry.resolve(&store, &event).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn resolve_respects_handler_predicate() {
        let store = InMemoryWorkflowStore::new();
        store.save(&workflow_for("alice", EventFilter::new())).await.unwrap();

        let mut registry = TriggerRegistry::new();
        registry
            .register(Arc::new(
                EventFilterHandler::new("github", "push")
                    .requiring(EventFilter::new().require("ref", json!("refs/heads/main"))),
            ))
            .unwrap();

        let event = InboundEvent::new("github", "push", json!({ "ref": "refs/heads/dev" }));
        assert!(registry.resolve(&store, &event).await.unwrap().is_empty());
    }
}
