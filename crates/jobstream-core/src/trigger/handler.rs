//! Trigger handlers: per-(provider, event type) filtering of inbound events.

use std::sync::Arc;

use jobstream_types::config::HandlerConfig;
use jobstream_types::trigger::{EventFilter, InboundEvent, TriggerRegistration};

/// Decides which registrations an inbound event fires.
///
/// Handlers are registered once at boot and then shared read-only, so they
/// must be `Send + Sync` and free of interior mutation.
pub trait TriggerHandler: Send + Sync {
    /// Unique handler name.
    fn name(&self) -> &str;

    fn provider(&self) -> &str;

    fn event_type(&self) -> &str;

    /// Handler-level predicate. A rejected event fires nothing.
    fn accepts(&self, event: &InboundEvent) -> bool;

    /// Narrow the candidate registrations for an accepted event.
    ///
    /// The default keeps registrations whose own filter matches the payload.
    fn select(
        &self,
        event: &InboundEvent,
        candidates: Vec<TriggerRegistration>,
    ) -> Vec<TriggerRegistration> {
        candidates
            .into_iter()
            .filter(|reg| reg.filter.matches(&event.payload))
            .collect()
    }
}

/// Constructor invoked once at boot to build a handler.
pub type HandlerConstructor = Box<dyn FnOnce() -> Arc<dyn TriggerHandler>>;

/// Generic handler matching on provider, event type, and an optional
/// required-payload filter.
#[derive(Debug, Clone)]
pub struct EventFilterHandler {
    name: String,
    provider: String,
    event_type: String,
    require: EventFilter,
}

impl EventFilterHandler {
    /// Handler named `{provider}.{event_type}` that accepts every event.
    pub fn new(provider: impl Into<String>, event_type: impl Into<String>) -> Self {
        let provider = provider.into();
        let event_type = event_type.into();
        Self {
            name: format!("{provider}.{event_type}"),
            provider,
            event_type,
            require: EventFilter::new(),
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Only accept events whose payload satisfies `filter`.
    pub fn requiring(mut self, filter: EventFilter) -> Self {
        self.require = filter;
        self
    }
}

impl From<&HandlerConfig> for EventFilterHandler {
    fn from(config: &HandlerConfig) -> Self {
        let mut handler = EventFilterHandler::new(&config.provider, &config.event_type)
            .requiring(EventFilter(config.require.clone()));
        if let Some(name) = &config.name {
            handler = handler.named(name);
        }
        handler
    }
}

impl TriggerHandler for EventFilterHandler {
    fn name(&self) -> &str {
        &self.name
    }

    fn provider(&self) -> &str {
        &self.provider
    }

    fn event_type(&self) -> &str {
        &self.event_type
    }

    fn accepts(&self, event: &InboundEvent) -> bool {
        event.provider == self.provider
            && event.event_type == self.event_type
            && self.require.matches(&event.payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    fn registration(filter: EventFilter) -> TriggerRegistration {
        TriggerRegistration {
            workflow_id: Uuid::now_v7(),
            provider: "github".into(),
            event_type: "push".into(),
            filter,
            owner: "acme".into(),
        }
    }

    #[test]
    fn default_name_is_provider_dot_event() {
        let handler = EventFilterHandler::new("github", "push");
        assert_eq!(handler.name(), "github.push");
        assert_eq!(handler.named("gh-push").name(), "gh-push");
    }

    #[test]
    fn accepts_checks_required_payload() {
        let handler = EventFilterHandler::new("github", "push")
            .requiring(EventFilter::new().require("ref", json!("refs/heads/main")));

        let main = InboundEvent::new("github", "push", json!({ "ref": "refs/heads/main" }));
        let feature = InboundEvent::new("github", "push", json!({ "ref": "refs/heads/feat" }));
        let other_type = InboundEvent::new("github", "issues", json!({ "ref": "refs/heads/main" }));

        assert!(handler.accepts(&main));
        assert!(!handler.accepts(&feature));
        assert!(!handler.accepts(&other_type));
    }

    #[test]
    fn select_applies_registration_filters() {
        let handler = EventFilterHandler::new("github", "push");
        let event = InboundEvent::new("github", "push", json!({ "repo": "api" }));

        let selected = handler.select(
            &event,
            vec![
                registration(EventFilter::new()),
                registration(EventFilter::new().require("repo", json!("api"))),
                registration(EventFilter::new().require("repo", json!("web"))),
            ],
        );
        assert_eq!(selected.len(), 2);
    }

    #[test]
    fn from_config_carries_name_and_filter() {
        let config = HandlerConfig {
            provider: "slack".into(),
            event_type: "message".into(),
            name: Some("slack-mentions".into()),
            require: [("/type".to_string(), json!("app_mention"))].into_iter().collect(),
        };
        let handler = EventFilterHandler::from(&config);
        assert_eq!(handler.name(), "slack-mentions");
        assert!(handler.accepts(&InboundEvent::new("slack", "message", json!({ "type": "app_mention" }))));
        assert!(!handler.accepts(&InboundEvent::new("slack", "message", json!({ "type": "message" }))));
    }
}
