//! Workflow store trait definition.
//!
//! Read side used by the dispatcher (`get`) and the trigger registry
//! (`list_active_triggers`); write side used by the CLI and API.

use jobstream_types::error::RepositoryError;
use jobstream_types::trigger::TriggerRegistration;
use jobstream_types::workflow::Workflow;
use uuid::Uuid;

/// Storage interface for workflow definitions.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait WorkflowStore: Send + Sync {
    /// Get a workflow by ID. `Ok(None)` when it does not exist.
    fn get(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<Workflow>, RepositoryError>> + Send;

    /// Insert or replace a workflow by ID.
    fn save(
        &self,
        workflow: &Workflow,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// List workflows, optionally restricted to one owner.
    fn list(
        &self,
        owner: Option<&str>,
    ) -> impl std::future::Future<Output = Result<Vec<Workflow>, RepositoryError>> + Send;

    /// Registrations of every activated workflow triggered by (provider, event_type).
    fn list_active_triggers(
        &self,
        provider: &str,
        event_type: &str,
    ) -> impl std::future::Future<Output = Result<Vec<TriggerRegistration>, RepositoryError>> + Send;
}

/// Build the registration a workflow contributes, if it is activated and
/// triggered by (provider, event_type).
pub fn registration_for(
    workflow: &Workflow,
    provider: &str,
    event_type: &str,
) -> Option<TriggerRegistration> {
    if !workflow.activated {
        return None;
    }
    let trigger = workflow.trigger.as_ref()?;
    if trigger.provider != provider || trigger.event_type != event_type {
        return None;
    }
    Some(TriggerRegistration {
        workflow_id: workflow.id,
        provider: trigger.provider.clone(),
        event_type: trigger.event_type.clone(),
        filter: trigger.filter.clone(),
        owner: workflow.owner.clone(),
    })
}
