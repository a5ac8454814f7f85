//! In-memory repository implementations backed by `DashMap`.
//!
//! Suitable for single-process embedding and for tests. Nothing is persisted.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use jobstream_types::error::RepositoryError;
use jobstream_types::execution::Execution;
use jobstream_types::trigger::TriggerRegistration;
use jobstream_types::workflow::Workflow;
use uuid::Uuid;

use super::execution::ExecutionRepository;
use super::workflow::{WorkflowStore, registration_for};

/// `WorkflowStore` held entirely in memory.
#[derive(Debug, Default)]
pub struct InMemoryWorkflowStore {
    workflows: DashMap<Uuid, Workflow>,
}

impl InMemoryWorkflowStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl WorkflowStore for InMemoryWorkflowStore {
    async fn get(&self, id: &Uuid) -> Result<Option<Workflow>, RepositoryError> {
        Ok(self.workflows.get(id).map(|entry| entry.value().clone()))
    }

    async fn save(&self, workflow: &Workflow) -> Result<(), RepositoryError> {
        self.workflows.insert(workflow.id, workflow.clone());
        Ok(())
    }

    async fn list(&self, owner: Option<&str>) -> Result<Vec<Workflow>, RepositoryError> {
        let mut workflows: Vec<Workflow> = self
            .workflows
            .iter()
            .filter(|entry| owner.is_none_or(|o| entry.owner == o))
            .map(|entry| entry.value().clone())
            .collect();
        workflows.sort_by_key(|w| w.created_at);
        Ok(workflows)
    }

    async fn list_active_triggers(
        &self,
        provider: &str,
        event_type: &str,
    ) -> Result<Vec<TriggerRegistration>, RepositoryError> {
        Ok(self
            .workflows
            .iter()
            .filter_map(|entry| registration_for(entry.value(), provider, event_type))
            .collect())
    }
}

/// `ExecutionRepository` held entirely in memory.
#[derive(Debug, Default)]
pub struct InMemoryExecutionRepository {
    executions: DashMap<Uuid, Execution>,
}

impl InMemoryExecutionRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ExecutionRepository for InMemoryExecutionRepository {
    async fn create(&self, execution: &Execution) -> Result<(), RepositoryError> {
        if self.executions.contains_key(&execution.id) {
            return Err(RepositoryError::Conflict(format!(
                "execution {} already exists",
                execution.id
            )));
        }
        self.executions.insert(execution.id, execution.clone());
        Ok(())
    }

    async fn update_status(&self, execution: &Execution) -> Result<(), RepositoryError> {
        let mut stored = self
            .executions
            .get_mut(&execution.id)
            .ok_or(RepositoryError::NotFound)?;
        if !stored.status.can_transition_to(execution.status) {
            return Err(RepositoryError::Conflict(format!(
                "execution {} is already {}",
                execution.id, stored.status
            )));
        }
        stored.status = execution.status;
        stored.completed_at = execution.completed_at;
        stored.error = execution.error.clone();
        Ok(())
    }

    async fn get(&self, id: &Uuid) -> Result<Option<Execution>, RepositoryError> {
        Ok(self.executions.get(id).map(|entry| entry.value().clone()))
    }

    async fn list_for_workflow(
        &self,
        workflow_id: &Uuid,
        limit: u32,
    ) -> Result<Vec<Execution>, RepositoryError> {
        let mut runs: Vec<Execution> = self
            .executions
            .iter()
            .filter(|entry| entry.workflow_id == *workflow_id)
            .map(|entry| entry.value().clone())
            .collect();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        runs.truncate(limit as usize);
        Ok(runs)
    }

    async fn renew_leases(&self, instance: &Uuid, now: DateTime<Utc>) -> Result<u64, RepositoryError> {
        let mut renewed = 0;
        for mut entry in self.executions.iter_mut() {
            if entry.claimed_by == Some(*instance) && !entry.status.is_terminal() {
                entry.heartbeat_at = Some(now);
                renewed += 1;
            }
        }
        Ok(renewed)
    }

    async fn list_unfinished(&self) -> Result<Vec<Execution>, RepositoryError> {
        Ok(self
            .executions
            .iter()
            .filter(|entry| !entry.status.is_terminal())
            .map(|entry| entry.value().clone())
            .collect())
    }
}
