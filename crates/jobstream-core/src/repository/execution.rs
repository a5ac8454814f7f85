//! Execution repository trait definition.

use chrono::{DateTime, Utc};
use jobstream_types::error::RepositoryError;
use jobstream_types::execution::Execution;
use uuid::Uuid;

/// Storage interface for execution records.
pub trait ExecutionRepository: Send + Sync {
    /// Persist a newly created execution.
    fn create(
        &self,
        execution: &Execution,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Write the execution's current status, completion time, and error.
    ///
    /// Applies only while the stored status ranks strictly below the new
    /// one. A record that already moved on yields `RepositoryError::Conflict`.
    fn update_status(
        &self,
        execution: &Execution,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<Execution>, RepositoryError>> + Send;

    /// Executions of one workflow, newest first.
    fn list_for_workflow(
        &self,
        workflow_id: &Uuid,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<Execution>, RepositoryError>> + Send;

    /// Stamp `now` as the heartbeat of every unfinished execution claimed by
    /// `instance`. Returns how many were renewed.
    fn renew_leases(
        &self,
        instance: &Uuid,
        now: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<u64, RepositoryError>> + Send;

    /// Executions not yet in a terminal status (crash recovery).
    fn list_unfinished(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<Execution>, RepositoryError>> + Send;
}
