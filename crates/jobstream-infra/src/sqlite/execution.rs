//! SQLite execution repository implementation.

use chrono::{DateTime, Utc};
use jobstream_core::repository::ExecutionRepository;
use jobstream_types::error::RepositoryError;
use jobstream_types::execution::{Execution, ExecutionStatus};
use sqlx::Row;
use uuid::Uuid;

use super::pool::DatabasePool;
use super::{format_datetime, parse_datetime, parse_uuid};

const COLUMNS: &str = "id, workflow_id, owner, tier, quota_bypassed, status, trigger, \
                       started_at, completed_at, error, claimed_by, heartbeat_at";

/// SQLite-backed implementation of `ExecutionRepository`.
pub struct SqliteExecutionRepository {
    pool: DatabasePool,
}

impl SqliteExecutionRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

struct ExecutionRow {
    id: String,
    workflow_id: String,
    owner: String,
    tier: String,
    quota_bypassed: bool,
    status: String,
    trigger: String,
    started_at: String,
    completed_at: Option<String>,
    error: Option<String>,
    claimed_by: Option<String>,
    heartbeat_at: Option<String>,
}

impl ExecutionRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            workflow_id: row.try_get("workflow_id")?,
            owner: row.try_get("owner")?,
            tier: row.try_get("tier")?,
            quota_bypassed: row.try_get("quota_bypassed")?,
            status: row.try_get("status")?,
            trigger: row.try_get("trigger")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            error: row.try_get("error")?,
            claimed_by: row.try_get("claimed_by")?,
            heartbeat_at: row.try_get("heartbeat_at")?,
        })
    }

    fn into_execution(self) -> Result<Execution, RepositoryError> {
        let status = self
            .status
            .parse::<ExecutionStatus>()
            .map_err(RepositoryError::Query)?;
        let trigger = serde_json::from_str(&self.trigger)
            .map_err(|e| RepositoryError::Query(format!("invalid trigger JSON: {e}")))?;
        let completed_at = self
            .completed_at
            .as_deref()
            .map(parse_datetime)
            .transpose()?;
        let claimed_by = self.claimed_by.as_deref().map(parse_uuid).transpose()?;
        let heartbeat_at = self
            .heartbeat_at
            .as_deref()
            .map(parse_datetime)
            .transpose()?;

        Ok(Execution {
            id: parse_uuid(&self.id)?,
            workflow_id: parse_uuid(&self.workflow_id)?,
            owner: self.owner,
            tier: self.tier,
            quota_bypassed: self.quota_bypassed,
            status,
            trigger,
            started_at: parse_datetime(&self.started_at)?,
            completed_at,
            error: self.error,
            claimed_by,
            heartbeat_at,
        })
    }
}

fn decode_rows(rows: &[sqlx::sqlite::SqliteRow]) -> Result<Vec<Execution>, RepositoryError> {
    rows.iter()
        .map(|row| {
            ExecutionRow::from_row(row)
                .map_err(|e| RepositoryError::Query(e.to_string()))?
                .into_execution()
        })
        .collect()
}

impl ExecutionRepository for SqliteExecutionRepository {
    async fn create(&self, execution: &Execution) -> Result<(), RepositoryError> {
        let trigger = serde_json::to_string(&execution.trigger)
            .map_err(|e| RepositoryError::Query(format!("serialize trigger: {e}")))?;

        sqlx::query(
            r#"INSERT INTO executions
               (id, workflow_id, owner, tier, quota_bypassed, status, trigger,
                started_at, completed_at, error, claimed_by, heartbeat_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(execution.id.to_string())
        .bind(execution.workflow_id.to_string())
        .bind(&execution.owner)
        .bind(&execution.tier)
        .bind(execution.quota_bypassed)
        .bind(execution.status.as_str())
        .bind(&trigger)
        .bind(format_datetime(&execution.started_at))
        .bind(execution.completed_at.as_ref().map(format_datetime))
        .bind(&execution.error)
        .bind(execution.claimed_by.map(|id| id.to_string()))
        .bind(execution.heartbeat_at.as_ref().map(format_datetime))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| match e.as_database_error() {
            Some(db) if db.is_unique_violation() => {
                RepositoryError::Conflict(format!("execution {} already exists", execution.id))
            }
            _ => RepositoryError::Query(e.to_string()),
        })?;

        Ok(())
    }

    async fn update_status(&self, execution: &Execution) -> Result<(), RepositoryError> {
        let predecessors: Vec<ExecutionStatus> = execution.status.predecessors().collect();
        let mut applied = false;

        if !predecessors.is_empty() {
            let placeholders = vec!["?"; predecessors.len()].join(", ");
            let sql = format!(
                "UPDATE executions SET status = ?, completed_at = ?, error = ? \
                 WHERE id = ? AND status IN ({placeholders})"
            );
            let mut query = sqlx::query(&sql)
                .bind(execution.status.as_str())
                .bind(execution.completed_at.as_ref().map(format_datetime))
                .bind(&execution.error)
                .bind(execution.id.to_string());
            for status in &predecessors {
                query = query.bind(status.as_str());
            }
            let result = query
                .execute(&self.pool.writer)
                .await
                .map_err(|e| RepositoryError::Query(e.to_string()))?;
            applied = result.rows_affected() > 0;
        }

        if applied {
            return Ok(());
        }

        let stored: Option<String> = sqlx::query_scalar("SELECT status FROM executions WHERE id = ?")
            .bind(execution.id.to_string())
            .fetch_optional(&self.pool.writer)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;
        match stored {
            Some(status) => Err(RepositoryError::Conflict(format!(
                "execution {} is already {status}",
                execution.id
            ))),
            None => Err(RepositoryError::NotFound),
        }
    }

    async fn renew_leases(&self, instance: &Uuid, now: DateTime<Utc>) -> Result<u64, RepositoryError> {
        let result = sqlx::query(
            "UPDATE executions SET heartbeat_at = ? \
             WHERE claimed_by = ? AND status IN ('pending', 'running', 'streaming')",
        )
        .bind(format_datetime(&now))
        .bind(instance.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(result.rows_affected())
    }

    async fn get(&self, id: &Uuid) -> Result<Option<Execution>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM executions WHERE id = ?"))
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        match row {
            Some(row) => {
                let exec_row =
                    ExecutionRow::from_row(&row).map_err(|e| RepositoryError::Query(e.to_string()))?;
                Ok(Some(exec_row.into_execution()?))
            }
            None => Ok(None),
        }
    }

    async fn list_for_workflow(
        &self,
        workflow_id: &Uuid,
        limit: u32,
    ) -> Result<Vec<Execution>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM executions WHERE workflow_id = ? \
             ORDER BY started_at DESC, id DESC LIMIT ?"
        ))
        .bind(workflow_id.to_string())
        .bind(limit)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        decode_rows(&rows)
    }

    async fn list_unfinished(&self) -> Result<Vec<Execution>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM executions \
             WHERE status IN ('pending', 'running', 'streaming') ORDER BY started_at ASC"
        ))
        .fetch_all(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        decode_rows(&rows)
    }
}
