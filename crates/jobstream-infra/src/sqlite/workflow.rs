//! SQLite workflow store implementation.
//!
//! Workflows are stored as JSON blobs. Owner, activation and trigger columns
//! are kept alongside for filtering without decoding every row.

use chrono::Utc;
use jobstream_core::repository::WorkflowStore;
use jobstream_core::repository::workflow::registration_for;
use jobstream_types::error::RepositoryError;
use jobstream_types::trigger::TriggerRegistration;
use jobstream_types::workflow::Workflow;
use sqlx::Row;
use uuid::Uuid;

use super::format_datetime;
use super::pool::DatabasePool;

/// SQLite-backed implementation of `WorkflowStore`.
pub struct SqliteWorkflowStore {
    pool: DatabasePool,
}

impl SqliteWorkflowStore {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

fn decode(row: &sqlx::sqlite::SqliteRow) -> Result<Workflow, RepositoryError> {
    let definition: String = row
        .try_get("definition")
        .map_err(|e| RepositoryError::Query(e.to_string()))?;
    serde_json::from_str(&definition)
        .map_err(|e| RepositoryError::Query(format!("invalid workflow JSON: {e}")))
}

impl WorkflowStore for SqliteWorkflowStore {
    async fn get(&self, id: &Uuid) -> Result<Option<Workflow>, RepositoryError> {
        let row = sqlx::query("SELECT definition FROM workflows WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        row.as_ref().map(decode).transpose()
    }

    async fn save(&self, workflow: &Workflow) -> Result<(), RepositoryError> {
        let mut stored = workflow.clone();
        stored.updated_at = Utc::now();
        let definition = serde_json::to_string(&stored)
            .map_err(|e| RepositoryError::Query(format!("serialize workflow: {e}")))?;
        let (provider, event_type) = match &stored.trigger {
            Some(t) => (Some(t.provider.as_str()), Some(t.event_type.as_str())),
            None => (None, None),
        };

        sqlx::query(
            r#"INSERT INTO workflows
               (id, title, owner, activated, trigger_provider, trigger_event_type,
                definition, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET
                 title = excluded.title,
                 owner = excluded.owner,
                 activated = excluded.activated,
                 trigger_provider = excluded.trigger_provider,
                 trigger_event_type = excluded.trigger_event_type,
                 definition = excluded.definition,
                 updated_at = excluded.updated_at"#,
        )
        .bind(stored.id.to_string())
        .bind(&stored.title)
        .bind(&stored.owner)
        .bind(stored.activated)
        .bind(provider)
        .bind(event_type)
        .bind(&definition)
        .bind(format_datetime(&stored.created_at))
        .bind(format_datetime(&stored.updated_at))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(())
    }

    async fn list(&self, owner: Option<&str>) -> Result<Vec<Workflow>, RepositoryError> {
        let rows = match owner {
            Some(owner) => {
                sqlx::query("SELECT definition FROM workflows WHERE owner = ? ORDER BY title ASC")
                    .bind(owner)
                    .fetch_all(&self.pool.reader)
                    .await
            }
            None => {
                sqlx::query("SELECT definition FROM workflows ORDER BY title ASC")
                    .fetch_all(&self.pool.reader)
                    .await
            }
        }
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        rows.iter().map(decode).collect()
    }

    async fn list_active_triggers(
        &self,
        provider: &str,
        event_type: &str,
    ) -> Result<Vec<TriggerRegistration>, RepositoryError> {
        let rows = sqlx::query(
            r#"SELECT definition FROM workflows
               WHERE activated = 1 AND trigger_provider = ? AND trigger_event_type = ?"#,
        )
        .bind(provider)
        .bind(event_type)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        let mut registrations = Vec::with_capacity(rows.len());
        for row in &rows {
            let workflow = decode(row)?;
            if let Some(reg) = registration_for(&workflow, provider, event_type) {
                registrations.push(reg);
            }
        }
        Ok(registrations)
    }
}
