//! SQLite storage layer.
//!
//! Repository and counter store implementations backed by SQLite with WAL
//! mode and split read/write connection pools.

pub mod counter;
pub mod execution;
pub mod pool;
pub mod workflow;

pub use counter::SqliteCounterStore;
pub use execution::SqliteExecutionRepository;
pub use pool::DatabasePool;
pub use workflow::SqliteWorkflowStore;

use chrono::{DateTime, Utc};
use jobstream_types::error::RepositoryError;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn parse_uuid(s: &str) -> Result<Uuid, RepositoryError> {
    s.parse::<Uuid>()
        .map_err(|e| RepositoryError::Query(format!("invalid UUID: {e}")))
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

#[cfg(test)]
pub(crate) async fn test_pool() -> DatabasePool {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("test.db");
    let url = format!("sqlite://{}?mode=rwc", db_path.display());
    std::mem::forget(dir);
    DatabasePool::new(&url).await.unwrap()
}
