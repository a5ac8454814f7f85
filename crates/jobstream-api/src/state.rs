//! Application state wiring all services together.
//!
//! AppState holds the concrete dispatcher and worker runtime used by both the
//! CLI and the REST API. The dispatcher is generic over its storage ports;
//! AppState pins it to the SQLite implementations.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use jobstream_core::dispatch::JobDispatcher;
use jobstream_core::lifecycle::{BackgroundTask, ProviderSpec, WorkerRuntime};
use jobstream_core::ratelimit::TieredRateLimiter;
use jobstream_core::stream::{StreamManager, StreamSettings};
use jobstream_core::trigger::{EventFilterHandler, HandlerConstructor, TriggerHandler, TriggerRegistry};
use jobstream_infra::config::{load_global_config, resolve_data_dir};
use jobstream_infra::lifecycle::{DatabaseProvider, counter_purge_task};
use jobstream_infra::runner::StepEchoRunner;
use jobstream_infra::sqlite::pool::database_url;
use jobstream_infra::sqlite::{
    DatabasePool, SqliteCounterStore, SqliteExecutionRepository, SqliteWorkflowStore,
};
use jobstream_types::config::{GlobalConfig, HandlerConfig};

/// Dispatcher pinned to the SQLite stores.
pub type ConcreteDispatcher =
    JobDispatcher<SqliteWorkflowStore, SqliteExecutionRepository, SqliteCounterStore>;

/// How long shutdown waits for in-flight executions to finish.
const WORKER_STOP_TIMEOUT: Duration = Duration::from_secs(60);

/// How often expired usage counters are deleted.
const COUNTER_PURGE_INTERVAL: Duration = Duration::from_secs(3600);

/// Shared application state.
///
/// Used by both CLI commands and REST API handlers. The runtime is built
/// here but only started by commands that execute workflows.
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<ConcreteDispatcher>,
    pub runtime: Arc<WorkerRuntime>,
    pub config: Arc<GlobalConfig>,
    pub data_dir: PathBuf,
    pub db_pool: DatabasePool,
}

impl AppState {
    /// Initialize from `JOBSTREAM_DATA_DIR` (or `~/.jobstream`).
    pub async fn init() -> anyhow::Result<Self> {
        let data_dir = resolve_data_dir();
        tokio::fs::create_dir_all(&data_dir).await?;
        let config = load_global_config(&data_dir).await;
        Self::open(&data_dir, config).await
    }

    /// Connect to `{data_dir}/jobstream.db` and wire the dispatcher.
    pub async fn open(data_dir: &Path, config: GlobalConfig) -> anyhow::Result<Self> {
        let db_url = format!("{}?mode=rwc", database_url(data_dir));
        let db_pool = DatabasePool::new(&db_url).await?;

        let registry = TriggerRegistry::boot(handler_constructors(&config.handlers))?;
        let counters = SqliteCounterStore::new(db_pool.clone());
        let limiter = TieredRateLimiter::from_config(counters.clone(), &config);
        let streams = Arc::new(StreamManager::new(StreamSettings::from(&config.stream)));

        let dispatcher = Arc::new(JobDispatcher::new(
            Arc::new(SqliteWorkflowStore::new(db_pool.clone())),
            Arc::new(SqliteExecutionRepository::new(db_pool.clone())),
            Arc::new(limiter),
            Arc::clone(&streams),
            Arc::new(registry),
            Arc::new(StepEchoRunner::new()),
            config.worker.queue_capacity,
        )
        .with_lease(Duration::from_secs(config.worker.lease_secs.max(1))));

        let runtime = build_runtime(&dispatcher, &streams, counters, db_pool.clone(), &config);

        Ok(Self {
            dispatcher,
            runtime: Arc::new(runtime),
            config: Arc::new(config),
            data_dir: data_dir.to_path_buf(),
            db_pool,
        })
    }
}

/// One constructor per configured handler, in config order.
fn handler_constructors(handlers: &[HandlerConfig]) -> Vec<HandlerConstructor> {
    handlers
        .iter()
        .cloned()
        .map(|config| {
            Box::new(move || Arc::new(EventFilterHandler::from(&config)) as Arc<dyn TriggerHandler>)
                as HandlerConstructor
        })
        .collect()
}

/// Providers in acquisition order; shutdown releases them in reverse, so
/// workers drain before the sweeper and the database go away.
fn build_runtime(
    dispatcher: &Arc<ConcreteDispatcher>,
    streams: &Arc<StreamManager>,
    counters: SqliteCounterStore,
    db_pool: DatabasePool,
    config: &GlobalConfig,
) -> WorkerRuntime {
    let sweep_interval = Duration::from_secs(config.stream.sweep_interval_secs.max(1));
    let sweeper = {
        let streams = Arc::clone(streams);
        BackgroundTask::new("stream-sweeper", move |shutdown| {
            Arc::clone(&streams).run_sweeper(sweep_interval, shutdown)
        })
    };

    let renew_interval = (dispatcher.lease() / 3).max(Duration::from_secs(1));
    let lease_keeper = {
        let dispatcher = Arc::clone(dispatcher);
        BackgroundTask::new("lease-keeper", move |shutdown| {
            Arc::clone(&dispatcher).run_lease_keeper(renew_interval, shutdown)
        })
    };

    let worker_count = config.worker.concurrency;
    let workers = {
        let dispatcher = Arc::clone(dispatcher);
        BackgroundTask::new("dispatch-workers", move |shutdown| {
            Arc::clone(&dispatcher).run_workers(worker_count, shutdown)
        })
        .with_stop_timeout(WORKER_STOP_TIMEOUT)
    };

    WorkerRuntime::new(vec![
        ProviderSpec::required(Arc::new(DatabaseProvider::new(db_pool))),
        ProviderSpec::optional(Arc::new(counter_purge_task(counters, COUNTER_PURGE_INTERVAL))),
        ProviderSpec::required(Arc::new(sweeper)),
        ProviderSpec::required(Arc::new(lease_keeper)),
        ProviderSpec::required(Arc::new(workers)),
    ])
}

#[cfg(test)]
pub(crate) async fn test_state(config: GlobalConfig) -> AppState {
    let dir = tempfile::tempdir().unwrap();
    let state = AppState::open(dir.path(), config).await.unwrap();
    std::mem::forget(dir);
    state
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobstream_types::trigger::InboundEvent;
    use serde_json::json;

    #[tokio::test]
    async fn registry_follows_configured_handlers() {
        let mut config = GlobalConfig::default();
        config.handlers.push(HandlerConfig {
            provider: "github".into(),
            event_type: "push".into(),
            name: None,
            require: Default::default(),
        });
        let state = test_state(config).await;

        let registry = state.dispatcher.registry();
        assert_eq!(registry.len(), 1);
        assert!(registry.get_handler_by_name("github.push").is_some());
    }

    #[tokio::test]
    async fn duplicate_handlers_fail_boot() {
        let mut config = GlobalConfig::default();
        let handler = HandlerConfig {
            provider: "github".into(),
            event_type: "push".into(),
            name: None,
            require: Default::default(),
        };
        config.handlers = vec![handler.clone(), handler];

        let dir = tempfile::tempdir().unwrap();
        assert!(AppState::open(dir.path(), config).await.is_err());
    }

    #[tokio::test]
    async fn runtime_starts_and_stops_cleanly() {
        let state = test_state(GlobalConfig::default()).await;

        let report = state.runtime.startup().await.unwrap().unwrap();
        assert!(!report.is_degraded());
        assert!(state.runtime.is_running().await);

        // Unhandled events resolve to nothing while the runtime is up.
        let outcomes = state
            .dispatcher
            .ingest(&InboundEvent::new("slack", "message", json!({})))
            .await
            .unwrap();
        assert!(outcomes.is_empty());

        let shutdown = state.runtime.shutdown().await.unwrap();
        assert!(shutdown.failures.is_empty());
        assert!(!state.runtime.is_running().await);
    }
}
