//! Job dispatcher: admission, queueing, and execution of workflow runs.
//!
//! `submit` does all the checks that can reject a request (workflow lookup,
//! validation, quota) and returns as soon as the pending execution is
//! queued. Worker tasks pull from the shared queue and drive each execution
//! through running and streaming to exactly one terminal state, mirroring
//! that state onto the execution's stream channel.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use futures_util::future::join_all;
use jobstream_types::error::{
    CounterStoreError, RateLimitExceeded, RepositoryError, ValidationError,
};
use jobstream_types::execution::{Execution, ExecutionStatus};
use jobstream_types::stream::EnvelopeType;
use jobstream_types::trigger::{InboundEvent, TriggerContext};
use jobstream_types::workflow::Workflow;
use serde_json::Value;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::runner::AgentRunner;
use crate::ratelimit::{AdmissionError, CounterStore, TieredRateLimiter};
use crate::repository::{ExecutionRepository, WorkflowStore};
use crate::stream::{StreamError, StreamManager};
use crate::trigger::{TriggerError, TriggerRegistry};
use crate::workflow::validator::validate_for_execution;

/// Error recorded on executions whose owning dispatcher stopped renewing its lease.
pub const ORPHANED_ERROR: &str = "worker stopped before the execution finished";

/// How long an execution's claim stays valid without a heartbeat.
pub const DEFAULT_LEASE: Duration = Duration::from_secs(60);

/// A request to run one workflow.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub workflow_id: Uuid,
    pub trigger: TriggerContext,
    /// Skip quota checks for trusted or system-confirmed executions.
    pub bypass_quota: bool,
}

impl ExecutionRequest {
    /// A direct invocation by the workflow's owner.
    pub fn manual(workflow_id: Uuid, input: Option<Value>) -> Self {
        Self {
            workflow_id,
            trigger: TriggerContext::Manual { input },
            bypass_quota: false,
        }
    }
}

/// Everything `submit` can reject a request with.
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("workflow {0} not found")]
    WorkflowNotFound(Uuid),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    RateLimited(#[from] RateLimitExceeded),

    #[error("unknown quota tier '{0}'")]
    UnknownTier(String),

    #[error(transparent)]
    CounterStore(#[from] CounterStoreError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error("execution queue is full")]
    QueueFull,

    #[error("execution queue is closed")]
    QueueClosed,
}

impl From<AdmissionError> for SubmitError {
    fn from(err: AdmissionError) -> Self {
        match err {
            AdmissionError::Exceeded(e) => SubmitError::RateLimited(e),
            AdmissionError::UnknownTier(tier) => SubmitError::UnknownTier(tier),
            AdmissionError::Store(e) => SubmitError::CounterStore(e),
        }
    }
}

/// Result of submitting one registration fired by an inbound event.
#[derive(Debug)]
pub struct IngestOutcome {
    pub workflow_id: Uuid,
    pub owner: String,
    pub result: Result<Uuid, SubmitError>,
}

struct QueuedExecution {
    execution: Execution,
    workflow: Workflow,
}

/// How an execution ended, before it is mirrored onto the stream.
#[derive(Debug)]
enum Outcome {
    Completed,
    Cancelled,
    Failed(String),
}

/// Admits, queues, and runs workflow executions.
pub struct JobDispatcher<W, E, C>
where
    W: WorkflowStore,
    E: ExecutionRepository,
    C: CounterStore,
{
    workflows: Arc<W>,
    executions: Arc<E>,
    limiter: Arc<TieredRateLimiter<C>>,
    streams: Arc<StreamManager>,
    registry: Arc<TriggerRegistry>,
    runner: Arc<dyn AgentRunner>,
    queue_tx: mpsc::Sender<QueuedExecution>,
    queue_rx: Mutex<mpsc::Receiver<QueuedExecution>>,
    instance_id: Uuid,
    lease: Duration,
}

impl<W, E, C> JobDispatcher<W, E, C>
where
    W: WorkflowStore + 'static,
    E: ExecutionRepository + 'static,
    C: CounterStore + 'static,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        workflows: Arc<W>,
        executions: Arc<E>,
        limiter: Arc<TieredRateLimiter<C>>,
        streams: Arc<StreamManager>,
        registry: Arc<TriggerRegistry>,
        runner: Arc<dyn AgentRunner>,
        queue_capacity: usize,
    ) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel(queue_capacity.max(1));
        Self {
            workflows,
            executions,
            limiter,
            streams,
            registry,
            runner,
            queue_tx,
            queue_rx: Mutex::new(queue_rx),
            instance_id: Uuid::now_v7(),
            lease: DEFAULT_LEASE,
        }
    }

    /// Override how long claims survive without a heartbeat.
    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    /// Identifies this dispatcher in execution claims.
    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn lease(&self) -> Duration {
        self.lease
    }

    pub fn workflows(&self) -> &Arc<W> {
        &self.workflows
    }

    pub fn executions(&self) -> &Arc<E> {
        &self.executions
    }

    pub fn streams(&self) -> &Arc<StreamManager> {
        &self.streams
    }

    pub fn limiter(&self) -> &Arc<TieredRateLimiter<C>> {
        &self.limiter
    }

    pub fn registry(&self) -> &Arc<TriggerRegistry> {
        &self.registry
    }

    /// Admit and enqueue one execution. Returns its id without waiting for it
    /// to run.
    pub async fn submit(&self, request: ExecutionRequest) -> Result<Uuid, SubmitError> {
        let workflow = self
            .workflows
            .get(&request.workflow_id)
            .await?
            .ok_or(SubmitError::WorkflowNotFound(request.workflow_id))?;

        validate_for_execution(&workflow)?;

        let tier = self.limiter.tier_for(&workflow.owner).to_string();
        self.limiter
            .check_and_increment(&workflow.owner, &tier, 1, request.bypass_quota)
            .await?;

        let mut execution = Execution::pending(workflow.id, &workflow.owner, &tier, request.trigger);
        execution.quota_bypassed = request.bypass_quota;
        execution.claim(self.instance_id, execution.started_at);

        if let Err(e) = self.executions.create(&execution).await {
            self.release_quota(&execution).await;
            return Err(e.into());
        }
        self.streams.open(execution.stream_channel_id());

        let execution_id = execution.id;
        let queued = QueuedExecution {
            execution: execution.clone(),
            workflow,
        };
        if let Err(e) = self.queue_tx.try_send(queued) {
            let err = match e {
                mpsc::error::TrySendError::Full(_) => SubmitError::QueueFull,
                mpsc::error::TrySendError::Closed(_) => SubmitError::QueueClosed,
            };
            self.finish(&mut execution, Outcome::Failed(err.to_string()))
                .await;
            return Err(err);
        }

        tracing::info!(
            %execution_id,
            workflow_id = %execution.workflow_id,
            owner = execution.owner.as_str(),
            tier = execution.tier.as_str(),
            trigger = execution.trigger.kind(),
            "execution queued"
        );
        Ok(execution_id)
    }

    /// Resolve an inbound event and submit every registration it fires.
    ///
    /// Registrations are submitted concurrently; one failing does not affect
    /// the others.
    pub async fn ingest(&self, event: &InboundEvent) -> Result<Vec<IngestOutcome>, TriggerError> {
        let registrations = self.registry.resolve(self.workflows.as_ref(), event).await?;
        let trigger = TriggerContext::from(event);

        let outcomes = join_all(registrations.into_iter().map(|reg| {
            let request = ExecutionRequest {
                workflow_id: reg.workflow_id,
                trigger: trigger.clone(),
                bypass_quota: false,
            };
            async move {
                let result = self.submit(request).await;
                if let Err(e) = &result {
                    tracing::warn!(
                        workflow_id = %reg.workflow_id,
                        owner = reg.owner.as_str(),
                        error = %e,
                        "triggered execution rejected"
                    );
                }
                IngestOutcome {
                    workflow_id: reg.workflow_id,
                    owner: reg.owner,
                    result,
                }
            }
        }))
        .await;

        tracing::info!(
            provider = event.provider.as_str(),
            event_type = event.event_type.as_str(),
            fired = outcomes.len(),
            accepted = outcomes.iter().filter(|o| o.result.is_ok()).count(),
            "event ingested"
        );
        Ok(outcomes)
    }

    /// Request cooperative cancellation. False if the execution already ended.
    pub fn cancel(&self, execution_id: Uuid) -> Result<bool, StreamError> {
        let cancelled = self.streams.cancel(execution_id)?;
        tracing::info!(%execution_id, cancelled, "cancel requested");
        Ok(cancelled)
    }

    pub async fn get_execution(&self, execution_id: Uuid) -> Result<Option<Execution>, RepositoryError> {
        self.executions.get(&execution_id).await
    }

    /// Run `count` workers against the shared queue until `shutdown` fires.
    ///
    /// Each worker finishes its in-flight execution before exiting.
    pub async fn run_workers(self: Arc<Self>, count: usize, shutdown: CancellationToken) {
        let mut workers = JoinSet::new();
        for worker_id in 0..count.max(1) {
            workers.spawn(Arc::clone(&self).worker_loop(worker_id, shutdown.clone()));
        }
        tracing::info!(workers = count.max(1), "dispatch workers started");

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "dispatch worker exited abnormally");
            }
        }
        tracing::info!("dispatch workers stopped");
    }

    async fn worker_loop(self: Arc<Self>, worker_id: usize, shutdown: CancellationToken) {
        loop {
            let next = {
                let mut rx = self.queue_rx.lock().await;
                tokio::select! {
                    _ = shutdown.cancelled() => None,
                    job = rx.recv() => job,
                }
            };
            let Some(job) = next else {
                break;
            };

            let execution = job.execution.clone();
            let this = Arc::clone(&self);
            let handle = tokio::spawn(async move { this.execute(job).await });

            if let Err(e) = handle.await {
                tracing::error!(
                    worker_id,
                    execution_id = %execution.id,
                    error = %e,
                    "execution task crashed"
                );
                self.recover_crashed(execution, e.to_string()).await;
            }
        }
        tracing::debug!(worker_id, "dispatch worker exiting");
    }

    async fn execute(&self, job: QueuedExecution) {
        let QueuedExecution {
            mut execution,
            workflow,
        } = job;
        let execution_id = execution.id;

        let token = match self.streams.cancellation_token(execution.stream_channel_id()) {
            Ok(token) => token,
            Err(e) => {
                // Channel already dropped; the execution cannot be observed.
                self.finish(&mut execution, Outcome::Failed(e.to_string())).await;
                return;
            }
        };
        if token.is_cancelled() {
            self.finish(&mut execution, Outcome::Cancelled).await;
            return;
        }

        if !self.advance(&mut execution, ExecutionStatus::Running).await {
            self.abandon(&execution).await;
            return;
        }
        self.streams.mark_started(execution.stream_channel_id());
        tracing::info!(%execution_id, runner = self.runner.name(), "execution started");

        let mut chunks = self.runner.run(execution_id, &workflow, token.clone());
        if !self.advance(&mut execution, ExecutionStatus::Streaming).await {
            self.abandon(&execution).await;
            return;
        }

        let outcome = loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break Outcome::Cancelled,
                next = chunks.next() => match next {
                    Some(Ok(chunk)) => match self.streams.publish(execution_id, chunk) {
                        Ok(_) => {}
                        Err(StreamError::ChannelClosed(_)) if token.is_cancelled() => {
                            break Outcome::Cancelled;
                        }
                        Err(e) => break Outcome::Failed(e.to_string()),
                    },
                    Some(Err(e)) => break Outcome::Failed(e.to_string()),
                    None => break Outcome::Completed,
                },
            }
        };

        self.finish(&mut execution, outcome).await;
    }

    /// Persist a non-terminal status change. False when the stored record
    /// was already ended by someone else.
    async fn advance(&self, execution: &mut Execution, next: ExecutionStatus) -> bool {
        if let Err(e) = execution.transition(next) {
            tracing::warn!(execution_id = %execution.id, error = %e, "skipping status change");
            return true;
        }
        match self.executions.update_status(execution).await {
            Ok(()) => true,
            Err(RepositoryError::Conflict(reason)) => {
                tracing::warn!(
                    execution_id = %execution.id,
                    reason = reason.as_str(),
                    "execution ended elsewhere"
                );
                false
            }
            Err(e) => {
                tracing::error!(execution_id = %execution.id, error = %e, "failed to persist status");
                true
            }
        }
    }

    /// Mirror a record that was ended elsewhere onto the stream. Quota was
    /// released by whoever ended it.
    async fn abandon(&self, execution: &Execution) {
        let channel = execution.stream_channel_id();
        let stored = match self.executions.get(&execution.id).await {
            Ok(stored) => stored,
            Err(e) => {
                tracing::warn!(execution_id = %execution.id, error = %e, "failed to reload execution");
                None
            }
        };
        let signalled = match stored {
            Some(stored) if stored.status == ExecutionStatus::Completed => {
                self.streams.complete(channel)
            }
            Some(stored) if stored.status == ExecutionStatus::Cancelled => {
                self.streams.cancel(channel)
            }
            Some(stored) => self
                .streams
                .fail(channel, stored.error.unwrap_or_else(|| ORPHANED_ERROR.to_string())),
            None => self.streams.fail(channel, ORPHANED_ERROR),
        };
        if let Err(e) = signalled {
            tracing::debug!(execution_id = %execution.id, error = %e, "no channel to signal");
        }
    }

    /// Publish the terminal signal, persist the matching terminal status, and
    /// release concurrency quota.
    ///
    /// If the channel already ended (user cancel, idle sweep), the execution
    /// adopts the signal that was delivered so the record never disagrees
    /// with what subscribers saw.
    async fn finish(&self, execution: &mut Execution, outcome: Outcome) {
        let execution_id = execution.id;
        let channel = execution.stream_channel_id();

        let signalled = match &outcome {
            Outcome::Completed => self.streams.complete(channel),
            Outcome::Cancelled => self.streams.cancel(channel),
            Outcome::Failed(error) => self.streams.fail(channel, error.clone()),
        };

        let (status, error) = match (signalled, outcome) {
            (Ok(false), outcome) => match self.streams.terminal(channel) {
                Ok(Some(envelope)) => match envelope.kind {
                    EnvelopeType::Done | EnvelopeType::Data => (ExecutionStatus::Completed, None),
                    EnvelopeType::Cancelled => (ExecutionStatus::Cancelled, None),
                    EnvelopeType::Error => (ExecutionStatus::Failed, envelope.error),
                },
                _ => outcome.into_status(),
            },
            (Err(e), _) => {
                tracing::warn!(%execution_id, error = %e, "stream channel missing at termination");
                (ExecutionStatus::Failed, Some(e.to_string()))
            }
            (Ok(true), outcome) => outcome.into_status(),
        };

        execution.error = error;
        let owned = match execution.transition(status) {
            Ok(()) => match self.executions.update_status(execution).await {
                Ok(()) => true,
                Err(RepositoryError::Conflict(reason)) => {
                    tracing::warn!(
                        %execution_id,
                        reason = reason.as_str(),
                        "execution ended elsewhere; stored outcome kept"
                    );
                    false
                }
                Err(e) => {
                    tracing::error!(%execution_id, error = %e, "failed to persist terminal status");
                    true
                }
            },
            Err(e) => {
                tracing::warn!(%execution_id, error = %e, "execution already terminal");
                true
            }
        };

        // Whoever wrote the terminal record released the gauge.
        if !owned {
            return;
        }
        self.release_quota(execution).await;

        match execution.status {
            ExecutionStatus::Failed => tracing::warn!(
                %execution_id,
                error = execution.error.as_deref().unwrap_or_default(),
                "execution failed"
            ),
            status => tracing::info!(%execution_id, %status, "execution finished"),
        }
    }

    async fn recover_crashed(&self, mut execution: Execution, panic: String) {
        // The task may have advanced the record before crashing.
        if let Ok(Some(stored)) = self.executions.get(&execution.id).await {
            execution = stored;
        }
        if execution.status.is_terminal() {
            return;
        }
        self.finish(&mut execution, Outcome::Failed(format!("execution crashed: {panic}")))
            .await;
    }

    async fn release_quota(&self, execution: &Execution) {
        if execution.quota_bypassed {
            return;
        }
        if let Err(e) = self
            .limiter
            .release(&execution.owner, &execution.tier, 1)
            .await
        {
            tracing::warn!(execution_id = %execution.id, error = %e, "failed to release quota");
        }
    }

    /// Refresh the heartbeat on every unfinished execution this instance owns.
    pub async fn renew_leases(&self) -> Result<u64, RepositoryError> {
        self.executions.renew_leases(&self.instance_id, Utc::now()).await
    }

    /// Fail executions whose owner stopped renewing its lease. Returns how
    /// many were recovered.
    pub async fn recover_orphaned(&self) -> Result<usize, RepositoryError> {
        self.recover_orphaned_at(Utc::now()).await
    }

    /// `recover_orphaned` as seen at `now`.
    ///
    /// Executions claimed by this instance are never recovered here, and a
    /// record that moves on between listing and writing is left alone.
    pub async fn recover_orphaned_at(&self, now: DateTime<Utc>) -> Result<usize, RepositoryError> {
        let lease =
            chrono::Duration::from_std(self.lease).unwrap_or_else(|_| chrono::Duration::days(365));
        let unfinished = self.executions.list_unfinished().await?;
        let mut recovered = 0;

        for mut execution in unfinished {
            if execution.claimed_by == Some(self.instance_id) || !execution.lease_expired(now, lease) {
                continue;
            }
            execution.error = Some(ORPHANED_ERROR.to_string());
            if execution.transition(ExecutionStatus::Failed).is_err() {
                continue;
            }
            match self.executions.update_status(&execution).await {
                Ok(()) => {}
                Err(RepositoryError::Conflict(_) | RepositoryError::NotFound) => continue,
                Err(e) => return Err(e),
            }
            self.release_quota(&execution).await;
            if self.streams.contains(execution.id) {
                let _ = self.streams.fail(execution.id, ORPHANED_ERROR);
            }
            tracing::warn!(
                execution_id = %execution.id,
                claimed_by = ?execution.claimed_by,
                "failed orphaned execution"
            );
            recovered += 1;
        }

        if recovered > 0 {
            tracing::warn!(recovered, "failed executions with expired leases");
        }
        Ok(recovered)
    }

    /// Renew this instance's leases and recover expired ones every `interval`
    /// until `shutdown` fires.
    pub async fn run_lease_keeper(self: Arc<Self>, interval: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.renew_leases().await {
                        tracing::error!(error = %e, "failed to renew execution leases");
                    }
                    if let Err(e) = self.recover_orphaned().await {
                        tracing::error!(error = %e, "orphan recovery failed");
                    }
                }
            }
        }
        tracing::debug!(instance_id = %self.instance_id, "lease keeper stopped");
    }
}

impl Outcome {
    fn into_status(self) -> (ExecutionStatus, Option<String>) {
        match self {
            Outcome::Completed => (ExecutionStatus::Completed, None),
            Outcome::Cancelled => (ExecutionStatus::Cancelled, None),
            Outcome::Failed(error) => (ExecutionStatus::Failed, Some(error)),
        }
    }
}
