//! Ordered startup and reverse-order shutdown of shared providers.
//!
//! A `WorkerRuntime` is built once per process and passed explicitly to
//! whatever needs it. Both `startup` and `shutdown` take effect at most once;
//! later calls return `None`.

use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use super::provider::{ProviderError, ProviderSpec};

/// A required provider failed to start.
#[derive(Debug, thiserror::Error)]
#[error("required provider '{provider}' failed to start: {source}")]
pub struct ProviderInitError {
    pub provider: String,
    #[source]
    pub source: ProviderError,
}

/// One provider that failed to stop cleanly.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("provider '{provider}' failed to stop: {error}")]
pub struct ShutdownPartialFailure {
    pub provider: String,
    pub error: String,
}

/// Outcome of a successful startup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartupReport {
    /// Providers started, in start order.
    pub started: Vec<String>,
    /// Optional providers that failed and were skipped.
    pub degraded: Vec<String>,
}

impl StartupReport {
    pub fn is_degraded(&self) -> bool {
        !self.degraded.is_empty()
    }
}

/// Outcome of shutdown. Failures are reported here and never propagated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    pub runtime: Duration,
    pub failures: Vec<ShutdownPartialFailure>,
}

enum Phase {
    Created,
    Running {
        started_at: Instant,
        /// Indexes into `providers`, in start order.
        started: Vec<usize>,
    },
    Stopped,
}

/// Process-wide provider lifecycle.
pub struct WorkerRuntime {
    providers: Vec<ProviderSpec>,
    phase: Mutex<Phase>,
}

impl WorkerRuntime {
    pub fn new(providers: Vec<ProviderSpec>) -> Self {
        Self {
            providers,
            phase: Mutex::new(Phase::Created),
        }
    }

    /// Start every provider in declared order.
    ///
    /// Returns `Ok(None)` if startup already ran.
    pub async fn startup(&self) -> Result<Option<StartupReport>, ProviderInitError> {
        let mut phase = self.phase.lock().await;
        if !matches!(*phase, Phase::Created) {
            tracing::debug!("worker runtime startup called more than once, ignoring");
            return Ok(None);
        }

        let started_at = Instant::now();
        let mut started = Vec::with_capacity(self.providers.len());
        let mut report = StartupReport::default();

        for (index, spec) in self.providers.iter().enumerate() {
            let name = spec.provider.name();
            match spec.provider.start().await {
                Ok(()) => {
                    tracing::info!(provider = name, "provider started");
                    started.push(index);
                    report.started.push(name.to_string());
                }
                Err(e) if spec.required => {
                    tracing::error!(provider = name, error = %e, "required provider failed to start");
                    for failure in self.stop_in_reverse(&started).await {
                        tracing::warn!(
                            provider = failure.provider.as_str(),
                            error = failure.error.as_str(),
                            "release after failed startup"
                        );
                    }
                    *phase = Phase::Stopped;
                    return Err(ProviderInitError {
                        provider: name.to_string(),
                        source: e,
                    });
                }
                Err(e) => {
                    tracing::warn!(
                        provider = name,
                        error = %e,
                        "optional provider failed to start, continuing degraded"
                    );
                    report.degraded.push(name.to_string());
                }
            }
        }

        *phase = Phase::Running { started_at, started };
        tracing::info!(
            started = report.started.len(),
            degraded = report.degraded.len(),
            "worker runtime started"
        );
        Ok(Some(report))
    }

    /// Stop started providers in reverse order, continuing past failures.
    ///
    /// Returns `None` if the runtime never started or already shut down.
    pub async fn shutdown(&self) -> Option<ShutdownReport> {
        let mut phase = self.phase.lock().await;
        let previous = std::mem::replace(&mut *phase, Phase::Stopped);
        let Phase::Running { started_at, started } = previous else {
            tracing::debug!("worker runtime not running, shutdown ignored");
            return None;
        };

        let failures = self.stop_in_reverse(&started).await;
        for failure in &failures {
            tracing::warn!(
                provider = failure.provider.as_str(),
                error = failure.error.as_str(),
                "provider failed to stop"
            );
        }

        let runtime = started_at.elapsed();
        tracing::info!(
            runtime_secs = runtime.as_secs(),
            failures = failures.len(),
            "worker runtime stopped"
        );
        Some(ShutdownReport { runtime, failures })
    }

    pub async fn is_running(&self) -> bool {
        matches!(*self.phase.lock().await, Phase::Running { .. })
    }

    /// Time since a successful startup, if running.
    pub async fn uptime(&self) -> Option<Duration> {
        match &*self.phase.lock().await {
            Phase::Running { started_at, .. } => Some(started_at.elapsed()),
            _ => None,
        }
    }

    async fn stop_in_reverse(&self, started: &[usize]) -> Vec<ShutdownPartialFailure> {
        let mut failures = Vec::new();
        for &index in started.iter().rev() {
            let provider = &self.providers[index].provider;
            match provider.stop().await {
                Ok(()) => tracing::info!(provider = provider.name(), "provider stopped"),
                Err(e) => failures.push(ShutdownPartialFailure {
                    provider: provider.name().to_string(),
                    error: e.to_string(),
                }),
            }
        }
        failures
    }
}

impl std::fmt::Debug for WorkerRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerRuntime")
            .field("providers", &self.providers)
            .finish()
    }
}
