//! Shared-resource providers managed by the worker runtime.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Failure reported by a provider's `start` or `stop`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct ProviderError(pub String);

impl ProviderError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Boxed future returned by provider hooks, keeping the trait object-safe.
pub type ProviderFuture<'a> = Pin<Box<dyn Future<Output = Result<(), ProviderError>> + Send + 'a>>;

/// A process-wide resource with explicit start and stop hooks.
pub trait ResourceProvider: Send + Sync {
    fn name(&self) -> &str;

    fn start(&self) -> ProviderFuture<'_>;

    fn stop(&self) -> ProviderFuture<'_>;
}

/// A provider plus whether startup may continue without it.
#[derive(Clone)]
pub struct ProviderSpec {
    pub provider: Arc<dyn ResourceProvider>,
    pub required: bool,
}

impl ProviderSpec {
    pub fn required(provider: Arc<dyn ResourceProvider>) -> Self {
        Self {
            provider,
            required: true,
        }
    }

    pub fn optional(provider: Arc<dyn ResourceProvider>) -> Self {
        Self {
            provider,
            required: false,
        }
    }
}

impl std::fmt::Debug for ProviderSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderSpec")
            .field("name", &self.provider.name())
            .field("required", &self.required)
            .finish()
    }
}

type TaskFactory =
    Arc<dyn Fn(CancellationToken) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Provider wrapping a long-running background task.
///
/// `start` spawns the task with a fresh shutdown token; `stop` cancels the
/// token and waits up to `stop_timeout` for the task to finish.
pub struct BackgroundTask {
    name: String,
    factory: TaskFactory,
    stop_timeout: Duration,
    running: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl BackgroundTask {
    pub fn new<F, Fut>(name: impl Into<String>, factory: F) -> Self
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            name: name.into(),
            factory: Arc::new(move |token| Box::pin(factory(token))),
            stop_timeout: Duration::from_secs(30),
            running: Mutex::new(None),
        }
    }

    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }
}

impl ResourceProvider for BackgroundTask {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&self) -> ProviderFuture<'_> {
        Box::pin(async move {
            let mut running = self.running.lock().expect("background task lock poisoned");
            if running.is_some() {
                return Err(ProviderError::new(format!("{} already running", self.name)));
            }
            let token = CancellationToken::new();
            let handle = tokio::spawn((self.factory)(token.clone()));
            *running = Some((token, handle));
            Ok(())
        })
    }

    fn stop(&self) -> ProviderFuture<'_> {
        Box::pin(async move {
            let taken = self
                .running
                .lock()
                .expect("background task lock poisoned")
                .take();
            let Some((token, handle)) = taken else {
                return Ok(());
            };

            token.cancel();
            match tokio::time::timeout(self.stop_timeout, handle).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(ProviderError::new(format!("{} task failed: {e}", self.name))),
                Err(_) => Err(ProviderError::new(format!(
                    "{} did not stop within {}s",
                    self.name,
                    self.stop_timeout.as_secs()
                ))),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn background_task_runs_until_stopped() {
        let stopped = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stopped);
        let task = BackgroundTask::new("ticker", move |token: CancellationToken| {
            let flag = Arc::clone(&flag);
            async move {
                token.cancelled().await;
                flag.store(true, Ordering::SeqCst);
            }
        });

        task.start().await.unwrap();
        assert!(task.start().await.is_err());
        task.stop().await.unwrap();
        assert!(stopped.load(Ordering::SeqCst));

        // Stopping again is harmless.
        task.stop().await.unwrap();
    }

    #[tokio::test]
    async fn background_task_reports_stop_timeout() {
        let task = BackgroundTask::new("stubborn", |_token: CancellationToken| async {
            std::future::pending::<()>().await;
        })
        .with_stop_timeout(Duration::from_millis(20));

        task.start().await.unwrap();
        let err = task.stop().await.unwrap_err();
        assert!(err.to_string().contains("did not stop"));
    }
}
