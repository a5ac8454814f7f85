//! Built-in agent runner that echoes each workflow step as one output chunk.
//!
//! Stands in for a model-backed runner so the dispatcher, streaming, and
//! cancellation paths can be exercised end to end.

use std::time::Duration;

use jobstream_core::dispatch::{AgentRunner, ChunkStream, RunnerError};
use jobstream_types::workflow::Workflow;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Emits `"[{step_id}] {name}: {instruction}"` per step, pausing `step_delay`
/// between steps and stopping as soon as the token is cancelled.
#[derive(Debug, Clone, Default)]
pub struct StepEchoRunner {
    step_delay: Duration,
}

impl StepEchoRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_step_delay(mut self, delay: Duration) -> Self {
        self.step_delay = delay;
        self
    }
}

impl AgentRunner for StepEchoRunner {
    fn name(&self) -> &str {
        "step-echo"
    }

    fn run(&self, execution_id: Uuid, workflow: &Workflow, cancel: CancellationToken) -> ChunkStream {
        let steps = workflow.steps.clone();
        let delay = self.step_delay;

        Box::pin(async_stream::try_stream! {
            for (index, step) in steps.into_iter().enumerate() {
                if index > 0 && !delay.is_zero() {
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                if cancel.is_cancelled() {
                    tracing::debug!(%execution_id, step = %step.id, "runner stopping on cancellation");
                    break;
                }
                if step.instruction.trim().is_empty() {
                    Err(RunnerError::Step {
                        step: step.id.clone(),
                        message: "empty instruction".to_string(),
                    })?;
                }
                yield format!("[{}] {}: {}", step.id, step.name, step.instruction);
            }
        })
    }
}
