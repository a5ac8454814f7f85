//! Agent runner contract.
//!
//! A runner turns one workflow execution into a lazy sequence of output
//! chunks. Cancellation is cooperative: the runner must check the token it is
//! given between chunks.

use std::pin::Pin;

use futures_util::Stream;
use jobstream_types::workflow::Workflow;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Errors raised by an agent runner mid-execution.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RunnerError {
    #[error("step '{step}' failed: {message}")]
    Step { step: String, message: String },

    #[error("runner failed: {0}")]
    Failed(String),
}

/// Output chunks of one execution.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<String, RunnerError>> + Send + 'static>>;

/// Executes workflows on behalf of the dispatcher.
pub trait AgentRunner: Send + Sync {
    fn name(&self) -> &str;

    /// Start `workflow` and return its output stream.
    ///
    /// The workflow is cloned into the stream as needed; the stream must not
    /// borrow from the runner or the arguments.
    fn run(&self, execution_id: Uuid, workflow: &Workflow, cancel: CancellationToken) -> ChunkStream;
}
