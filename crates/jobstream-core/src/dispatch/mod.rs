//! Execution dispatch.
//!
//! - `runner` -- the `AgentRunner` contract
//! - `dispatcher` -- `JobDispatcher` submit, ingest, cancel, and workers

pub mod dispatcher;
pub mod runner;

pub use dispatcher::{
    DEFAULT_LEASE, ExecutionRequest, IngestOutcome, JobDispatcher, ORPHANED_ERROR, SubmitError,
};
pub use runner::{AgentRunner, ChunkStream, RunnerError};
