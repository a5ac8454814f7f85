//! Repository trait definitions (ports).
//!
//! These traits define the storage interface that the infrastructure layer
//! (jobstream-infra) implements. The core crate never depends on any
//! specific storage technology. `memory` provides DashMap-backed
//! implementations for embedding and tests.

pub mod execution;
pub mod memory;
pub mod workflow;

pub use execution::ExecutionRepository;
pub use memory::{InMemoryExecutionRepository, InMemoryWorkflowStore};
pub use workflow::WorkflowStore;
