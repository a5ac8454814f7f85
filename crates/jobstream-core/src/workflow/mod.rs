//! Workflow definitions and execution preconditions.
//!
//! - `definition` -- YAML parsing and filesystem load/save/discovery
//! - `validator` -- accumulating checks run before an execution is admitted

pub mod definition;
pub mod validator;

pub use definition::{DefinitionError, parse_workflow_yaml};
pub use validator::validate_for_execution;
