//! Shared domain types for jobstream.
//!
//! Workflows, executions, trigger events, stream envelopes, quota types,
//! configuration, and the error types that cross crate boundaries.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod error;
pub mod execution;
pub mod stream;
pub mod trigger;
pub mod usage;
pub mod workflow;
