//! HTTP request handlers for the REST API.

pub mod event;
pub mod execution;
pub mod system;
pub mod workflow;
