//! Observability setup for jobstream: structured logging and optional
//! OpenTelemetry trace export.

pub mod tracing_setup;

pub use tracing_setup::{TracingOptions, directive_for_verbosity, init_tracing, shutdown_tracing};
