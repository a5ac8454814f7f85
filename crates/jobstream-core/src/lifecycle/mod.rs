//! Worker process lifecycle.
//!
//! - `provider` -- the `ResourceProvider` trait and `BackgroundTask`
//! - `runtime` -- `WorkerRuntime` ordered startup and reverse shutdown

pub mod provider;
pub mod runtime;

pub use provider::{BackgroundTask, ProviderError, ProviderFuture, ProviderSpec, ResourceProvider};
pub use runtime::{
    ProviderInitError, ShutdownPartialFailure, ShutdownReport, StartupReport, WorkerRuntime,
};
