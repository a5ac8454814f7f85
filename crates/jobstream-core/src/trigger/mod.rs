//! Trigger resolution: mapping inbound provider events to workflow executions.
//!
//! - `handler` -- the `TriggerHandler` trait and the config-driven `EventFilterHandler`
//! - `registry` -- the boot-time `TriggerRegistry` and `resolve`

pub mod handler;
pub mod registry;

pub use handler::{EventFilterHandler, HandlerConstructor, TriggerHandler};
pub use registry::{DuplicateHandlerError, TriggerError, TriggerRegistry};
