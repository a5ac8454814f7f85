//! Tiered quota enforcement.
//!
//! - `store` -- the `CounterStore` port and `InMemoryCounterStore`
//! - `limiter` -- `TieredRateLimiter` admission and release

pub mod limiter;
pub mod store;

pub use limiter::{AdmissionError, CONCURRENCY_RETRY_AFTER, TieredRateLimiter};
pub use store::{CounterStore, InMemoryCounterStore, IncrementOutcome};
