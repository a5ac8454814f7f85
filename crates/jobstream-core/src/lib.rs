//! Business logic and port definitions for jobstream.
//!
//! This crate defines the "ports" (store traits) that the infrastructure
//! layer implements, plus the dispatch pipeline built on them. It depends
//! only on `jobstream-types` -- never on `jobstream-infra` or any database/IO
//! crate.

pub mod dispatch;
pub mod lifecycle;
pub mod ratelimit;
pub mod repository;
pub mod stream;
pub mod trigger;
pub mod workflow;
