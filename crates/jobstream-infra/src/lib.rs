//! Infrastructure layer for jobstream.
//!
//! Contains implementations of the ports defined in `jobstream-core`:
//! SQLite storage for workflows, executions and usage counters, the
//! `config.toml` loader, lifecycle providers, and the built-in step-echo
//! agent runner.

pub mod config;
pub mod lifecycle;
pub mod runner;
pub mod sqlite;
