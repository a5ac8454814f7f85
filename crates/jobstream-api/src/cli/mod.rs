//! CLI command definitions for the `jobstream` binary.
//!
//! Uses clap derive macros for argument parsing.

pub mod execution;
pub mod workflow;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Event-triggered workflow execution with live output streaming.
#[derive(Parser)]
#[command(name = "jobstream", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Detailed output (-v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Export tracing spans through OpenTelemetry (stdout exporter).
    #[arg(long, global = true, env = "JOBSTREAM_OTEL")]
    pub otel: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the worker runtime and the REST API server.
    Serve {
        /// Port to listen on.
        #[arg(short, long, default_value = "3000")]
        port: u16,

        /// Host to bind to.
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
    },

    /// Manage workflow definitions.
    Workflow {
        #[command(subcommand)]
        action: workflow::WorkflowCommand,
    },

    /// Run, inspect, and list executions.
    Execution {
        #[command(subcommand)]
        action: execution::ExecutionCommand,
    },

    /// Ingest an event from a JSON payload file and follow what it fires.
    Ingest {
        /// Integration provider (e.g. "github").
        provider: String,

        /// Provider event type (e.g. "push").
        event_type: String,

        /// Path to the JSON payload; omit for an empty object.
        #[arg(long)]
        payload: Option<PathBuf>,
    },
}
