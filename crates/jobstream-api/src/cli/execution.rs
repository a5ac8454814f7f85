//! Execution CLI subcommands and in-process event ingestion.
//!
//! `run` and `ingest` start the worker runtime inside the CLI process, follow
//! the resulting stream channels to their terminal event, and shut down.

use std::path::Path;

use anyhow::{Context, Result};
use clap::Subcommand;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use futures_util::StreamExt;
use serde_json::Value;
use uuid::Uuid;

use jobstream_core::dispatch::ExecutionRequest;
use jobstream_core::repository::ExecutionRepository;
use jobstream_types::execution::{Execution, ExecutionStatus};
use jobstream_types::stream::{EnvelopeType, StreamEnvelope};
use jobstream_types::trigger::InboundEvent;

use crate::cli::workflow::short_id;
use crate::state::AppState;

#[derive(Subcommand)]
pub enum ExecutionCommand {
    /// Run a workflow now and follow its output.
    Run {
        /// Workflow ID.
        workflow_id: Uuid,

        /// JSON input passed to the run.
        #[arg(long)]
        input: Option<String>,
    },

    /// Show one execution.
    Status {
        /// Execution ID.
        id: Uuid,
    },

    /// List recent executions of a workflow.
    List {
        /// Workflow ID.
        workflow_id: Uuid,

        /// Maximum number of executions to show.
        #[arg(long, default_value = "20")]
        limit: u32,
    },
}

pub async fn handle_execution_command(
    cmd: ExecutionCommand,
    state: &AppState,
    json: bool,
) -> Result<()> {
    match cmd {
        ExecutionCommand::Run { workflow_id, input } => {
            let input = input
                .map(|raw| serde_json::from_str::<Value>(&raw))
                .transpose()
                .context("--input must be valid JSON")?;
            with_runtime(state, run_workflow(workflow_id, input, state, json)).await
        }
        ExecutionCommand::Status { id } => handle_status(id, state, json).await,
        ExecutionCommand::List { workflow_id, limit } => {
            handle_list(workflow_id, limit, state, json).await
        }
    }
}

/// Ingest one event read from `payload` (or `{}`) and follow every execution it fires.
pub async fn handle_ingest(
    provider: String,
    event_type: String,
    payload: Option<&Path>,
    state: &AppState,
    json: bool,
) -> Result<()> {
    let payload: Value = match payload {
        Some(path) => {
            let raw = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read '{}'", path.display()))?;
            serde_json::from_str(&raw).context("Payload is not valid JSON")?
        }
        None => serde_json::json!({}),
    };
    let event = InboundEvent::new(provider, event_type, payload);

    with_runtime(state, async {
        let outcomes = state.dispatcher.ingest(&event).await?;
        if outcomes.is_empty() && !json {
            println!();
            println!("  No activated workflow matched this event.");
            println!();
        }

        for outcome in outcomes {
            match outcome.result {
                Ok(id) => follow(id, state, json).await?,
                Err(e) => {
                    if json {
                        println!(
                            "{}",
                            serde_json::json!({
                                "workflow_id": outcome.workflow_id,
                                "error": e.to_string(),
                            })
                        );
                    } else {
                        println!(
                            "  {} workflow {} rejected: {e}",
                            style("✗").red(),
                            short_id(&outcome.workflow_id)
                        );
                    }
                }
            }
        }
        Ok::<(), anyhow::Error>(())
    })
    .await
}

/// Start the runtime, run `work`, and always shut the runtime down.
async fn with_runtime(state: &AppState, work: impl Future<Output = Result<()>>) -> Result<()> {
    let report = state.runtime.startup().await?;
    if let Some(report) = report.filter(|r| r.is_degraded()) {
        tracing::warn!(degraded = ?report.degraded, "runtime started degraded");
    }
    let recovered = state.dispatcher.recover_orphaned().await?;
    if recovered > 0 {
        tracing::info!(recovered, "marked orphaned executions as failed");
    }

    let result = work.await;

    if let Some(report) = state.runtime.shutdown().await {
        for failure in &report.failures {
            tracing::warn!(%failure, "shutdown failure");
        }
    }
    result
}

async fn run_workflow(
    workflow_id: Uuid,
    input: Option<Value>,
    state: &AppState,
    json: bool,
) -> Result<()> {
    let id = state
        .dispatcher
        .submit(ExecutionRequest::manual(workflow_id, input))
        .await?;
    follow(id, state, json).await?;

    let execution = wait_for_record(id, state).await?;
    if execution.status == ExecutionStatus::Failed {
        anyhow::bail!(
            "execution {id} failed: {}",
            execution.error.unwrap_or_default()
        );
    }
    Ok(())
}

/// Print every envelope of an execution's channel until it ends.
async fn follow(id: Uuid, state: &AppState, json: bool) -> Result<()> {
    let mut envelopes = state.dispatcher.streams().subscribe(id)?;
    if !json {
        println!();
        println!("  {} execution {}", style("▶").cyan(), style(id).dim());
    }

    while let Some(envelope) = envelopes.next().await {
        if json {
            println!("{}", serde_json::to_string(&envelope)?);
        } else {
            print_envelope(&envelope);
        }
    }
    Ok(())
}

fn print_envelope(envelope: &StreamEnvelope) {
    match envelope.kind {
        EnvelopeType::Data => {
            println!("  {}", envelope.body.as_deref().unwrap_or_default());
        }
        EnvelopeType::Done => println!("  {} done", style("✓").green()),
        EnvelopeType::Cancelled => println!("  {} cancelled", style("■").yellow()),
        EnvelopeType::Error => println!(
            "  {} {}",
            style("✗").red(),
            envelope.error.as_deref().unwrap_or("failed")
        ),
    }
}

/// The record is written after the terminal signal, so poll briefly.
async fn wait_for_record(id: Uuid, state: &AppState) -> Result<Execution> {
    for _ in 0..100 {
        if let Some(execution) = state.dispatcher.get_execution(id).await? {
            if execution.status.is_terminal() {
                return Ok(execution);
            }
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    state
        .dispatcher
        .get_execution(id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("Execution '{id}' not found"))
}

// ---------------------------------------------------------------------------
// Status / List
// ---------------------------------------------------------------------------

async fn handle_status(id: Uuid, state: &AppState, json: bool) -> Result<()> {
    let execution = state
        .dispatcher
        .get_execution(id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("Execution '{id}' not found"))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&execution)?);
        return Ok(());
    }

    println!();
    println!("  {} {}", style("Execution:").bold(), style(execution.id).cyan());
    println!("  Workflow: {}", execution.workflow_id);
    println!("  Owner: {} (tier {})", execution.owner, execution.tier);
    println!("  Status: {}", execution.status);
    println!("  Trigger: {}", execution.trigger.kind());
    println!("  Started: {}", execution.started_at.format("%Y-%m-%d %H:%M:%S"));
    if let Some(completed) = execution.completed_at {
        println!("  Completed: {}", completed.format("%Y-%m-%d %H:%M:%S"));
    }
    if let Some(ref err) = execution.error {
        println!("  Error: {}", style(err).red());
    }
    println!();

    Ok(())
}

async fn handle_list(workflow_id: Uuid, limit: u32, state: &AppState, json: bool) -> Result<()> {
    let executions = state
        .dispatcher
        .executions()
        .list_for_workflow(&workflow_id, limit)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to list executions: {e}"))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&executions)?);
        return Ok(());
    }

    if executions.is_empty() {
        println!();
        println!("  No executions for workflow '{workflow_id}'.");
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Execution").fg(Color::Cyan),
            Cell::new("Status"),
            Cell::new("Trigger"),
            Cell::new("Started"),
            Cell::new("Completed"),
        ]);

    for e in &executions {
        let completed = e
            .completed_at
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "-".to_string());

        table.add_row(vec![
            Cell::new(short_id(&e.id)),
            status_cell(e.status),
            Cell::new(e.trigger.kind()),
            Cell::new(e.started_at.format("%Y-%m-%d %H:%M").to_string()),
            Cell::new(completed),
        ]);
    }

    println!();
    println!("{table}");
    println!();

    Ok(())
}

fn status_cell(status: ExecutionStatus) -> Cell {
    let color = match status {
        ExecutionStatus::Completed => Color::Green,
        ExecutionStatus::Failed => Color::Red,
        ExecutionStatus::Cancelled => Color::Yellow,
        ExecutionStatus::Pending | ExecutionStatus::Running | ExecutionStatus::Streaming => {
            Color::Cyan
        }
    };
    Cell::new(status.as_str()).fg(color)
}
