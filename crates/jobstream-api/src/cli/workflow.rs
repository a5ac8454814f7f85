//! Workflow CLI subcommands: import, list, show, activate, deactivate, export.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Subcommand;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use uuid::Uuid;

use jobstream_core::repository::WorkflowStore;
use jobstream_core::workflow::definition::{
    discover_workflows, load_workflow_file, save_workflow_file,
};
use jobstream_core::workflow::validate_for_execution;
use jobstream_types::workflow::Workflow;

use crate::state::AppState;

#[derive(Subcommand)]
pub enum WorkflowCommand {
    /// Import workflow YAML files (a single file or a directory tree).
    Import {
        /// File or directory to import. Defaults to `{data_dir}/workflows`.
        path: Option<PathBuf>,
    },

    /// List stored workflows.
    List {
        /// Only show workflows owned by this identity.
        #[arg(long)]
        owner: Option<String>,
    },

    /// Show one workflow with its steps and run readiness.
    Show {
        /// Workflow ID.
        id: Uuid,
    },

    /// Allow a workflow to run.
    Activate {
        id: Uuid,
    },

    /// Stop a workflow from being triggered. It is kept, not deleted.
    Deactivate {
        id: Uuid,
    },

    /// Write a workflow back out as YAML.
    Export {
        id: Uuid,

        /// Destination file. Prints to stdout when omitted.
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

/// Handle a workflow subcommand.
pub async fn handle_workflow_command(
    cmd: WorkflowCommand,
    state: &AppState,
    json: bool,
) -> Result<()> {
    match cmd {
        WorkflowCommand::Import { path } => {
            let path = path.unwrap_or_else(|| state.data_dir.join("workflows"));
            handle_import(&path, state, json).await
        }
        WorkflowCommand::List { owner } => handle_list(owner.as_deref(), state, json).await,
        WorkflowCommand::Show { id } => handle_show(id, state, json).await,
        WorkflowCommand::Activate { id } => set_activated(id, true, state, json).await,
        WorkflowCommand::Deactivate { id } => set_activated(id, false, state, json).await,
        WorkflowCommand::Export { id, out } => handle_export(id, out.as_deref(), state).await,
    }
}

async fn fetch(id: Uuid, state: &AppState) -> Result<Workflow> {
    state
        .dispatcher
        .workflows()
        .get(&id)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to get workflow: {e}"))?
        .ok_or_else(|| anyhow::anyhow!("Workflow '{id}' not found"))
}

// ---------------------------------------------------------------------------
// Import
// ---------------------------------------------------------------------------

async fn handle_import(path: &Path, state: &AppState, json: bool) -> Result<()> {
    let workflows: Vec<(PathBuf, Workflow)> = if path.is_dir() {
        discover_workflows(path).context("Failed to scan workflow directory")?
    } else {
        let wf = load_workflow_file(path)
            .with_context(|| format!("Failed to load '{}'", path.display()))?;
        vec![(path.to_path_buf(), wf)]
    };

    for (_, wf) in &workflows {
        state
            .dispatcher
            .workflows()
            .save(wf)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to save workflow '{}': {e}", wf.title))?;
    }

    if json {
        let out: Vec<_> = workflows
            .iter()
            .map(|(file, wf)| {
                serde_json::json!({
                    "id": wf.id,
                    "title": wf.title,
                    "owner": wf.owner,
                    "file": file.display().to_string(),
                    "runnable": validate_for_execution(wf).is_ok(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    if workflows.is_empty() {
        println!("  No workflow files found under '{}'.", path.display());
    }
    for (file, wf) in &workflows {
        let marker = if validate_for_execution(wf).is_ok() {
            style("✓").green()
        } else {
            style("○").yellow()
        };
        println!(
            "  {marker} {} ({}) from {}",
            style(&wf.title).cyan(),
            wf.id,
            style(file.display()).dim()
        );
    }
    println!();

    Ok(())
}

// ---------------------------------------------------------------------------
// List
// ---------------------------------------------------------------------------

async fn handle_list(owner: Option<&str>, state: &AppState, json: bool) -> Result<()> {
    let workflows = state
        .dispatcher
        .workflows()
        .list(owner)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to list workflows: {e}"))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&workflows)?);
        return Ok(());
    }

    if workflows.is_empty() {
        println!();
        println!("  No workflows found. Import one with `jobstream workflow import <path>`.");
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("ID").fg(Color::Cyan),
            Cell::new("Title"),
            Cell::new("Owner"),
            Cell::new("Steps"),
            Cell::new("Trigger"),
            Cell::new("Active"),
        ]);

    for wf in &workflows {
        let trigger = wf
            .trigger
            .as_ref()
            .map(|t| format!("{}:{}", t.provider, t.event_type))
            .unwrap_or_else(|| "-".to_string());
        let active = if wf.activated {
            Cell::new("yes").fg(Color::Green)
        } else {
            Cell::new("no").fg(Color::DarkGrey)
        };

        table.add_row(vec![
            Cell::new(short_id(&wf.id)),
            Cell::new(&wf.title),
            Cell::new(&wf.owner),
            Cell::new(wf.steps.len()),
            Cell::new(trigger),
            active,
        ]);
    }

    println!();
    println!("{table}");
    println!();

    Ok(())
}

// ---------------------------------------------------------------------------
// Show
// ---------------------------------------------------------------------------

async fn handle_show(id: Uuid, state: &AppState, json: bool) -> Result<()> {
    let wf = fetch(id, state).await?;
    let readiness = validate_for_execution(&wf);

    if json {
        let mut out = serde_json::to_value(&wf)?;
        out["violations"] = match &readiness {
            Ok(()) => serde_json::json!([]),
            Err(e) => serde_json::json!(
                e.violations.iter().map(|v| v.code()).collect::<Vec<_>>()
            ),
        };
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!("  {} {}", style("Workflow:").bold(), style(&wf.title).cyan());
    println!("  ID: {}", wf.id);
    println!("  Owner: {}", wf.owner);
    println!("  Active: {}", if wf.activated { "yes" } else { "no" });
    match &wf.trigger {
        Some(t) => {
            println!("  Trigger: {}:{}", t.provider, t.event_type);
            for (pointer, expected) in &t.filter.0 {
                println!("    {pointer} == {expected}");
            }
        }
        None => println!("  Trigger: {}", style("none").yellow()),
    }
    println!("  Updated: {}", wf.updated_at.format("%Y-%m-%d %H:%M:%S"));
    println!();

    for (i, step) in wf.steps.iter().enumerate() {
        println!(
            "  {}. {} {}",
            i + 1,
            style(&step.name).bold(),
            style(format!("[{}]", step.id)).dim()
        );
        println!("     {}", step.instruction);
    }

    if let Err(e) = readiness {
        println!();
        println!("  {}", style("Not runnable:").yellow());
        for v in &e.violations {
            println!("    - {v}");
        }
    }
    println!();

    Ok(())
}

// ---------------------------------------------------------------------------
// Activate / Deactivate
// ---------------------------------------------------------------------------

async fn set_activated(id: Uuid, activated: bool, state: &AppState, json: bool) -> Result<()> {
    let mut wf = fetch(id, state).await?;
    wf.activated = activated;
    wf.updated_at = chrono::Utc::now();
    state
        .dispatcher
        .workflows()
        .save(&wf)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to save workflow: {e}"))?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "id": wf.id,
                "activated": wf.activated,
            }))?
        );
    } else {
        let verb = if activated { "activated" } else { "deactivated" };
        println!();
        println!("  {} Workflow '{}' {verb}.", style("✓").green(), style(&wf.title).cyan());
        println!();
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Export
// ---------------------------------------------------------------------------

async fn handle_export(id: Uuid, out: Option<&Path>, state: &AppState) -> Result<()> {
    let wf = fetch(id, state).await?;
    match out {
        Some(path) => {
            save_workflow_file(path, &wf)
                .with_context(|| format!("Failed to write '{}'", path.display()))?;
            println!("  Wrote {}", path.display());
        }
        None => {
            let yaml = jobstream_core::workflow::definition::serialize_workflow_yaml(&wf)?;
            print!("{yaml}");
        }
    }
    Ok(())
}

pub(crate) fn short_id(id: &Uuid) -> String {
    id.to_string().chars().take(8).collect()
}
