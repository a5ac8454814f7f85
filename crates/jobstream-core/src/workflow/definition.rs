//! Workflow definition files: YAML parsing and filesystem operations.
//!
//! Definitions are parsed into the canonical `Workflow` type. Structural
//! problems (unparseable YAML, missing title or owner) are rejected here;
//! execution preconditions are left to `validator`, so a draft workflow can
//! be imported before it is runnable.

use std::path::{Path, PathBuf};

use jobstream_types::workflow::Workflow;
use thiserror::Error;

/// Errors from loading or saving workflow definitions.
#[derive(Debug, Error)]
pub enum DefinitionError {
    #[error("parse error: {0}")]
    ParseError(String),

    #[error("invalid definition: {0}")]
    Invalid(String),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Parse a YAML string into a `Workflow`.
pub fn parse_workflow_yaml(yaml: &str) -> Result<Workflow, DefinitionError> {
    let workflow: Workflow =
        serde_yaml_ng::from_str(yaml).map_err(|e| DefinitionError::ParseError(e.to_string()))?;
    check_structure(&workflow)?;
    Ok(workflow)
}

pub fn serialize_workflow_yaml(workflow: &Workflow) -> Result<String, DefinitionError> {
    serde_yaml_ng::to_string(workflow).map_err(|e| DefinitionError::ParseError(e.to_string()))
}

fn check_structure(workflow: &Workflow) -> Result<(), DefinitionError> {
    if workflow.title.trim().is_empty() {
        return Err(DefinitionError::Invalid("title must not be empty".to_string()));
    }
    if workflow.owner.trim().is_empty() {
        return Err(DefinitionError::Invalid("owner must not be empty".to_string()));
    }
    if let Some(trigger) = &workflow.trigger {
        if trigger.provider.is_empty() || trigger.event_type.is_empty() {
            return Err(DefinitionError::Invalid(
                "trigger needs both provider and event_type".to_string(),
            ));
        }
    }
    Ok(())
}

pub fn load_workflow_file(path: &Path) -> Result<Workflow, DefinitionError> {
    let content = std::fs::read_to_string(path)?;
    parse_workflow_yaml(&content)
}

/// Save a workflow to a YAML file, creating parent directories.
pub fn save_workflow_file(path: &Path, workflow: &Workflow) -> Result<(), DefinitionError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serialize_workflow_yaml(workflow)?)?;
    Ok(())
}

/// Every `.yaml`/`.yml` workflow under `base_dir`, recursively.
///
/// Files that fail to parse are logged and skipped.
pub fn discover_workflows(base_dir: &Path) -> Result<Vec<(PathBuf, Workflow)>, DefinitionError> {
    let mut results = Vec::new();
    if !base_dir.exists() {
        return Ok(results);
    }
    discover_recursive(base_dir, &mut results)?;
    results.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(results)
}

fn discover_recursive(
    dir: &Path,
    results: &mut Vec<(PathBuf, Workflow)>,
) -> Result<(), DefinitionError> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            discover_recursive(&path, results)?;
        } else if path
            .extension()
            .is_some_and(|ext| ext == "yaml" || ext == "yml")
        {
            match load_workflow_file(&path) {
                Ok(workflow) => results.push((path, workflow)),
                Err(e) => tracing::warn!(?path, error = %e, "skipping unparseable workflow file"),
            }
        }
    }
    Ok(())
}
