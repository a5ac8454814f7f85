//! Execution preconditions for workflows.
//!
//! Every rule runs; violations accumulate so the owner can fix all of them
//! after a single response.

use std::collections::HashSet;

use jobstream_types::error::{ValidationError, Violation};
use jobstream_types::workflow::Workflow;

type Rule = fn(&Workflow, &mut Vec<Violation>);

/// Ordered rule table. New preconditions are added here.
const RULES: &[Rule] = &[
    check_activated,
    check_has_steps,
    check_trigger_configured,
    check_unique_step_ids,
    check_instructions_present,
];

/// Check whether `workflow` may enter the running state.
pub fn validate_for_execution(workflow: &Workflow) -> Result<(), ValidationError> {
    let mut violations = Vec::new();
    for rule in RULES {
        rule(workflow, &mut violations);
    }

    if violations.is_empty() {
        Ok(())
    } else {
        Err(ValidationError {
            workflow_id: workflow.id,
            violations,
        })
    }
}

fn check_activated(workflow: &Workflow, out: &mut Vec<Violation>) {
    if !workflow.activated {
        out.push(Violation::NotActivated);
    }
}

fn check_has_steps(workflow: &Workflow, out: &mut Vec<Violation>) {
    if workflow.steps.is_empty() {
        out.push(Violation::NoSteps);
    }
}

fn check_trigger_configured(workflow: &Workflow, out: &mut Vec<Violation>) {
    if workflow.trigger.is_none() {
        out.push(Violation::MissingTrigger);
    }
}

fn check_unique_step_ids(workflow: &Workflow, out: &mut Vec<Violation>) {
    let mut seen = HashSet::new();
    let mut reported = HashSet::new();
    for step in &workflow.steps {
        if !seen.insert(step.id.as_str()) && reported.insert(step.id.as_str()) {
            out.push(Violation::DuplicateStepId(step.id.clone()));
        }
    }
}

fn check_instructions_present(workflow: &Workflow, out: &mut Vec<Violation>) {
    for step in &workflow.steps {
        if step.instruction.trim().is_empty() {
            out.push(Violation::BlankInstruction(step.id.clone()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobstream_types::trigger::EventFilter;
    use jobstream_types::workflow::{StepSpec, TriggerConfig};

    fn step(id: &str, instruction: &str) -> StepSpec {
        StepSpec {
            id: id.to_string(),
            name: id.to_string(),
            instruction: instruction.to_string(),
        }
    }

    fn runnable() -> Workflow {
        let mut wf = Workflow::new("Triage", "acme");
        wf.activated = true;
        wf.steps = vec![step("read", "Read the issue"), step("label", "Apply labels")];
        wf.trigger = Some(TriggerConfig {
            provider: "github".into(),
            event_type: "issues".into(),
            filter: EventFilter::new(),
        });
        wf
    }

    #[test]
    fn runnable_workflow_passes() {
        assert!(validate_for_execution(&runnable()).is_ok());
    }

    #[test]
    fn inactive_and_empty_reports_both() {
        let mut wf = runnable();
        wf.activated = false;
        wf.steps.clear();

        let err = validate_for_execution(&wf).unwrap_err();
        assert_eq!(err.workflow_id, wf.id);
        assert!(err.violations.contains(&Violation::NotActivated));
        assert!(err.violations.contains(&Violation::NoSteps));
        assert_eq!(err.violations.len(), 2);
    }

    #[test]
    fn fresh_workflow_reports_all_three_core_violations() {
        let wf = Workflow::new("Empty", "acme");
        let err = validate_for_execution(&wf).unwrap_err();
        assert_eq!(
            err.violations,
            vec![Violation::NotActivated, Violation::NoSteps, Violation::MissingTrigger]
        );
    }

    #[test]
    fn duplicate_step_ids_reported_once_each() {
        let mut wf = runnable();
        wf.steps = vec![step("a", "x"), step("a", "y"), step("a", "z"), step("b", "w")];
        let err = validate_for_execution(&wf).unwrap_err();
        assert_eq!(err.violations, vec![Violation::DuplicateStepId("a".into())]);
    }

    #[test]
    fn blank_instruction_reported() {
        let mut wf = runnable();
        wf.steps.push(step("empty", "   "));
        let err = validate_for_execution(&wf).unwrap_err();
        assert_eq!(err.violations, vec![Violation::BlankInstruction("empty".into())]);
    }
}
