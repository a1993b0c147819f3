//! Schema validation: lint rules and diagnostics.
//!
//! Provides built-in rules that check a [`WorkflowSchema`] for mistakes the
//! engine would otherwise only notice mid-decision. Call [`validate`] for
//! advisory diagnostics or [`validate_or_raise`] to fail on any
//! `Error`-severity issue.

use phasewise_types::{ExperimentType, Phase, WorkflowError, STOP};
use serde::Serialize;

use crate::condition::Condition;
use crate::schema::WorkflowSchema;

// ---------------------------------------------------------------------------
// Diagnostic types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct Diagnostic {
    pub rule: String,
    pub severity: Severity,
    pub message: String,
    pub program: Option<String>,
    pub phase: Option<String>,
    pub fix: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
    Info,
}

// ---------------------------------------------------------------------------
// LintRule trait
// ---------------------------------------------------------------------------

pub trait LintRule: Send + Sync {
    fn name(&self) -> &str;
    fn apply(&self, schema: &WorkflowSchema) -> Vec<Diagnostic>;
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

const EXPERIMENTS: [ExperimentType; 2] = [ExperimentType::Xray, ExperimentType::Cryoem];

/// Every condition list in the schema, labelled with where it lives.
fn condition_sites(schema: &WorkflowSchema) -> Vec<(String, Option<String>, &[Condition])> {
    let mut sites: Vec<(String, Option<String>, &[Condition])> = Vec::new();
    for (name, spec) in &schema.programs {
        sites.push((name.clone(), None, &spec.requires));
        sites.push((name.clone(), None, &spec.priority_when));
    }
    for experiment in EXPERIMENTS {
        for phase in schema.phases(experiment) {
            for candidate in &phase.programs {
                sites.push((
                    candidate.program.clone(),
                    Some(format!("{experiment}/{}", phase.phase)),
                    &candidate.conditions,
                ));
            }
        }
    }
    sites
}

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

struct UnknownConditionRule;
impl LintRule for UnknownConditionRule {
    fn name(&self) -> &str { "unknown_condition" }
    fn apply(&self, schema: &WorkflowSchema) -> Vec<Diagnostic> {
        condition_sites(schema)
            .into_iter()
            .flat_map(|(program, phase, conditions)| {
                conditions
                    .iter()
                    .filter(|c| c.is_unknown())
                    .map(move |c| Diagnostic {
                        rule: self.name().into(),
                        severity: Severity::Error,
                        message: format!(
                            "Program '{program}' uses unknown condition keyword '{}'",
                            c.keyword()
                        ),
                        program: Some(program.clone()),
                        phase: phase.clone(),
                        fix: Some(
                            "Use one of has, has_any, not_has, not_done, or '<metric>': '<op> <value>'"
                                .into(),
                        ),
                    })
            })
            .collect()
    }
}

struct UnknownProgramRule;
impl LintRule for UnknownProgramRule {
    fn name(&self) -> &str { "unknown_program" }
    fn apply(&self, schema: &WorkflowSchema) -> Vec<Diagnostic> {
        let mut diags = Vec::new();
        for experiment in EXPERIMENTS {
            for phase in schema.phases(experiment) {
                for candidate in &phase.programs {
                    if candidate.program == STOP || schema.program(&candidate.program).is_some() {
                        continue;
                    }
                    diags.push(Diagnostic {
                        rule: self.name().into(),
                        severity: Severity::Error,
                        message: format!(
                            "Phase '{experiment}/{}' names program '{}' which is not in the registry",
                            phase.phase, candidate.program
                        ),
                        program: Some(candidate.program.clone()),
                        phase: Some(format!("{experiment}/{}", phase.phase)),
                        fix: Some("Add the program to 'programs' or fix the name".into()),
                    });
                }
            }
        }
        for (experiment, programs) in [
            (ExperimentType::Xray, &schema.validation_programs.xray),
            (ExperimentType::Cryoem, &schema.validation_programs.cryoem),
        ] {
            for program in programs.iter().filter(|p| schema.program(p).is_none()) {
                diags.push(Diagnostic {
                    rule: self.name().into(),
                    severity: Severity::Error,
                    message: format!(
                        "Validation set for {experiment} names unknown program '{program}'"
                    ),
                    program: Some(program.clone()),
                    phase: None,
                    fix: None,
                });
            }
        }
        diags
    }
}

struct AnalyzePhaseRule;
impl LintRule for AnalyzePhaseRule {
    fn name(&self) -> &str { "analyze_phase" }
    fn apply(&self, schema: &WorkflowSchema) -> Vec<Diagnostic> {
        EXPERIMENTS
            .iter()
            .filter(|e| !schema.phases(**e).is_empty())
            .filter(|e| schema.phase_spec(**e, Phase::Analyze).is_none())
            .map(|e| Diagnostic {
                rule: self.name().into(),
                severity: Severity::Warning,
                message: format!("Experiment '{e}' declares phases but no 'analyze' phase"),
                program: None,
                phase: None,
                fix: Some("Add an 'analyze' phase so the first cycle has candidates".into()),
            })
            .collect()
    }
}

struct MissingPhaseRule;
impl LintRule for MissingPhaseRule {
    fn name(&self) -> &str { "missing_phase" }
    fn apply(&self, schema: &WorkflowSchema) -> Vec<Diagnostic> {
        EXPERIMENTS
            .iter()
            .filter(|e| schema.phases(**e).is_empty())
            .map(|e| Diagnostic {
                rule: self.name().into(),
                severity: Severity::Info,
                message: format!("No phase table for '{e}'; every {e} cycle will offer only STOP"),
                program: None,
                phase: None,
                fix: None,
            })
            .collect()
    }
}

struct RunOnceFlagRule;
impl LintRule for RunOnceFlagRule {
    fn name(&self) -> &str { "run_once_flag" }
    fn apply(&self, schema: &WorkflowSchema) -> Vec<Diagnostic> {
        schema
            .programs
            .iter()
            .filter(|(_, spec)| spec.run_once && spec.done_flag.is_none())
            .map(|(name, _)| Diagnostic {
                rule: self.name().into(),
                severity: Severity::Warning,
                message: format!("Program '{name}' is run_once but declares no done_flag"),
                program: Some(name.clone()),
                phase: None,
                fix: Some("Add a done_flag, otherwise run_once has no effect".into()),
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Run all built-in lint rules and return collected diagnostics.
pub fn validate(schema: &WorkflowSchema) -> Vec<Diagnostic> {
    let rules: Vec<Box<dyn LintRule>> = vec![
        Box::new(UnknownConditionRule),
        Box::new(UnknownProgramRule),
        Box::new(AnalyzePhaseRule),
        Box::new(MissingPhaseRule),
        Box::new(RunOnceFlagRule),
    ];

    let mut diagnostics = Vec::new();
    for rule in &rules {
        diagnostics.extend(rule.apply(schema));
    }
    diagnostics
}

/// Run all lint rules; return `Err` if any `Error`-severity diagnostic found.
pub fn validate_or_raise(schema: &WorkflowSchema) -> phasewise_types::Result<Vec<Diagnostic>> {
    let diagnostics = validate(schema);
    let errors: Vec<_> = diagnostics
        .iter()
        .filter(|d| d.severity == Severity::Error)
        .collect();
    if !errors.is_empty() {
        let messages: Vec<_> = errors.iter().map(|d| d.message.clone()).collect();
        return Err(WorkflowError::ValidationError(messages.join("; ")));
    }
    Ok(diagnostics)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
