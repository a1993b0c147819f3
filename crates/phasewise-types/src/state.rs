//! The decision object returned to callers each cycle.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{Context, ExperimentType, FileSet, PhaseResult, STOP};

/// Externally consumed result of one decision cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    /// Name of the detected phase.
    pub state: String,
    pub experiment_type: ExperimentType,
    /// Ordered, never empty; `["STOP"]` when nothing is runnable.
    pub valid_programs: Vec<String>,
    pub program_priorities: Vec<String>,
    pub forced_program: Option<String>,
    pub reason: String,
    pub phase_info: PhaseResult,
    pub context: Context,
    pub resolution: Option<f64>,
    /// Program → why it is not offered this cycle.
    pub unavailable_explanations: BTreeMap<String, String>,
    pub categorized_files: FileSet,
    /// Audit trail of directive rewrites, for diagnostics only.
    #[serde(default)]
    pub directive_notes: Vec<String>,
}

impl WorkflowState {
    /// `true` when `STOP` is the only option.
    pub fn is_stop_only(&self) -> bool {
        self.valid_programs.len() == 1 && self.valid_programs[0] == STOP
    }

    pub fn offers(&self, program: &str) -> bool {
        self.valid_programs.iter().any(|p| p == program)
    }
}
