//! Declarative workflow schema: program registry and per-experiment phase tables.
//!
//! The engine never hard-codes which programs exist. It asks the schema which
//! candidates a phase declares, what guards them, which completion flag a
//! program sets and whether it presupposes a placed model.

use std::collections::BTreeMap;
use std::path::Path;

use phasewise_types::{Context, ExperimentType, Phase, Result, WorkflowError, STOP};
use serde::{Deserialize, Serialize};

use crate::condition::Condition;

const BUILTIN_SCHEMA: &str = include_str!("../schema/default_workflow.json");

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgramCategory {
    Analysis,
    ModelPreparation,
    Placement,
    Phasing,
    ModelBuilding,
    Refinement,
    Ligand,
    Validation,
    Map,
    Probe,
    #[default]
    Other,
}

/// Registry entry for one program.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgramSpec {
    /// Experiments the program applies to; empty means all.
    pub experiments: Vec<ExperimentType>,
    pub category: ProgramCategory,
    /// Context flag set once the program has succeeded.
    pub done_flag: Option<String>,
    /// Never offered again once `done_flag` is set.
    pub run_once: bool,
    /// Needs a full (not half) map.
    pub requires_full_map: bool,
    /// Running it only makes sense for a model already in the experimental frame.
    pub presupposes_placement: bool,
    /// A successful run leaves a positioned model behind.
    pub places_model: bool,
    /// Prerequisites checked whenever a directive asks for the program directly.
    pub requires: Vec<Condition>,
    pub priority_when: Vec<Condition>,
    pub aliases: Vec<String>,
}

impl ProgramSpec {
    pub fn applies_to(&self, experiment: ExperimentType) -> bool {
        self.experiments.is_empty() || self.experiments.contains(&experiment)
    }
}

/// A candidate declared by a phase, optionally guarded by conditions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "PhaseProgramRepr")]
pub struct PhaseProgram {
    pub program: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

/// Phase candidates may be written as a bare program name.
#[derive(Deserialize)]
#[serde(untagged)]
enum PhaseProgramRepr {
    Name(String),
    Guarded {
        program: String,
        #[serde(default)]
        conditions: Vec<Condition>,
    },
}

impl From<PhaseProgramRepr> for PhaseProgram {
    fn from(repr: PhaseProgramRepr) -> Self {
        match repr {
            PhaseProgramRepr::Name(program) => PhaseProgram {
                program,
                conditions: Vec::new(),
            },
            PhaseProgramRepr::Guarded {
                program,
                conditions,
            } => PhaseProgram {
                program,
                conditions,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseSpec {
    pub phase: Phase,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub goal: String,
    #[serde(default)]
    pub programs: Vec<PhaseProgram>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PhaseTables {
    pub xray: Vec<PhaseSpec>,
    pub cryoem: Vec<PhaseSpec>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationSets {
    pub xray: Vec<String>,
    pub cryoem: Vec<String>,
}

/// Program registry plus phase tables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSchema {
    #[serde(default)]
    pub version: String,
    pub programs: BTreeMap<String, ProgramSpec>,
    pub phases: PhaseTables,
    #[serde(default)]
    pub validation_programs: ValidationSets,
}

impl WorkflowSchema {
    /// The schema shipped with the engine.
    pub fn builtin() -> Result<Self> {
        Self::from_json(BUILTIN_SCHEMA)
    }

    pub fn from_json(source: &str) -> Result<Self> {
        let schema: Self = serde_json::from_str(source)?;
        if schema.phases.xray.is_empty() && schema.phases.cryoem.is_empty() {
            return Err(WorkflowError::Schema("no phase tables declared".into()));
        }
        Ok(schema)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let source = std::fs::read_to_string(path)?;
        Self::from_json(&source)
    }

    pub fn program(&self, name: &str) -> Option<&ProgramSpec> {
        self.programs.get(name)
    }

    /// Map a user-supplied name (`refine`, `Phenix.Refine`, an alias) to the
    /// registry key. `STOP` resolves to itself.
    pub fn resolve_program_name(&self, raw: &str) -> Option<String> {
        let name = raw.trim();
        if name.eq_ignore_ascii_case(STOP) {
            return Some(STOP.to_string());
        }
        if self.programs.contains_key(name) {
            return Some(name.to_string());
        }
        let lowered = name.to_ascii_lowercase();
        let short = lowered.strip_prefix("phenix.").unwrap_or(&lowered);
        let prefixed = format!("phenix.{short}");
        if self.programs.contains_key(&prefixed) {
            return Some(prefixed);
        }
        self.programs
            .iter()
            .find(|(_, spec)| spec.aliases.iter().any(|a| a.eq_ignore_ascii_case(short)))
            .map(|(key, _)| key.clone())
    }

    pub fn phases(&self, experiment: ExperimentType) -> &[PhaseSpec] {
        match experiment {
            ExperimentType::Xray => &self.phases.xray,
            ExperimentType::Cryoem => &self.phases.cryoem,
        }
    }

    pub fn phase_spec(&self, experiment: ExperimentType, phase: Phase) -> Option<&PhaseSpec> {
        self.phases(experiment).iter().find(|p| p.phase == phase)
    }

    /// `(program, completion flag)` pairs for every program declaring one.
    pub fn completion_registry(&self) -> impl Iterator<Item = (&str, &str)> {
        self.programs
            .iter()
            .filter_map(|(name, spec)| spec.done_flag.as_deref().map(|flag| (name.as_str(), flag)))
    }

    /// Context key holding the completion flag for `program` (short or full
    /// name). Unregistered names fall back to `<short>_done`.
    pub fn done_flag_for(&self, program: &str) -> String {
        self.resolve_program_name(program)
            .and_then(|name| self.programs.get(&name))
            .and_then(|spec| spec.done_flag.clone())
            .unwrap_or_else(|| {
                let short = program.trim().strip_prefix("phenix.").unwrap_or(program.trim());
                format!("{short}_done")
            })
    }

    /// Whether the program's completion flag is set in `ctx`.
    pub fn is_done(&self, program: &str, ctx: &Context) -> bool {
        self.program(program)
            .and_then(|spec| spec.done_flag.as_deref())
            .is_some_and(|flag| ctx.flag(flag))
    }

    /// Whether the program is run-once and already done.
    pub fn is_exhausted(&self, program: &str, ctx: &Context) -> bool {
        self.program(program)
            .is_some_and(|spec| spec.run_once && self.is_done(program, ctx))
    }

    pub fn validation_programs(&self, experiment: ExperimentType) -> &[String] {
        match experiment {
            ExperimentType::Xray => &self.validation_programs.xray,
            ExperimentType::Cryoem => &self.validation_programs.cryoem,
        }
    }

    pub fn has_category(&self, program: &str, category: ProgramCategory) -> bool {
        self.program(program).is_some_and(|spec| spec.category == category)
    }

    /// Programs whose request implies the user believes the model is placed.
    pub fn presupposes_placement(&self, program: &str) -> bool {
        self.program(program).is_some_and(|spec| spec.presupposes_placement)
    }
}
