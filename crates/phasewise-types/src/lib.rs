//! Shared types, errors, context, and decision output for the phasewise engine.
//!
//! This crate provides the foundational types used across all other phasewise crates:
//! - `WorkflowError`: unified error taxonomy
//! - `Context`: flat signal map rebuilt every cycle
//! - `Phase` / `PhaseResult`: pipeline phases and the detector's verdict
//! - `UnitCell`: six-parameter crystallographic cell used for placement checks
//! - cycle inputs (see [`inputs`]) and the [`WorkflowState`] decision object

pub mod inputs;
pub mod state;

pub use inputs::{
    categories, Analysis, CycleInputs, Directives, FileSet, HistoryInfo, HistoryRecord,
    ProbeOutcome, SessionInfo, StopConditions, WorkflowPreferences,
};
pub use state::WorkflowState;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// Sentinel program name meaning "nothing further to run".
pub const STOP: &str = "STOP";

/// Unified error type for all phasewise subsystems.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    // === Schema Errors ===
    #[error("Unknown condition keyword '{keyword}' on program '{program}'")]
    UnknownCondition { keyword: String, program: String },

    #[error("Invalid workflow schema: {0}")]
    Schema(String),

    #[error("Schema validation failed: {0}")]
    ValidationError(String),

    // === Generic ===
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl WorkflowError {
    /// Returns `true` for errors caused by the declarative schema rather than
    /// by the cycle inputs.
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            WorkflowError::UnknownCondition { .. }
                | WorkflowError::Schema(_)
                | WorkflowError::ValidationError(_)
        )
    }
}

/// A convenience alias for `Result<T, WorkflowError>`.
pub type Result<T> = std::result::Result<T, WorkflowError>;

/// Why a unit cell could not be obtained from a file.
///
/// These never escape the placement detector: every variant resolves to
/// "no mismatch".
#[derive(Debug, thiserror::Error)]
pub enum CellReadError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("unsupported cell source format: {0}")]
    UnsupportedFormat(PathBuf),

    #[error("no unit cell found in {0}")]
    MissingCell(PathBuf),

    #[error("malformed unit cell in {path}: {message}")]
    Malformed { path: PathBuf, message: String },

    #[error("files are not locally accessible")]
    NotLocal,
}

// ---------------------------------------------------------------------------
// Context: flat signal map consumed by every decision stage
// ---------------------------------------------------------------------------

/// Signal name → value mapping derived from one cycle's inputs.
///
/// Values are booleans, floats, strings or null. The map is ordered so that
/// serialized contexts are byte-identical for identical inputs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Context {
    values: BTreeMap<String, Value>,
}

impl Context {
    /// Create an empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite a key.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(key.into(), value.into());
    }

    /// Insert an optional value, storing `null` for `None`.
    pub fn set_opt<T: Into<Value>>(&mut self, key: impl Into<String>, value: Option<T>) {
        let value = value.map(Into::into).unwrap_or(Value::Null);
        self.values.insert(key.into(), value);
    }

    /// Insert only when the key is absent. Returns whether the value was stored.
    pub fn set_default(&mut self, key: impl Into<String>, value: impl Into<Value>) -> bool {
        let key = key.into();
        if self.values.contains_key(&key) {
            return false;
        }
        self.values.insert(key, value.into());
        true
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Boolean signal. Absent, null and non-boolean values read as `false`.
    pub fn flag(&self, key: &str) -> bool {
        self.values.get(key).and_then(Value::as_bool).unwrap_or(false)
    }

    /// Numeric signal. Strings are not parsed here; coercion happens when the
    /// context is built.
    pub fn number(&self, key: &str) -> Option<f64> {
        self.values.get(key).and_then(Value::as_f64)
    }

    /// Non-negative integer signal, `0` when absent.
    pub fn count(&self, key: &str) -> u32 {
        self.number(key)
            .filter(|n| n.is_finite() && *n > 0.0)
            .map(|n| n as u32)
            .unwrap_or(0)
    }

    pub fn text(&self, key: &str) -> Option<&str> {
        self.values.get(key).and_then(Value::as_str)
    }

    /// The experiment type recorded under `experiment_type`, defaulting to X-ray.
    pub fn experiment_type(&self) -> ExperimentType {
        self.text("experiment_type")
            .and_then(ExperimentType::parse_lenient)
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.values.iter()
    }
}

// ---------------------------------------------------------------------------
// ExperimentType
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExperimentType {
    #[default]
    Xray,
    #[serde(alias = "cryo_em", alias = "cryo-em", alias = "em")]
    Cryoem,
}

impl ExperimentType {
    pub fn as_str(self) -> &'static str {
        match self {
            ExperimentType::Xray => "xray",
            ExperimentType::Cryoem => "cryoem",
        }
    }

    /// Accepts the spellings upstream extraction steps are known to produce.
    pub fn parse_lenient(raw: &str) -> Option<Self> {
        let normalized: String = raw
            .trim()
            .to_ascii_lowercase()
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect();
        match normalized.as_str() {
            "xray" | "crystal" | "crystallography" => Some(ExperimentType::Xray),
            "cryoem" | "em" | "cryo" => Some(ExperimentType::Cryoem),
            _ => None,
        }
    }
}

impl fmt::Display for ExperimentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Phase / PhaseResult
// ---------------------------------------------------------------------------

/// A pipeline phase. X-ray and cryo-EM share the common phases and each adds
/// its own placement and map phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Analyze,
    MolecularReplacement,
    BuildFromPhases,
    ExperimentalPhasing,
    ProbePlacement,
    ObtainModel,
    CombineLigand,
    OptimizeMap,
    DockModel,
    ReadyToRefine,
    Refine,
    Validate,
    Complete,
}

impl Phase {
    pub const ALL: [Phase; 13] = [
        Phase::Analyze,
        Phase::MolecularReplacement,
        Phase::BuildFromPhases,
        Phase::ExperimentalPhasing,
        Phase::ProbePlacement,
        Phase::ObtainModel,
        Phase::CombineLigand,
        Phase::OptimizeMap,
        Phase::DockModel,
        Phase::ReadyToRefine,
        Phase::Refine,
        Phase::Validate,
        Phase::Complete,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Analyze => "analyze",
            Phase::MolecularReplacement => "molecular_replacement",
            Phase::BuildFromPhases => "build_from_phases",
            Phase::ExperimentalPhasing => "experimental_phasing",
            Phase::ProbePlacement => "probe_placement",
            Phase::ObtainModel => "obtain_model",
            Phase::CombineLigand => "combine_ligand",
            Phase::OptimizeMap => "optimize_map",
            Phase::DockModel => "dock_model",
            Phase::ReadyToRefine => "ready_to_refine",
            Phase::Refine => "refine",
            Phase::Validate => "validate",
            Phase::Complete => "complete",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Phase::ALL.into_iter().find(|p| p.as_str() == raw.trim())
    }

    /// Terminal phases offer nothing but `STOP`.
    pub fn is_terminal(self) -> bool {
        self == Phase::Complete
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The phase detector's verdict for one cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseResult {
    pub phase: Phase,
    pub description: String,
    pub goal: String,
    pub reason: String,
}

// ---------------------------------------------------------------------------
// UnitCell
// ---------------------------------------------------------------------------

/// Unit-cell edges (Å) and angles (degrees).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f64; 6]", into = "[f64; 6]")]
pub struct UnitCell {
    pub a: f64,
    pub b: f64,
    pub c: f64,
    pub alpha: f64,
    pub beta: f64,
    pub gamma: f64,
}

impl UnitCell {
    pub fn new(a: f64, b: f64, c: f64, alpha: f64, beta: f64, gamma: f64) -> Self {
        Self { a, b, c, alpha, beta, gamma }
    }

    pub fn params(&self) -> [f64; 6] {
        [self.a, self.b, self.c, self.alpha, self.beta, self.gamma]
    }

    /// Cells written as placeholders (e.g. `CRYST1 1.000 1.000 1.000`) or with
    /// non-finite/non-positive parameters carry no geometric information.
    pub fn is_placeholder(&self) -> bool {
        let edges_unusable = [self.a, self.b, self.c].iter().any(|e| *e <= 1.0);
        let any_invalid = self.params().iter().any(|p| !p.is_finite() || *p <= 0.0);
        edges_unusable || any_invalid
    }

    /// Largest relative difference over the six parameters, measured against `reference`.
    pub fn max_relative_difference(&self, reference: &UnitCell) -> f64 {
        self.params()
            .iter()
            .zip(reference.params().iter())
            .map(|(mine, theirs)| (mine - theirs).abs() / theirs.abs())
            .fold(0.0, f64::max)
    }

    /// `true` only when both cells are usable and any parameter differs by
    /// more than `tolerance` (fraction, e.g. `0.05`).
    pub fn differs_from(&self, reference: &UnitCell, tolerance: f64) -> bool {
        if self.is_placeholder() || reference.is_placeholder() {
            return false;
        }
        self.max_relative_difference(reference) > tolerance
    }
}

impl From<[f64; 6]> for UnitCell {
    fn from(p: [f64; 6]) -> Self {
        UnitCell::new(p[0], p[1], p[2], p[3], p[4], p[5])
    }
}

impl From<UnitCell> for [f64; 6] {
    fn from(cell: UnitCell) -> Self {
        cell.params()
    }
}

impl fmt::Display for UnitCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:.2} {:.2} {:.2} {:.2} {:.2} {:.2}",
            self.a, self.b, self.c, self.alpha, self.beta, self.gamma
        )
    }
}
