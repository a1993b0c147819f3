//! Per-cycle inputs handed to the engine by the caller.
//!
//! Everything here is produced outside the engine (file categorizer, history
//! analyzer, log parser, directive extraction) and is treated as read-only.
//! All types deserialize from partial JSON: missing fields take defaults.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{ExperimentType, UnitCell};

/// Well-known file categories.
pub mod categories {
    pub const DATA_MTZ: &str = "data_mtz";
    pub const MAP_COEFFS_MTZ: &str = "map_coeffs_mtz";
    pub const SEQUENCE: &str = "sequence";
    pub const MODEL: &str = "model";
    pub const SEARCH_MODEL: &str = "search_model";
    pub const PREDICTED_MODEL: &str = "predicted_model";
    pub const PROCESSED_MODEL: &str = "processed_model";
    pub const LIGAND: &str = "ligand";
    pub const FULL_MAP: &str = "full_map";
    pub const HALF_MAP: &str = "half_map";
    pub const OPTIMIZED_MAP: &str = "optimized_map";
    pub const PARTIAL_MAP: &str = "partial_map";
    pub const LIGAND_FIT_OUTPUT: &str = "ligand_fit_output";
    pub const POSITIONED: &str = "positioned";

    /// Subcategories whose models are, by construction, already in the
    /// experimental frame.
    pub const POSITIONED_SUBCATEGORIES: &[&str] = &[
        "refined",
        "phaser_output",
        "autobuild_output",
        "docked",
        "with_ligand",
        "rsr_output",
        LIGAND_FIT_OUTPUT,
        POSITIONED,
    ];

    /// Every category the context builder derives a `has_<category>` flag for.
    pub const ALL: &[&str] = &[
        DATA_MTZ,
        MAP_COEFFS_MTZ,
        SEQUENCE,
        MODEL,
        SEARCH_MODEL,
        PREDICTED_MODEL,
        PROCESSED_MODEL,
        LIGAND,
        FULL_MAP,
        HALF_MAP,
        OPTIMIZED_MAP,
        PARTIAL_MAP,
        "refined",
        "phaser_output",
        "autobuild_output",
        "docked",
        "with_ligand",
        "rsr_output",
        LIGAND_FIT_OUTPUT,
        POSITIONED,
    ];
}

// ---------------------------------------------------------------------------
// FileSet
// ---------------------------------------------------------------------------

/// Category → paths, as produced by the external file categorizer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileSet {
    categories: BTreeMap<String, Vec<String>>,
}

impl FileSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, category: &str, path: &str) -> Self {
        self.insert(category, path);
        self
    }

    pub fn insert(&mut self, category: &str, path: &str) {
        let paths = self.categories.entry(category.to_string()).or_default();
        if !paths.iter().any(|p| p == path) {
            paths.push(path.to_string());
        }
    }

    /// `true` when the category holds at least one path.
    pub fn has(&self, category: &str) -> bool {
        self.categories.get(category).is_some_and(|p| !p.is_empty())
    }

    pub fn paths(&self, category: &str) -> &[String] {
        self.categories
            .get(category)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn first(&self, category: &str) -> Option<&str> {
        self.paths(category).first().map(String::as_str)
    }

    pub fn categories(&self) -> impl Iterator<Item = (&String, &Vec<String>)> {
        self.categories.iter()
    }
}

// ---------------------------------------------------------------------------
// History
// ---------------------------------------------------------------------------

/// One executed program as recorded by the caller.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryRecord {
    pub program: String,
    pub command: String,
    /// `"SUCCESS..."` or `"FAILED..."`.
    pub result: String,
    /// Metrics extracted from the program's log, if any.
    pub metrics: BTreeMap<String, Value>,
}

impl HistoryRecord {
    pub fn succeeded(&self) -> bool {
        self.result.trim_start().to_ascii_uppercase().starts_with("SUCCESS")
    }

    pub fn failed(&self) -> bool {
        self.result.trim_start().to_ascii_uppercase().starts_with("FAILED")
    }
}

/// Outcome of the diagnostic placement probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeOutcome {
    Placed,
    NotPlaced,
    Inconclusive,
}

impl ProbeOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            ProbeOutcome::Placed => "placed",
            ProbeOutcome::NotPlaced => "not_placed",
            ProbeOutcome::Inconclusive => "inconclusive",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().replace(['-', ' '], "_").as_str() {
            "placed" | "true" => Some(ProbeOutcome::Placed),
            "not_placed" | "needs_placement" | "false" => Some(ProbeOutcome::NotPlaced),
            "inconclusive" | "unknown" | "none" => Some(ProbeOutcome::Inconclusive),
            _ => None,
        }
    }
}

/// Flags and counts aggregated from the full run history.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryInfo {
    /// Programs that succeeded at least once.
    pub completed_programs: BTreeSet<String>,
    /// Programs whose most recent run failed.
    pub failed_programs: BTreeSet<String>,
    pub refine_count: u32,
    pub rsr_count: u32,
    pub cycle_count: u32,
    pub has_placed_model_from_history: bool,
    /// `None` when no probe has run.
    pub placement_probe: Option<ProbeOutcome>,
    /// A placing program succeeded after the latest probe.
    pub placement_confirmed_after_probe: bool,
    pub last_program: Option<String>,
    /// Flags set explicitly by an external analyzer. These win over anything
    /// the completion registry derives.
    pub flags: BTreeMap<String, bool>,
}

// ---------------------------------------------------------------------------
// Analysis
// ---------------------------------------------------------------------------

/// Current-cycle metrics as parsed from logs. Values may be numbers, numeric
/// strings or arbitrary junk; the context builder coerces what it can.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Analysis {
    metrics: BTreeMap<String, Value>,
}

impl Analysis {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metrics.insert(key.to_string(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.metrics.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.metrics.iter()
    }
}

// ---------------------------------------------------------------------------
// Directives
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StopConditions {
    pub after_cycle: Option<u32>,
    pub after_program: Option<String>,
    pub r_free_target: Option<f64>,
    pub map_cc_target: Option<f64>,
    pub max_refine_cycles: Option<u32>,
    pub skip_validation: bool,
    pub start_with_program: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowPreferences {
    pub model_is_placed: Option<bool>,
    pub use_mr_sad: bool,
    pub use_experimental_phasing: bool,
    pub use_molecular_replacement: bool,
    pub skip_programs: Vec<String>,
    pub prefer_programs: Vec<String>,
}

/// Structured user intent extracted upstream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Directives {
    pub stop_conditions: StopConditions,
    pub workflow_preferences: WorkflowPreferences,
    pub constraints: Vec<String>,
    pub program_settings: BTreeMap<String, Value>,
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// Cross-cycle state carried by the caller.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionInfo {
    pub experiment_type: Option<ExperimentType>,
    pub cycle_number: u32,
    /// Model cell pre-read on the client; wins over reading files locally.
    pub model_cell: Option<UnitCell>,
    pub resolution: Option<f64>,
}

// ---------------------------------------------------------------------------
// CycleInputs
// ---------------------------------------------------------------------------

fn default_true() -> bool {
    true
}

/// Everything the engine needs for one decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleInputs {
    #[serde(default)]
    pub files: FileSet,
    #[serde(default)]
    pub history: HistoryInfo,
    #[serde(default)]
    pub analysis: Analysis,
    #[serde(default)]
    pub directives: Directives,
    #[serde(default)]
    pub session: SessionInfo,
    /// Whether the paths in `files` can be opened by this process.
    #[serde(default = "default_true")]
    pub files_local: bool,
}

impl Default for CycleInputs {
    fn default() -> Self {
        Self {
            files: FileSet::default(),
            history: HistoryInfo::default(),
            analysis: Analysis::default(),
            directives: Directives::default(),
            session: SessionInfo::default(),
            files_local: true,
        }
    }
}
