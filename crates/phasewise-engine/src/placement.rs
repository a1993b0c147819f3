//! Three-tier model-placement detector.
//!
//! - Tier 1: unit-cell comparison between the model and the experimental
//!   frame (reflection data or map grid).
//! - Tier 2: heuristic evidence from history, positioned file categories and
//!   directives (including keyword inference over free-text constraints).
//! - Tier 3: a diagnostic probe result recorded in a prior cycle.
//!
//! Tier 1 never reports a mismatch unless both cells were read and compared.

use std::path::Path;
use std::sync::OnceLock;

use phasewise_types::{
    categories, CellReadError, Context, ExperimentType, FileSet, ProbeOutcome, SessionInfo,
    UnitCell,
};
use regex::Regex;
use tracing::debug;

use crate::cells::CellReader;

/// Where the current `has_placed_model` verdict came from.
pub mod source {
    pub const DIRECTIVE: &str = "directive";
    pub const CONSTRAINTS: &str = "constraints";
    pub const PROGRAM_REQUEST: &str = "program_request";
    pub const HISTORY: &str = "history";
    pub const FILES: &str = "files";
    pub const PROBE: &str = "probe";
    pub const CELL_MISMATCH: &str = "cell_mismatch";
    pub const NONE: &str = "none";
}

const CRYOEM_REFERENCE_MAPS: [&str; 3] = [
    categories::FULL_MAP,
    categories::OPTIMIZED_MAP,
    categories::PARTIAL_MAP,
];

// ---------------------------------------------------------------------------
// Tier 1
// ---------------------------------------------------------------------------

/// Unit-cell comparison against the experimental frame.
pub struct PlacementDetector<'a> {
    cells: &'a dyn CellReader,
    tolerance: f64,
}

impl<'a> PlacementDetector<'a> {
    pub fn new(cells: &'a dyn CellReader, tolerance: f64) -> Self {
        Self { cells, tolerance }
    }

    /// `true` only when the model cell and every readable reference cell were
    /// obtained and the model matches none of them.
    pub fn cell_mismatch(
        &self,
        files: &FileSet,
        session: &SessionInfo,
        experiment: ExperimentType,
        files_local: bool,
    ) -> bool {
        let Some(model) = self.model_cell(files, session, files_local) else {
            return false;
        };
        if !files_local {
            debug!("files not local; skipping reference cell read");
            return false;
        }
        let references: Vec<UnitCell> = match experiment {
            ExperimentType::Xray => files
                .first(categories::DATA_MTZ)
                .and_then(|path| {
                    swallow(path, self.cells.reflection_cell(Path::new(path)))
                })
                .into_iter()
                .collect(),
            // First readable map of each kind, in preference order.
            ExperimentType::Cryoem => CRYOEM_REFERENCE_MAPS
                .iter()
                .filter_map(|category| {
                    files
                        .paths(category)
                        .iter()
                        .find_map(|path| swallow(path, self.cells.map_cell(Path::new(path))))
                })
                .collect(),
        };
        if references.is_empty() {
            return false;
        }
        let mismatch = references
            .iter()
            .all(|reference| model.differs_from(reference, self.tolerance));
        if mismatch {
            debug!(
                model = %model,
                reference = %references[0],
                tolerance = self.tolerance,
                "model cell differs from experimental frame"
            );
        }
        mismatch
    }

    fn model_cell(
        &self,
        files: &FileSet,
        session: &SessionInfo,
        files_local: bool,
    ) -> Option<UnitCell> {
        if let Some(cell) = session.model_cell {
            return (!cell.is_placeholder()).then_some(cell);
        }
        if !files_local {
            debug!(error = %CellReadError::NotLocal, "no client-supplied model cell");
            return None;
        }
        let path = files.first(categories::MODEL)?;
        swallow(path, self.cells.model_cell(Path::new(path)))
    }
}

fn swallow(path: &str, result: Result<UnitCell, CellReadError>) -> Option<UnitCell> {
    match result {
        Ok(cell) => Some(cell),
        Err(err) => {
            debug!(path, error = %err, "unit cell unavailable; treating as compatible");
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Tier 2: constraint keywords
// ---------------------------------------------------------------------------

fn not_placed_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)\b(?:not\s+(?:yet\s+)?(?:been\s+)?(?:placed|positioned|docked)|unplaced|needs?\s+(?:to\s+be\s+)?(?:placed|positioned|docked|placement))\b",
        )
        .expect("static pattern")
    })
}

fn placed_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)\b(?:already|is|was|are|were|been)\s+(?:correctly\s+)?(?:placed|positioned|docked)\b",
        )
        .expect("static pattern")
    })
}

/// Placement claim stated in free-text constraints. Negative statements win
/// over positive ones.
pub fn infer_from_constraints(constraints: &[String]) -> Option<bool> {
    if constraints.iter().any(|c| not_placed_pattern().is_match(c)) {
        return Some(false);
    }
    if constraints.iter().any(|c| placed_pattern().is_match(c)) {
        return Some(true);
    }
    None
}

// ---------------------------------------------------------------------------
// Post-processing override pass
// ---------------------------------------------------------------------------

/// Whether history or a completed probe confirms placement. Directives do not
/// count.
pub fn confirmed_without_directives(ctx: &Context) -> bool {
    let probe_confirms = matches!(
        probe_outcome(ctx),
        Some(ProbeOutcome::Placed | ProbeOutcome::Inconclusive)
    );
    ctx.flag("has_placed_model_from_history") || probe_confirms
}

pub fn probe_outcome(ctx: &Context) -> Option<ProbeOutcome> {
    ctx.text("placement_probe_result").and_then(ProbeOutcome::parse)
}

/// Second pass over an assembled context: records `cell_mismatch`, lets the
/// probe override tier-2 evidence, and lets a mismatch revoke a placement
/// claim not backed by history.
pub fn apply_overrides(ctx: &mut Context, cell_mismatch: bool) {
    ctx.set("cell_mismatch", cell_mismatch);

    match probe_outcome(ctx) {
        // An inconclusive probe counts as placed.
        Some(ProbeOutcome::Placed | ProbeOutcome::Inconclusive) => {
            set_placed(ctx, true, source::PROBE);
        }
        Some(ProbeOutcome::NotPlaced) => {
            if ctx.flag("placement_confirmed_after_probe") {
                set_placed(ctx, true, source::HISTORY);
            } else {
                set_placed(ctx, false, source::PROBE);
            }
        }
        None => {}
    }

    if cell_mismatch && !ctx.flag("has_placed_model_from_history") {
        set_placed(ctx, false, source::CELL_MISMATCH);
    }
}

fn set_placed(ctx: &mut Context, placed: bool, from: &str) {
    debug!(placed, source = from, "placement verdict");
    ctx.set("has_placed_model", placed);
    ctx.set("placement_source", from);
}

/// No evidence either way, a model plus experimental data exist, the model is
/// not an unplaced prediction, and no placed-model program was requested.
pub fn placement_uncertain(ctx: &Context, files: &FileSet) -> bool {
    let no_evidence = ctx.text("placement_source") == Some(source::NONE)
        && !ctx.flag("placement_probed")
        && !ctx.flag("cell_mismatch");
    let has_frame = ctx.flag("has_data_mtz") || ctx.flag("has_map");
    let predicted = files.paths(categories::PREDICTED_MODEL);
    let generic_is_prediction = files
        .paths(categories::MODEL)
        .iter()
        .all(|path| predicted.contains(path));
    no_evidence
        && files.has(categories::MODEL)
        && has_frame
        && !generic_is_prediction
        && !ctx.flag("requests_placed_program")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    /// In-memory reader keyed by path.
    #[derive(Default)]
    struct StubCells {
        cells: HashMap<String, UnitCell>,
    }

    impl StubCells {
        fn with(mut self, path: &str, cell: [f64; 6]) -> Self {
            self.cells.insert(path.to_string(), UnitCell::from(cell));
            self
        }

        fn lookup(&self, path: &Path) -> Result<UnitCell, CellReadError> {
            self.cells
                .get(path.to_string_lossy().as_ref())
                .copied()
                .ok_or_else(|| CellReadError::MissingCell(path.to_path_buf()))
        }
    }

    impl CellReader for StubCells {
        fn model_cell(&self, path: &Path) -> Result<UnitCell, CellReadError> {
            self.lookup(path)
        }
        fn reflection_cell(&self, path: &Path) -> Result<UnitCell, CellReadError> {
            self.lookup(path)
        }
        fn map_cell(&self, path: &Path) -> Result<UnitCell, CellReadError> {
            self.lookup(path)
        }
    }

    const CELL: [f64; 6] = [50.0, 60.0, 70.0, 90.0, 90.0, 90.0];
    const OTHER: [f64; 6] = [80.0, 60.0, 70.0, 90.0, 90.0, 90.0];

    fn xray_files() -> FileSet {
        FileSet::new()
            .with(categories::MODEL, "model.pdb")
            .with(categories::DATA_MTZ, "data.mtz")
    }

    #[test]
    fn xray_mismatch_detected() {
        let stub = StubCells::default()
            .with("model.pdb", CELL)
            .with("data.mtz", OTHER);
        let detector = PlacementDetector::new(&stub, 0.05);
        assert!(detector.cell_mismatch(
            &xray_files(),
            &SessionInfo::default(),
            ExperimentType::Xray,
            true
        ));
    }

    #[test]
    fn small_differences_are_compatible() {
        let stub = StubCells::default()
            .with("model.pdb", CELL)
            .with("data.mtz", [51.0, 60.5, 70.0, 90.0, 90.0, 90.0]);
        let detector = PlacementDetector::new(&stub, 0.05);
        assert!(!detector.cell_mismatch(
            &xray_files(),
            &SessionInfo::default(),
            ExperimentType::Xray,
            true
        ));
    }

    #[test]
    fn unreadable_reference_is_compatible() {
        let stub = StubCells::default().with("model.pdb", CELL);
        let detector = PlacementDetector::new(&stub, 0.05);
        assert!(!detector.cell_mismatch(
            &xray_files(),
            &SessionInfo::default(),
            ExperimentType::Xray,
            true
        ));
    }

    #[test]
    fn session_cell_takes_precedence() {
        let stub = StubCells::default()
            .with("model.pdb", OTHER)
            .with("data.mtz", CELL);
        let session = SessionInfo {
            model_cell: Some(UnitCell::from(CELL)),
            ..Default::default()
        };
        let detector = PlacementDetector::new(&stub, 0.05);
        assert!(!detector.cell_mismatch(&xray_files(), &session, ExperimentType::Xray, true));
    }

    #[test]
    fn non_local_files_never_mismatch() {
        let stub = StubCells::default()
            .with("model.pdb", CELL)
            .with("data.mtz", OTHER);
        let session = SessionInfo {
            model_cell: Some(UnitCell::from(CELL)),
            ..Default::default()
        };
        let detector = PlacementDetector::new(&stub, 0.05);
        assert!(!detector.cell_mismatch(&xray_files(), &session, ExperimentType::Xray, false));
    }

    #[test]
    fn cryoem_compatible_with_any_map() {
        let files = FileSet::new()
            .with(categories::MODEL, "model.pdb")
            .with(categories::FULL_MAP, "full.mrc")
            .with(categories::PARTIAL_MAP, "box.mrc");
        let stub = StubCells::default()
            .with("model.pdb", CELL)
            .with("full.mrc", OTHER)
            .with("box.mrc", CELL);
        let detector = PlacementDetector::new(&stub, 0.05);
        assert!(!detector.cell_mismatch(
            &files,
            &SessionInfo::default(),
            ExperimentType::Cryoem,
            true
        ));

        let stub = StubCells::default()
            .with("model.pdb", CELL)
            .with("full.mrc", OTHER)
            .with("box.mrc", OTHER);
        let detector = PlacementDetector::new(&stub, 0.05);
        assert!(detector.cell_mismatch(
            &files,
            &SessionInfo::default(),
            ExperimentType::Cryoem,
            true
        ));
    }

    #[test]
    fn constraint_keywords() {
        let placed = vec!["The model is already placed in the cell".to_string()];
        let not_placed = vec!["model has not been placed yet".to_string()];
        let neutral = vec!["use 4 processors".to_string()];
        assert_eq!(infer_from_constraints(&placed), Some(true));
        assert_eq!(infer_from_constraints(&not_placed), Some(false));
        assert_eq!(infer_from_constraints(&neutral), None);
    }

    #[test]
    fn not_placed_probe_respects_later_confirmation() {
        let mut ctx = Context::new();
        ctx.set("placement_probe_result", "not_placed");
        apply_overrides(&mut ctx, false);
        assert!(!ctx.flag("has_placed_model"));

        ctx.set("placement_confirmed_after_probe", true);
        apply_overrides(&mut ctx, false);
        assert!(ctx.flag("has_placed_model"));
    }

    #[test]
    fn inconclusive_probe_counts_as_placed() {
        let mut ctx = Context::new();
        ctx.set("placement_probe_result", "inconclusive");
        apply_overrides(&mut ctx, false);
        assert!(ctx.flag("has_placed_model"));
        assert_eq!(ctx.text("placement_source"), Some(source::PROBE));
    }

    #[test]
    fn mismatch_revokes_directive_claim_but_not_history() {
        let mut ctx = Context::new();
        ctx.set("has_placed_model", true);
        ctx.set("placement_source", source::DIRECTIVE);
        apply_overrides(&mut ctx, true);
        assert!(!ctx.flag("has_placed_model"));
        assert!(ctx.flag("cell_mismatch"));

        let mut ctx = Context::new();
        ctx.set("has_placed_model", true);
        ctx.set("has_placed_model_from_history", true);
        apply_overrides(&mut ctx, true);
        assert!(ctx.flag("has_placed_model"));
    }

    #[test]
    fn uncertainty_requires_model_and_frame_without_evidence() {
        let files = xray_files();
        let mut ctx = Context::new();
        ctx.set("placement_source", source::NONE);
        ctx.set("has_data_mtz", true);
        assert!(placement_uncertain(&ctx, &files));

        ctx.set("requests_placed_program", true);
        assert!(!placement_uncertain(&ctx, &files));

        let predicted = FileSet::new()
            .with(categories::MODEL, "af.pdb")
            .with(categories::PREDICTED_MODEL, "af.pdb")
            .with(categories::DATA_MTZ, "data.mtz");
        ctx.set("requests_placed_program", false);
        assert!(!placement_uncertain(&ctx, &predicted));
    }
}
