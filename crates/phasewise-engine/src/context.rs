//! Context assembly: turns one cycle's inputs into the flat signal map every
//! later stage reads.
//!
//! Assembly runs in two passes. The first derives base signals from files,
//! history, metrics and directives. The second is the placement override pass
//! in [`crate::placement`]. Nothing is carried over between cycles.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::OnceLock;

use phasewise_types::{
    categories, Analysis, Context, CycleInputs, Directives, ExperimentType, FileSet, HistoryInfo,
    SessionInfo,
};
use regex::Regex;
use serde_json::{Number, Value};
use tracing::debug;

use crate::cells::CellReader;
use crate::config::EngineConfig;
use crate::placement::{self, PlacementDetector};
use crate::schema::WorkflowSchema;

/// Metrics always present in the context, `null` when not measured.
pub const KNOWN_METRICS: &[&str] = &[
    "r_free",
    "r_work",
    "map_cc",
    "clashscore",
    "resolution",
    "tfz",
    "llg",
    "twin_fraction",
    "anomalous_measurability",
];

const TWINNING_THRESHOLD: f64 = 0.20;
const ANOMALOUS_THRESHOLD: f64 = 0.10;

const MAP_CATEGORIES: [&str; 4] = [
    categories::FULL_MAP,
    categories::HALF_MAP,
    categories::OPTIMIZED_MAP,
    categories::PARTIAL_MAP,
];

const MODEL_SOURCES: [&str; 4] = [
    categories::MODEL,
    categories::SEARCH_MODEL,
    categories::PREDICTED_MODEL,
    categories::PROCESSED_MODEL,
];

/// Merge completion flags: keys present in `explicit` win, `derived` only
/// fills gaps.
pub fn merge_flags(
    explicit: &BTreeMap<String, bool>,
    derived: &BTreeMap<String, bool>,
) -> BTreeMap<String, bool> {
    let mut merged = derived.clone();
    merged.extend(explicit.iter().map(|(k, v)| (k.clone(), *v)));
    merged
}

/// Experiment type from the session, otherwise inferred from the files: maps
/// without reflection data mean cryo-EM.
pub fn resolve_experiment(inputs: &CycleInputs) -> ExperimentType {
    if let Some(experiment) = inputs.session.experiment_type {
        return experiment;
    }
    let has_map = MAP_CATEGORIES.iter().any(|c| inputs.files.has(c));
    if has_map && !inputs.files.has(categories::DATA_MTZ) {
        ExperimentType::Cryoem
    } else {
        ExperimentType::Xray
    }
}

/// Coerce a metric to a float, keeping the raw value when it is not numeric.
pub fn coerce_metric(value: &Value) -> Value {
    match value {
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map(Value::Number)
            .unwrap_or_else(|| value.clone()),
        other => other.clone(),
    }
}

fn ligand_request_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(?:fit|fitting|place|dock)\s+(?:the\s+|a\s+)?ligands?\b|\bligand\s*fit")
            .expect("static pattern")
    })
}

/// Builds the per-cycle [`Context`].
pub struct ContextBuilder<'a> {
    schema: &'a WorkflowSchema,
    config: &'a EngineConfig,
    cells: &'a dyn CellReader,
}

impl<'a> ContextBuilder<'a> {
    pub fn new(
        schema: &'a WorkflowSchema,
        config: &'a EngineConfig,
        cells: &'a dyn CellReader,
    ) -> Self {
        Self {
            schema,
            config,
            cells,
        }
    }

    pub fn build(&self, inputs: &CycleInputs) -> Context {
        let experiment = resolve_experiment(inputs);
        let mut ctx = Context::new();

        metric_signals(&mut ctx, &inputs.analysis, &inputs.session);
        ctx.set("experiment_type", experiment.as_str());
        ctx.set("files_local", inputs.files_local);
        file_signals(&mut ctx, &inputs.files);
        self.history_signals(&mut ctx, &inputs.history, &inputs.directives, experiment);
        ctx.set(
            "cycle_number",
            inputs.session.cycle_number.max(inputs.history.cycle_count),
        );
        self.directive_signals(&mut ctx, &inputs.directives);
        placement_claim(&mut ctx, &inputs.directives);

        // Post-processing override pass.
        let mismatch = if placement::confirmed_without_directives(&ctx) {
            debug!("placement confirmed by history or probe; skipping cell comparison");
            false
        } else {
            PlacementDetector::new(self.cells, self.config.cell_tolerance).cell_mismatch(
                &inputs.files,
                &inputs.session,
                experiment,
                inputs.files_local,
            )
        };
        placement::apply_overrides(&mut ctx, mismatch);
        let uncertain = placement::placement_uncertain(&ctx, &inputs.files);
        ctx.set("placement_uncertain", uncertain);

        debug!(signals = ctx.len(), experiment = %experiment, "context assembled");
        ctx
    }

    fn normalize(&self, program: &str) -> String {
        self.schema
            .resolve_program_name(program)
            .unwrap_or_else(|| program.trim().to_string())
    }

    fn history_signals(
        &self,
        ctx: &mut Context,
        history: &HistoryInfo,
        directives: &Directives,
        experiment: ExperimentType,
    ) {
        let completed: BTreeSet<String> = history
            .completed_programs
            .iter()
            .map(|p| self.normalize(p))
            .collect();
        let failed: BTreeSet<String> = history
            .failed_programs
            .iter()
            .map(|p| self.normalize(p))
            .collect();

        let mut derived: BTreeMap<String, bool> = self
            .schema
            .completion_registry()
            .map(|(_, flag)| (flag.to_string(), false))
            .collect();
        for program in &completed {
            derived.insert(self.schema.done_flag_for(program), true);
        }
        if history.refine_count > 0 {
            derived.insert("refine_done".into(), true);
        }
        if history.rsr_count > 0 {
            derived.insert("rsr_done".into(), true);
        }

        let mut flags = merge_flags(&history.flags, &derived);
        for skipped in &directives.workflow_preferences.skip_programs {
            let flag = self.schema.done_flag_for(skipped);
            debug!(program = skipped.as_str(), flag = flag.as_str(), "skipped program marked done");
            flags.insert(flag, true);
        }
        for (flag, value) in flags {
            ctx.set(flag, value);
        }

        ctx.set("refine_count", history.refine_count);
        ctx.set("rsr_count", history.rsr_count);
        let cycles = match experiment {
            ExperimentType::Xray => history.refine_count,
            ExperimentType::Cryoem => history.rsr_count,
        };
        ctx.set("refine_cycles", cycles);
        ctx.set_opt("last_program", history.last_program.as_deref().map(|p| self.normalize(p)));

        let ligandfit_failed = history.flags.get("ligandfit_failed").copied().unwrap_or(false)
            || (failed.contains("phenix.ligandfit") && !completed.contains("phenix.ligandfit"));
        ctx.set("ligandfit_failed", ligandfit_failed);

        let placed_by_history = history.has_placed_model_from_history
            || completed
                .iter()
                .any(|p| self.schema.program(p).is_some_and(|spec| spec.places_model));
        ctx.set("has_placed_model_from_history", placed_by_history);
        ctx.set("placement_probed", history.placement_probe.is_some());
        ctx.set_opt(
            "placement_probe_result",
            history.placement_probe.map(|p| p.as_str()),
        );
        ctx.set(
            "placement_confirmed_after_probe",
            history.placement_confirmed_after_probe,
        );
    }

    fn directive_signals(&self, ctx: &mut Context, directives: &Directives) {
        let stop = &directives.stop_conditions;
        let prefs = &directives.workflow_preferences;

        ctx.set_opt("r_free_target", stop.r_free_target);
        ctx.set_opt("map_cc_target", stop.map_cc_target);
        ctx.set_opt("max_refine_cycles", stop.max_refine_cycles);
        ctx.set_opt("after_cycle", stop.after_cycle);
        ctx.set("skip_validation", stop.skip_validation);
        ctx.set("use_mr_sad", prefs.use_mr_sad);
        ctx.set("use_experimental_phasing", prefs.use_experimental_phasing);
        ctx.set("use_molecular_replacement", prefs.use_molecular_replacement);
        ctx.set_opt("model_is_placed_directive", prefs.model_is_placed);

        let after_program = stop.after_program.as_deref().map(|p| self.normalize(p));
        let start_with = stop.start_with_program.as_deref().map(|p| self.normalize(p));
        ctx.set_opt("after_program", after_program.clone());
        ctx.set_opt("start_with_program", start_with.clone());
        ctx.set_opt("explicit_program", after_program.clone().or(start_with.clone()));

        let requested: BTreeSet<String> = after_program
            .into_iter()
            .chain(start_with)
            .chain(directives.program_settings.keys().map(|p| self.normalize(p)))
            .chain(prefs.prefer_programs.iter().map(|p| self.normalize(p)))
            .collect();

        let wants_ligand_fit = requested.contains("phenix.ligandfit")
            || directives
                .constraints
                .iter()
                .any(|c| ligand_request_pattern().is_match(c));
        ctx.set("wants_ligand_fit", wants_ligand_fit);

        let requests_placed = requested
            .iter()
            .any(|p| self.schema.presupposes_placement(p));
        ctx.set("requests_placed_program", requests_placed);
    }
}

fn metric_signals(ctx: &mut Context, analysis: &Analysis, session: &SessionInfo) {
    for (key, value) in analysis.iter() {
        ctx.set(key.clone(), coerce_metric(value));
    }
    if ctx.number("resolution").is_none() {
        if let Some(resolution) = session.resolution {
            ctx.set("resolution", resolution);
        }
    }
    for metric in KNOWN_METRICS {
        ctx.set_default(*metric, Value::Null);
    }

    let has_twinning = ctx
        .number("twin_fraction")
        .is_some_and(|t| t > TWINNING_THRESHOLD);
    let strong_anomalous = ctx
        .number("anomalous_measurability")
        .is_some_and(|m| m > ANOMALOUS_THRESHOLD);
    let has_anomalous = strong_anomalous || ctx.flag("has_anomalous");
    ctx.set("has_twinning", has_twinning);
    ctx.set("strong_anomalous", strong_anomalous);
    ctx.set("has_anomalous", has_anomalous);
}

fn file_signals(ctx: &mut Context, files: &FileSet) {
    for category in categories::ALL {
        ctx.set(format!("has_{category}"), files.has(category));
    }
    for (category, _) in files.categories() {
        ctx.set_default(format!("has_{category}"), files.has(category));
    }
    let has_map = MAP_CATEGORIES.iter().any(|c| files.has(c));
    let has_model_source = MODEL_SOURCES.iter().any(|c| files.has(c));
    let has_positioned = categories::POSITIONED_SUBCATEGORIES
        .iter()
        .any(|c| files.has(c));
    ctx.set("has_map", has_map);
    ctx.set("has_model_source", has_model_source);
    ctx.set("has_positioned_model", has_positioned);
    ctx.set("has_any_model", has_model_source || has_positioned);
}

/// Layered tier-2 evidence: directive claim, then history, then positioned files.
fn placement_claim(ctx: &mut Context, directives: &Directives) {
    let (placed, from) = if let Some(claim) = directives.workflow_preferences.model_is_placed {
        (claim, placement::source::DIRECTIVE)
    } else if let Some(claim) = placement::infer_from_constraints(&directives.constraints) {
        (claim, placement::source::CONSTRAINTS)
    } else if ctx.flag("requests_placed_program") {
        (true, placement::source::PROGRAM_REQUEST)
    } else if ctx.flag("has_placed_model_from_history") {
        (true, placement::source::HISTORY)
    } else if ctx.flag("has_positioned_model") {
        (true, placement::source::FILES)
    } else {
        (false, placement::source::NONE)
    };
    ctx.set("has_placed_model", placed);
    ctx.set("placement_source", from);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cells::FileCellReader;
    use phasewise_types::{ProbeOutcome, WorkflowPreferences};

    fn build(inputs: &CycleInputs) -> Context {
        let schema = WorkflowSchema::builtin().unwrap();
        let config = EngineConfig::default();
        ContextBuilder::new(&schema, &config, &FileCellReader).build(inputs)
    }

    #[test]
    fn merge_flags_explicit_wins() {
        let explicit = BTreeMap::from([("phaser_done".to_string(), false)]);
        let derived = BTreeMap::from([
            ("phaser_done".to_string(), true),
            ("autosol_done".to_string(), true),
        ]);
        let merged = merge_flags(&explicit, &derived);
        assert_eq!(merged["phaser_done"], false);
        assert_eq!(merged["autosol_done"], true);
    }

    #[test]
    fn completion_flags_come_from_registry_and_history() {
        let mut inputs = CycleInputs::default();
        inputs.history.completed_programs.insert("xtriage".into());
        inputs.history.refine_count = 2;
        let ctx = build(&inputs);
        assert!(ctx.flag("xtriage_done"));
        assert!(ctx.flag("refine_done"));
        assert!(ctx.contains("autosol_done"));
        assert!(!ctx.flag("autosol_done"));
        assert_eq!(ctx.count("refine_cycles"), 2);
    }

    #[test]
    fn skipped_programs_count_as_done() {
        let mut inputs = CycleInputs::default();
        inputs.directives.workflow_preferences = WorkflowPreferences {
            skip_programs: vec!["phenix.xtriage".into()],
            ..Default::default()
        };
        assert!(build(&inputs).flag("xtriage_done"));
    }

    #[test]
    fn metrics_are_coerced_and_derived_flags_set() {
        let mut inputs = CycleInputs::default();
        inputs.analysis = Analysis::new()
            .with("r_free", "0.27")
            .with("twin_fraction", 0.31)
            .with("anomalous_measurability", 0.05)
            .with("space_group", "P 21 21 21");
        let ctx = build(&inputs);
        assert_eq!(ctx.number("r_free"), Some(0.27));
        assert_eq!(ctx.text("space_group"), Some("P 21 21 21"));
        assert!(ctx.flag("has_twinning"));
        assert!(!ctx.flag("strong_anomalous"));
        assert_eq!(ctx.get("map_cc"), Some(&Value::Null));
    }

    #[test]
    fn experiment_inferred_from_maps() {
        let mut inputs = CycleInputs::default();
        inputs.files = FileSet::new().with(categories::HALF_MAP, "half_1.mrc");
        let ctx = build(&inputs);
        assert_eq!(ctx.experiment_type(), ExperimentType::Cryoem);
        assert!(ctx.flag("has_map"));
    }

    #[test]
    fn directive_claim_outranks_history() {
        let mut inputs = CycleInputs::default();
        inputs.history.has_placed_model_from_history = true;
        inputs.directives.workflow_preferences.model_is_placed = Some(false);
        let ctx = build(&inputs);
        assert!(!ctx.flag("has_placed_model"));
        assert_eq!(ctx.text("placement_source"), Some(placement::source::DIRECTIVE));
    }

    #[test]
    fn positioned_files_imply_placement() {
        let mut inputs = CycleInputs::default();
        inputs.files = FileSet::new().with("phaser_output", "PHASER.1.pdb");
        let ctx = build(&inputs);
        assert!(ctx.flag("has_placed_model"));
        assert!(ctx.flag("has_any_model"));
    }

    #[test]
    fn probe_result_overrides_file_evidence() {
        let mut inputs = CycleInputs::default();
        inputs.files = FileSet::new().with("docked", "docked.pdb");
        inputs.history.placement_probe = Some(ProbeOutcome::NotPlaced);
        let ctx = build(&inputs);
        assert!(!ctx.flag("has_placed_model"));
        assert!(ctx.flag("placement_probed"));
    }

    #[test]
    fn ligand_request_detected_in_constraints() {
        let mut inputs = CycleInputs::default();
        inputs.directives.constraints = vec!["Please fit the ligand ATP".into()];
        assert!(build(&inputs).flag("wants_ligand_fit"));
    }

    #[test]
    fn requested_refinement_presupposes_placement() {
        let mut inputs = CycleInputs::default();
        inputs.directives.stop_conditions.start_with_program = Some("refine".into());
        let ctx = build(&inputs);
        assert_eq!(ctx.text("explicit_program"), Some("phenix.refine"));
        assert!(ctx.flag("requests_placed_program"));
        assert!(ctx.flag("has_placed_model"));
    }

    #[test]
    fn building_twice_is_identical() {
        let mut inputs = CycleInputs::default();
        inputs.files = FileSet::new()
            .with(categories::MODEL, "/nonexistent/model.pdb")
            .with(categories::DATA_MTZ, "/nonexistent/data.mtz");
        inputs.analysis = Analysis::new().with("r_free", 0.3);
        assert_eq!(build(&inputs), build(&inputs));
    }
}
