//! Phase detection: one ordered guard list per experiment type.
//!
//! Guards are evaluated top to bottom and the first one that applies decides
//! the phase. The last guard of each list always applies.

use phasewise_types::{Context, ExperimentType, Phase, PhaseResult};
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::schema::WorkflowSchema;
use crate::selector::half_maps_only;
use crate::target::{assess_target, ligand_fit_pending};

type Predicate = fn(&Context, &EngineConfig) -> bool;
type Explain = fn(&Context, &EngineConfig) -> String;

/// A named transition rule.
pub struct PhaseGuard {
    pub name: &'static str,
    pub phase: Phase,
    applies: Predicate,
    reason: Explain,
}

impl PhaseGuard {
    pub fn applies(&self, ctx: &Context, config: &EngineConfig) -> bool {
        (self.applies)(ctx, config)
    }

    pub fn reason(&self, ctx: &Context, config: &EngineConfig) -> String {
        (self.reason)(ctx, config)
    }
}

// ---------------------------------------------------------------------------
// Shared predicates
// ---------------------------------------------------------------------------

fn placed(ctx: &Context) -> bool {
    ctx.flag("has_placed_model")
}

fn model_source(ctx: &Context) -> bool {
    ["model_source", "model", "search_model", "predicted_model", "processed_model"]
        .iter()
        .any(|c| ctx.flag(&format!("has_{c}")))
}

fn probe_pending(ctx: &Context, _: &EngineConfig) -> bool {
    ctx.flag("placement_uncertain") && !ctx.flag("placement_probed")
}

fn definitive_mismatch(ctx: &Context) -> bool {
    ctx.flag("cell_mismatch") && !ctx.flag("has_placed_model_from_history")
}

fn unplaced_model_source(ctx: &Context, _: &EngineConfig) -> bool {
    model_source(ctx) && !placed(ctx)
}

fn nothing_placed(ctx: &Context, _: &EngineConfig) -> bool {
    !placed(ctx)
}

fn ligand_pending(ctx: &Context, _: &EngineConfig) -> bool {
    ligand_fit_pending(ctx)
}

fn below_target(ctx: &Context, config: &EngineConfig) -> bool {
    !assess_target(ctx, config).at_target
}

fn validation_outstanding(ctx: &Context, _: &EngineConfig) -> bool {
    !ctx.flag("validation_done")
}

fn always(_: &Context, _: &EngineConfig) -> bool {
    true
}

fn target_reason(ctx: &Context, config: &EngineConfig) -> String {
    assess_target(ctx, config).reason
}

// ---------------------------------------------------------------------------
// X-ray
// ---------------------------------------------------------------------------

fn xray_analyze(ctx: &Context, _: &EngineConfig) -> bool {
    !ctx.flag("xtriage_done")
}

fn xray_mismatch(ctx: &Context, _: &EngineConfig) -> bool {
    definitive_mismatch(ctx) && model_source(ctx)
}

fn xray_mismatch_without_source(ctx: &Context, _: &EngineConfig) -> bool {
    definitive_mismatch(ctx)
}

fn mr_sad(ctx: &Context, _: &EngineConfig) -> bool {
    ctx.flag("phaser_done")
        && placed(ctx)
        && !ctx.flag("autosol_done")
        && ctx.flag("has_sequence")
        && (ctx.flag("has_anomalous") || ctx.flag("use_mr_sad"))
}

fn experimental_phases_without_model(ctx: &Context, _: &EngineConfig) -> bool {
    (ctx.flag("autosol_done") || ctx.flag("has_map_coeffs_mtz"))
        && !placed(ctx)
        && !ctx.flag("autobuild_done")
        && ctx.flag("has_sequence")
}

fn prefers_experimental_phasing(ctx: &Context, _: &EngineConfig) -> bool {
    ctx.flag("use_experimental_phasing") && !ctx.flag("autosol_done") && !placed(ctx)
}

fn anomalous_with_sequence(ctx: &Context, _: &EngineConfig) -> bool {
    ctx.flag("has_anomalous")
        && ctx.flag("has_sequence")
        && !ctx.flag("autosol_done")
        && !placed(ctx)
}

fn ligand_not_combined(ctx: &Context, _: &EngineConfig) -> bool {
    ctx.flag("has_ligand_fit_output") && !ctx.flag("pdbtools_done")
}

fn unrefined(ctx: &Context, _: &EngineConfig) -> bool {
    ctx.count("refine_cycles") == 0
}

fn xray_analyze_reason(_: &Context, _: &EngineConfig) -> String {
    "Data not yet characterized; run xtriage".into()
}

fn mismatch_reason(_: &Context, _: &EngineConfig) -> String {
    "Model unit cell does not match the experimental frame; model must be placed".into()
}

fn mismatch_without_source_reason(_: &Context, _: &EngineConfig) -> String {
    "Model unit cell does not match the data and no search model is available".into()
}

fn probe_reason(_: &Context, _: &EngineConfig) -> String {
    "Model placement unknown; probing fit before refinement".into()
}

fn mr_sad_reason(_: &Context, _: &EngineConfig) -> String {
    "Model placed by phaser and anomalous signal present; MR-SAD phasing".into()
}

fn build_reason(_: &Context, _: &EngineConfig) -> String {
    "Experimental phases available without a model; build into density".into()
}

fn prefers_ep_reason(_: &Context, _: &EngineConfig) -> String {
    "Experimental phasing requested".into()
}

fn mr_reason(_: &Context, _: &EngineConfig) -> String {
    "Search model available but not placed; molecular replacement".into()
}

fn anomalous_reason(ctx: &Context, _: &EngineConfig) -> String {
    match ctx.number("anomalous_measurability") {
        Some(m) => format!("Anomalous signal (measurability {m:.3}) and sequence available; experimental phasing"),
        None => "Anomalous signal and sequence available; experimental phasing".into(),
    }
}

fn obtain_reason(_: &Context, _: &EngineConfig) -> String {
    "No placed model and no model to place; obtain a starting model".into()
}

fn combine_reason(_: &Context, _: &EngineConfig) -> String {
    "Fitted ligand not yet combined with the model".into()
}

fn unrefined_reason(_: &Context, _: &EngineConfig) -> String {
    "Model placed; no refinement yet".into()
}

fn ligand_reason(_: &Context, _: &EngineConfig) -> String {
    "Ligand fitting pending; staying in refinement".into()
}

fn validate_reason(_: &Context, _: &EngineConfig) -> String {
    "Refinement finished; validation outstanding".into()
}

fn complete_reason(_: &Context, _: &EngineConfig) -> String {
    "Refinement finished and model validated".into()
}

#[rustfmt::skip]
static XRAY_GUARDS: [PhaseGuard; 16] = [
    PhaseGuard { name: "analyze", phase: Phase::Analyze, applies: xray_analyze, reason: xray_analyze_reason },
    PhaseGuard { name: "cell_mismatch", phase: Phase::MolecularReplacement, applies: xray_mismatch, reason: mismatch_reason },
    PhaseGuard { name: "cell_mismatch_no_source", phase: Phase::ObtainModel, applies: xray_mismatch_without_source, reason: mismatch_without_source_reason },
    PhaseGuard { name: "probe_pending", phase: Phase::ProbePlacement, applies: probe_pending, reason: probe_reason },
    PhaseGuard { name: "mr_sad", phase: Phase::ExperimentalPhasing, applies: mr_sad, reason: mr_sad_reason },
    PhaseGuard { name: "experimental_phases", phase: Phase::BuildFromPhases, applies: experimental_phases_without_model, reason: build_reason },
    PhaseGuard { name: "prefer_experimental_phasing", phase: Phase::ExperimentalPhasing, applies: prefers_experimental_phasing, reason: prefers_ep_reason },
    PhaseGuard { name: "unplaced_model", phase: Phase::MolecularReplacement, applies: unplaced_model_source, reason: mr_reason },
    PhaseGuard { name: "anomalous_signal", phase: Phase::ExperimentalPhasing, applies: anomalous_with_sequence, reason: anomalous_reason },
    PhaseGuard { name: "nothing_placed", phase: Phase::ObtainModel, applies: nothing_placed, reason: obtain_reason },
    PhaseGuard { name: "combine_ligand", phase: Phase::CombineLigand, applies: ligand_not_combined, reason: combine_reason },
    PhaseGuard { name: "unrefined", phase: Phase::Refine, applies: unrefined, reason: unrefined_reason },
    PhaseGuard { name: "ligand_pending", phase: Phase::Refine, applies: ligand_pending, reason: ligand_reason },
    PhaseGuard { name: "below_target", phase: Phase::Refine, applies: below_target, reason: target_reason },
    PhaseGuard { name: "validation", phase: Phase::Validate, applies: validation_outstanding, reason: validate_reason },
    PhaseGuard { name: "complete", phase: Phase::Complete, applies: always, reason: complete_reason },
];

// ---------------------------------------------------------------------------
// Cryo-EM
// ---------------------------------------------------------------------------

fn cryoem_analyze(ctx: &Context, _: &EngineConfig) -> bool {
    !ctx.flag("mtriage_done")
}

/// Half-maps alone always need density modification, placed model or not:
/// every refinement and docking program needs a full map.
fn map_not_optimized(ctx: &Context, _: &EngineConfig) -> bool {
    if half_maps_only(ctx) && !ctx.flag("resolve_cryo_em_done") {
        return true;
    }
    !ctx.flag("has_optimized_map")
        && !ctx.flag("resolve_cryo_em_done")
        && !ctx.flag("map_sharpening_done")
        && !placed(ctx)
}

fn cryoem_mismatch(ctx: &Context, _: &EngineConfig) -> bool {
    definitive_mismatch(ctx)
}

fn unrefined_in_map(ctx: &Context, _: &EngineConfig) -> bool {
    ctx.count("rsr_count") == 0
}

fn cryoem_analyze_reason(_: &Context, _: &EngineConfig) -> String {
    "Map not yet characterized; run mtriage".into()
}

fn optimize_reason(ctx: &Context, _: &EngineConfig) -> String {
    if ctx.flag("has_half_map") && !ctx.flag("has_full_map") {
        "Only half-maps available; density-modify to obtain a full map".into()
    } else {
        "Map not yet optimized".into()
    }
}

fn dock_reason(_: &Context, _: &EngineConfig) -> String {
    "Model available but not placed in the map; dock it".into()
}

fn ready_reason(_: &Context, _: &EngineConfig) -> String {
    "Model placed in the map; start real-space refinement".into()
}

#[rustfmt::skip]
static CRYOEM_GUARDS: [PhaseGuard; 11] = [
    PhaseGuard { name: "analyze", phase: Phase::Analyze, applies: cryoem_analyze, reason: cryoem_analyze_reason },
    PhaseGuard { name: "optimize_map", phase: Phase::OptimizeMap, applies: map_not_optimized, reason: optimize_reason },
    PhaseGuard { name: "cell_mismatch", phase: Phase::DockModel, applies: cryoem_mismatch, reason: mismatch_reason },
    PhaseGuard { name: "probe_pending", phase: Phase::ProbePlacement, applies: probe_pending, reason: probe_reason },
    PhaseGuard { name: "unplaced_model", phase: Phase::DockModel, applies: unplaced_model_source, reason: dock_reason },
    PhaseGuard { name: "nothing_placed", phase: Phase::ObtainModel, applies: nothing_placed, reason: obtain_reason },
    PhaseGuard { name: "unrefined", phase: Phase::ReadyToRefine, applies: unrefined_in_map, reason: ready_reason },
    PhaseGuard { name: "ligand_pending", phase: Phase::Refine, applies: ligand_pending, reason: ligand_reason },
    PhaseGuard { name: "below_target", phase: Phase::Refine, applies: below_target, reason: target_reason },
    PhaseGuard { name: "validation", phase: Phase::Validate, applies: validation_outstanding, reason: validate_reason },
    PhaseGuard { name: "complete", phase: Phase::Complete, applies: always, reason: complete_reason },
];

/// The guard list for an experiment, in priority order.
pub fn guards(experiment: ExperimentType) -> &'static [PhaseGuard] {
    match experiment {
        ExperimentType::Xray => &XRAY_GUARDS,
        ExperimentType::Cryoem => &CRYOEM_GUARDS,
    }
}

/// First matching guard for the context's experiment type.
pub fn matching_guard(ctx: &Context, config: &EngineConfig) -> &'static PhaseGuard {
    let list = guards(ctx.experiment_type());
    list.iter()
        .find(|guard| guard.applies(ctx, config))
        .unwrap_or(&list[list.len() - 1])
}

/// Map a context to the current phase. Descriptions and goals come from the
/// schema's phase table.
pub fn detect_phase(ctx: &Context, schema: &WorkflowSchema, config: &EngineConfig) -> PhaseResult {
    let experiment = ctx.experiment_type();
    let guard = matching_guard(ctx, config);
    debug!(guard = guard.name, experiment = %experiment, "phase guard matched");

    let spec = schema.phase_spec(experiment, guard.phase);
    let result = PhaseResult {
        phase: guard.phase,
        description: spec
            .map(|s| s.description.clone())
            .filter(|d| !d.is_empty())
            .unwrap_or_else(|| guard.phase.as_str().to_string()),
        goal: spec.map(|s| s.goal.clone()).unwrap_or_default(),
        reason: guard.reason(ctx, config),
    };
    info!(phase = %result.phase, reason = result.reason.as_str(), "phase detected");
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(experiment: &str, flags: &[&str]) -> Context {
        let mut ctx = Context::new();
        ctx.set("experiment_type", experiment);
        for flag in flags {
            ctx.set(*flag, true);
        }
        ctx
    }

    fn phase_of(ctx: &Context) -> Phase {
        let schema = WorkflowSchema::builtin().unwrap();
        detect_phase(ctx, &schema, &EngineConfig::default()).phase
    }

    #[test]
    fn xray_guard_table() {
        let cases: &[(&[&str], Phase)] = &[
            (&[], Phase::Analyze),
            (&["xtriage_done", "has_predicted_model"], Phase::MolecularReplacement),
            (&["xtriage_done", "has_sequence"], Phase::ObtainModel),
            (&["xtriage_done", "has_model", "placement_uncertain"], Phase::ProbePlacement),
            (
                &[
                    "xtriage_done",
                    "phaser_done",
                    "has_placed_model",
                    "has_anomalous",
                    "has_sequence",
                ],
                Phase::ExperimentalPhasing,
            ),
            (
                &["xtriage_done", "phaser_done", "has_placed_model", "has_anomalous"],
                Phase::Refine,
            ),
            (&["xtriage_done", "autosol_done", "has_sequence"], Phase::BuildFromPhases),
            (&["xtriage_done", "has_anomalous", "has_sequence"], Phase::ExperimentalPhasing),
            (
                &["xtriage_done", "has_placed_model", "has_ligand_fit_output"],
                Phase::CombineLigand,
            ),
            (&["xtriage_done", "has_placed_model"], Phase::Refine),
        ];
        for (flags, expected) in cases {
            assert_eq!(phase_of(&ctx("xray", flags)), *expected, "flags: {flags:?}");
        }
    }

    #[test]
    fn xray_refine_validate_complete() {
        let mut c = ctx("xray", &["xtriage_done", "has_placed_model", "refine_done"]);
        c.set("refine_cycles", 1);
        c.set("r_free", 0.38);
        assert_eq!(phase_of(&c), Phase::Refine);

        c.set("refine_cycles", 3);
        assert_eq!(phase_of(&c), Phase::Validate);

        c.set("validation_done", true);
        assert_eq!(phase_of(&c), Phase::Complete);
    }

    #[test]
    fn predicted_model_goes_to_molecular_replacement() {
        let mut c = ctx("xray", &["xtriage_done", "has_predicted_model"]);
        c.set("has_placed_model", false);
        c.set("has_processed_model", false);
        assert_eq!(phase_of(&c), Phase::MolecularReplacement);
    }

    #[test]
    fn mismatch_preempts_probe() {
        let c = ctx(
            "xray",
            &["xtriage_done", "has_model", "cell_mismatch", "placement_uncertain"],
        );
        assert_eq!(phase_of(&c), Phase::MolecularReplacement);
    }

    #[test]
    fn experimental_phasing_preference() {
        let c = ctx(
            "xray",
            &["xtriage_done", "has_search_model", "use_experimental_phasing"],
        );
        assert_eq!(phase_of(&c), Phase::ExperimentalPhasing);
    }

    #[test]
    fn pending_ligand_keeps_refining() {
        let mut c = ctx(
            "xray",
            &["xtriage_done", "has_placed_model", "wants_ligand_fit", "has_ligand"],
        );
        c.set("refine_cycles", 3);
        c.set("r_free", 0.30);
        assert_eq!(phase_of(&c), Phase::Refine);
        let schema = WorkflowSchema::builtin().unwrap();
        let result = detect_phase(&c, &schema, &EngineConfig::default());
        assert!(result.reason.contains("Ligand"));
    }

    #[test]
    fn cryoem_guard_table() {
        let cases: &[(&[&str], Phase)] = &[
            (&[], Phase::Analyze),
            (&["mtriage_done", "has_half_map"], Phase::OptimizeMap),
            (&["mtriage_done", "has_half_map", "has_placed_model"], Phase::OptimizeMap),
            (
                &["mtriage_done", "has_half_map", "has_placed_model", "resolve_cryo_em_done"],
                Phase::ReadyToRefine,
            ),
            (&["mtriage_done", "resolve_cryo_em_done", "has_model"], Phase::DockModel),
            (
                &["mtriage_done", "has_optimized_map", "has_model", "placement_uncertain"],
                Phase::ProbePlacement,
            ),
            (&["mtriage_done", "has_optimized_map", "has_sequence"], Phase::ObtainModel),
            (&["mtriage_done", "has_placed_model"], Phase::ReadyToRefine),
        ];
        for (flags, expected) in cases {
            assert_eq!(phase_of(&ctx("cryoem", flags)), *expected, "flags: {flags:?}");
        }
    }

    #[test]
    fn cryoem_mismatch_docks_despite_directive() {
        let mut c = ctx(
            "cryoem",
            &["mtriage_done", "resolve_cryo_em_done", "cell_mismatch", "has_model"],
        );
        c.set("has_placed_model_from_history", false);
        c.set("model_is_placed_directive", true);
        c.set("has_placed_model", true);
        assert_eq!(phase_of(&c), Phase::DockModel);
    }

    #[test]
    fn phase_info_uses_schema_text() {
        let schema = WorkflowSchema::builtin().unwrap();
        let result = detect_phase(&ctx("xray", &[]), &schema, &EngineConfig::default());
        assert_eq!(result.description, "Assess data quality");
        assert!(!result.goal.is_empty());
    }

    #[test]
    fn every_list_ends_with_an_unconditional_guard() {
        for experiment in [ExperimentType::Xray, ExperimentType::Cryoem] {
            let last = guards(experiment).last().unwrap();
            assert_eq!(last.phase, Phase::Complete);
            assert!(last.applies(&Context::new(), &EngineConfig::default()));
        }
    }
}
