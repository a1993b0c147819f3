//! Program selection for a detected phase.
//!
//! Candidates come from the schema's phase table. Guarded candidates are
//! kept only when every condition holds; the survivors then pass through the
//! structural filters below, in order:
//!
//! 1. full-map programs are dropped when only half-maps exist
//! 2. run-once programs whose completion flag is set are dropped
//! 3. standalone autosol is dropped while a search model still awaits phaser
//!    (MR-SAD), unless experimental phasing was explicitly preferred
//! 4. ligand fitting is re-injected when requested and refinement has run

use std::collections::BTreeMap;

use phasewise_types::{Context, Phase, Result, STOP};
use tracing::debug;

use crate::condition::{evaluate_conditions, UnknownPolicy};
use crate::schema::WorkflowSchema;

pub const LIGANDFIT: &str = "phenix.ligandfit";
const AUTOSOL: &str = "phenix.autosol";

/// Eligible programs for one phase plus the reason each dropped candidate
/// was dropped.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Selection {
    pub programs: Vec<String>,
    pub excluded: BTreeMap<String, String>,
}

impl Selection {
    fn stop(excluded: BTreeMap<String, String>) -> Self {
        Self {
            programs: vec![STOP.to_string()],
            excluded,
        }
    }

    fn drop_where(&mut self, reason: impl Fn(&str) -> Option<String>) {
        let excluded = &mut self.excluded;
        self.programs.retain(|program| match reason(program) {
            Some(why) => {
                debug!(program = program.as_str(), reason = why.as_str(), "candidate filtered");
                excluded.insert(program.clone(), why);
                false
            }
            None => true,
        });
    }
}

/// Only half-maps are present: no full, optimized or partial map.
pub fn half_maps_only(ctx: &Context) -> bool {
    ctx.flag("has_half_map")
        && !ctx.flag("has_full_map")
        && !ctx.flag("has_optimized_map")
        && !ctx.flag("has_partial_map")
}

/// A search model plus anomalous signal exist but phaser has not yet placed
/// the model.
pub fn mr_sad_pending(ctx: &Context) -> bool {
    let has_search_model = ["search_model", "processed_model", "predicted_model", "model"]
        .iter()
        .any(|c| ctx.flag(&format!("has_{c}")));
    has_search_model
        && ctx.flag("has_anomalous")
        && !ctx.flag("phaser_done")
        && !ctx.flag("use_experimental_phasing")
}

pub struct ProgramSelector<'a> {
    schema: &'a WorkflowSchema,
    policy: UnknownPolicy,
}

impl<'a> ProgramSelector<'a> {
    pub fn new(schema: &'a WorkflowSchema, policy: UnknownPolicy) -> Self {
        Self { schema, policy }
    }

    pub fn schema(&self) -> &'a WorkflowSchema {
        self.schema
    }

    fn evaluate(
        &self,
        conditions: &[crate::condition::Condition],
        ctx: &Context,
        program: &str,
    ) -> Result<Option<String>> {
        let done_flag = |target: &str| self.schema.done_flag_for(target);
        Ok(evaluate_conditions(conditions, ctx, program, self.policy, &done_flag)?.explanation())
    }

    /// Eligible programs for `phase`. Never empty.
    pub fn select(&self, phase: Phase, ctx: &Context) -> Result<Selection> {
        if phase.is_terminal() {
            return Ok(Selection::stop(BTreeMap::new()));
        }
        let experiment = ctx.experiment_type();
        let Some(spec) = self.schema.phase_spec(experiment, phase) else {
            debug!(phase = %phase, experiment = %experiment, "phase not declared in schema");
            return Ok(Selection::stop(BTreeMap::new()));
        };

        let mut selection = Selection::default();
        for candidate in &spec.programs {
            let program = candidate.program.as_str();
            if program == STOP {
                selection.programs.push(program.to_string());
                continue;
            }
            let why = match self.schema.program(program) {
                None => Some("not in the program registry".to_string()),
                Some(p) if !p.applies_to(experiment) => {
                    Some(format!("not applicable to {experiment} experiments"))
                }
                Some(_) => self.evaluate(&candidate.conditions, ctx, program)?,
            };
            match why {
                Some(why) => {
                    selection.excluded.insert(program.to_string(), why);
                }
                None if !selection.programs.iter().any(|p| p == program) => {
                    selection.programs.push(program.to_string());
                }
                None => {}
            }
        }

        let half_only = half_maps_only(ctx);
        selection.drop_where(|program| {
            let spec = self.schema.program(program)?;
            (half_only && spec.requires_full_map)
                .then(|| "requires a full map; only half-maps available".to_string())
        });
        selection.drop_where(|program| self.exhausted_reason(program, ctx));
        if mr_sad_pending(ctx) {
            selection.drop_where(|program| {
                (program == AUTOSOL)
                    .then(|| "search model and anomalous signal: place with phaser first (MR-SAD)".to_string())
            });
        }
        if matches!(phase, Phase::Refine | Phase::Validate) {
            self.reinject_ligand_fit(&mut selection, ctx)?;
        }

        if selection.programs.is_empty() {
            debug!(phase = %phase, "no eligible programs");
            return Ok(Selection::stop(selection.excluded));
        }
        Ok(selection)
    }

    fn reinject_ligand_fit(&self, selection: &mut Selection, ctx: &Context) -> Result<()> {
        let requested = ctx.flag("wants_ligand_fit") && ctx.count("refine_cycles") >= 1;
        if !requested || selection.programs.iter().any(|p| p == LIGANDFIT) {
            return Ok(());
        }
        if let Some(why) = self.explain_unavailable(LIGANDFIT, ctx)? {
            selection.excluded.insert(LIGANDFIT.to_string(), why);
            return Ok(());
        }
        selection.excluded.remove(LIGANDFIT);
        let at = selection
            .programs
            .iter()
            .position(|p| p == STOP)
            .unwrap_or(selection.programs.len());
        selection.programs.insert(at, LIGANDFIT.to_string());
        debug!("ligand fitting re-injected on request");
        Ok(())
    }

    fn exhausted_reason(&self, program: &str, ctx: &Context) -> Option<String> {
        let spec = self.schema.program(program)?;
        let flag = spec.done_flag.as_deref()?;
        (spec.run_once && ctx.flag(flag)).then(|| format!("already completed ({flag})"))
    }

    /// Why `program` could not run now, or `None` when nothing blocks it.
    /// Accepts short names and aliases.
    pub fn explain_unavailable(&self, program: &str, ctx: &Context) -> Result<Option<String>> {
        let Some(name) = self.schema.resolve_program_name(program) else {
            return Ok(Some(format!("unknown program '{}'", program.trim())));
        };
        if name == STOP {
            return Ok(None);
        }
        let Some(spec) = self.schema.program(&name) else {
            return Ok(Some(format!("unknown program '{name}'")));
        };
        let experiment = ctx.experiment_type();
        if !spec.applies_to(experiment) {
            return Ok(Some(format!("not applicable to {experiment} experiments")));
        }
        if let Some(why) = self.exhausted_reason(&name, ctx) {
            return Ok(Some(why));
        }
        if spec.requires_full_map && half_maps_only(ctx) {
            return Ok(Some("requires a full map; only half-maps available".into()));
        }
        self.evaluate(&spec.requires, ctx, &name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> WorkflowSchema {
        WorkflowSchema::builtin().unwrap()
    }

    fn ctx(experiment: &str, flags: &[&str]) -> Context {
        let mut ctx = Context::new();
        ctx.set("experiment_type", experiment);
        for flag in flags {
            ctx.set(*flag, true);
        }
        ctx
    }

    fn select(phase: Phase, ctx: &Context) -> Selection {
        let schema = schema();
        ProgramSelector::new(&schema, UnknownPolicy::FailOpen)
            .select(phase, ctx)
            .unwrap()
    }

    #[test]
    fn terminal_phase_is_stop() {
        let selection = select(Phase::Complete, &ctx("xray", &[]));
        assert_eq!(selection.programs, vec![STOP]);
    }

    #[test]
    fn empty_result_collapses_to_stop() {
        // the only analyze candidate has already run
        let c = ctx("xray", &["xtriage_done", "has_data_mtz"]);
        let selection = select(Phase::Analyze, &c);
        assert_eq!(selection.programs, vec![STOP]);
        assert!(selection.excluded.contains_key("phenix.xtriage"));
    }

    #[test]
    fn guarded_candidates_need_their_conditions() {
        let c = ctx("xray", &["has_data_mtz", "has_predicted_model"]);
        let selection = select(Phase::MolecularReplacement, &c);
        assert_eq!(
            selection.programs,
            vec!["phenix.process_predicted_model".to_string()]
        );
        assert!(selection.excluded["phenix.phaser"].contains("requires one of"));
    }

    #[test]
    fn run_once_programs_disappear_when_done() {
        let c = ctx(
            "xray",
            &["has_data_mtz", "has_search_model", "phaser_done"],
        );
        let selection = select(Phase::MolecularReplacement, &c);
        assert_eq!(selection.programs, vec![STOP]);
        assert_eq!(selection.excluded["phenix.phaser"], "already completed (phaser_done)");
    }

    #[test]
    fn half_maps_block_full_map_programs() {
        let c = ctx("cryoem", &["has_half_map", "has_map", "has_any_model"]);
        let selection = select(Phase::ReadyToRefine, &c);
        assert!(!selection.programs.contains(&"phenix.real_space_refine".to_string()));
        assert!(selection.excluded["phenix.real_space_refine"].contains("half-maps"));
    }

    #[test]
    fn mr_sad_guard_holds_back_autosol() {
        let c = ctx(
            "xray",
            &["has_data_mtz", "has_search_model", "has_anomalous", "has_sequence"],
        );
        let selection = select(Phase::MolecularReplacement, &c);
        assert_eq!(selection.programs, vec!["phenix.phaser".to_string()]);
        assert!(selection.excluded["phenix.autosol"].contains("MR-SAD"));

        let mut c = c;
        c.set("use_experimental_phasing", true);
        let selection = select(Phase::MolecularReplacement, &c);
        assert!(selection.programs.contains(&"phenix.autosol".to_string()));
    }

    #[test]
    fn ligand_fit_reinjected_on_request() {
        let mut c = ctx(
            "xray",
            &["has_data_mtz", "has_any_model", "has_ligand", "wants_ligand_fit"],
        );
        c.set("refine_cycles", 1);
        c.set("r_free", 0.42);
        let selection = select(Phase::Refine, &c);
        assert_eq!(
            selection.programs,
            vec!["phenix.refine".to_string(), LIGANDFIT.to_string()]
        );

        c.set("ligandfit_done", true);
        let selection = select(Phase::Refine, &c);
        assert!(!selection.programs.contains(&LIGANDFIT.to_string()));
    }

    #[test]
    fn explain_unavailable_reports_first_blocker() {
        let schema = schema();
        let selector = ProgramSelector::new(&schema, UnknownPolicy::FailOpen);
        let c = ctx("xray", &["has_data_mtz"]);
        assert_eq!(
            selector.explain_unavailable("autobuild", &c).unwrap().as_deref(),
            Some("requires sequence")
        );
        assert_eq!(selector.explain_unavailable("xtriage", &c).unwrap(), None);
        assert!(selector
            .explain_unavailable("real_space_refine", &c)
            .unwrap()
            .unwrap()
            .contains("xray"));
        assert!(selector
            .explain_unavailable("coot", &c)
            .unwrap()
            .unwrap()
            .contains("unknown"));
    }

    #[test]
    fn strict_mode_surfaces_unknown_keywords() {
        let json = r#"{
            "programs": {"phenix.xtriage": {"done_flag": "xtriage_done"}},
            "phases": {"xray": [{"phase": "analyze", "programs": [
                {"program": "phenix.xtriage", "conditions": [{"hass": "data_mtz"}]}
            ]}]}
        }"#;
        let schema = WorkflowSchema::from_json(json).unwrap();
        let c = ctx("xray", &[]);
        let lenient = ProgramSelector::new(&schema, UnknownPolicy::FailOpen)
            .select(Phase::Analyze, &c)
            .unwrap();
        assert_eq!(lenient.programs, vec!["phenix.xtriage".to_string()]);
        let strict = ProgramSelector::new(&schema, UnknownPolicy::FailClosed).select(Phase::Analyze, &c);
        assert!(strict.is_err());
    }
}
