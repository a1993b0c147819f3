//! User directives applied to a selected program list.
//!
//! Directives run as an ordered pipeline of list-rewriting stages. Each stage
//! takes the current list and returns the rewritten list plus audit notes;
//! stages never touch the context. An inconsistent directive (a program that
//! cannot run yet, an unknown name) is skipped with a note, never raised.

use phasewise_types::{Context, Directives, Phase, Result, STOP};
use tracing::{debug, warn};

use crate::schema::{ProgramCategory, WorkflowSchema};
use crate::selector::{ProgramSelector, LIGANDFIT};
use crate::target::ligand_fit_pending;

const PHASER: &str = "phenix.phaser";
const AUTOSOL: &str = "phenix.autosol";

/// Everything a stage may read.
pub struct DirectiveInput<'a> {
    pub directives: &'a Directives,
    pub ctx: &'a Context,
    pub phase: Phase,
    pub selector: &'a ProgramSelector<'a>,
}

impl<'a> DirectiveInput<'a> {
    fn schema(&self) -> &'a WorkflowSchema {
        self.selector.schema()
    }

    fn normalize(&self, raw: &str) -> String {
        self.schema()
            .resolve_program_name(raw)
            .unwrap_or_else(|| raw.trim().to_string())
    }

    fn is_done(&self, program: &str) -> bool {
        self.ctx.flag(&self.schema().done_flag_for(program))
    }

    fn unavailable(&self, program: &str) -> Result<Option<String>> {
        self.selector.explain_unavailable(program, self.ctx)
    }
}

/// `(rewritten list, audit notes)`.
pub type StageOutput = (Vec<String>, Vec<String>);
pub type Stage = fn(Vec<String>, &DirectiveInput) -> Result<StageOutput>;

/// The stages in application order.
pub const STAGES: [(&str, Stage); 8] = [
    ("refinement_cap", refinement_cap),
    ("skip_validation", skip_validation),
    ("program_settings", program_settings),
    ("explicit_target", explicit_target),
    ("preferences", named_preferences),
    ("start_with", start_with),
    ("skip_programs", remove_skipped),
    ("prefer_programs", prefer_programs),
];

/// Final list after every stage, with the audit trail.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DirectiveOutcome {
    pub programs: Vec<String>,
    pub notes: Vec<String>,
    /// Explicitly requested program that ended up first in the list.
    pub forced_program: Option<String>,
    /// The list collapsed to `STOP` because of a directive.
    pub stopped_by_directive: bool,
}

/// Why the user asked to stop now, if a stop condition is satisfied.
pub fn stop_requested(input: &DirectiveInput) -> Option<String> {
    let stop = &input.directives.stop_conditions;
    if let Some(after) = stop.after_cycle {
        let cycle = input.ctx.count("cycle_number");
        if cycle >= after {
            return Some(format!("after_cycle {after} reached (cycle {cycle}); stopping"));
        }
    }
    let target = input.normalize(stop.after_program.as_deref()?);
    (target != STOP && input.is_done(&target))
        .then(|| format!("after_program {target} has completed; stopping"))
}

/// Run every stage in order.
pub fn apply_directives(programs: Vec<String>, input: &DirectiveInput) -> Result<DirectiveOutcome> {
    let started_stop_only = is_stop_only(&programs);
    let stop_reason = stop_requested(input);
    let mut programs = programs;
    let mut notes = Vec::new();

    for (name, stage) in STAGES {
        let (next, stage_notes) = stage(programs, input)?;
        for note in &stage_notes {
            debug!(stage = name, note = note.as_str(), "directive applied");
        }
        programs = next;
        notes.extend(stage_notes);
        if stop_reason.is_some() && is_stop_only(&programs) {
            break;
        }
    }

    let mut seen = Vec::with_capacity(programs.len());
    for program in programs {
        if !seen.contains(&program) {
            seen.push(program);
        }
    }
    let mut programs = seen;
    if programs.is_empty() {
        notes.push("every program was removed by directives; offering STOP".into());
        programs.push(STOP.to_string());
    }

    let forced_program = forced_program(&programs, input);
    let stopped_by_directive =
        stop_reason.is_some() || (!started_stop_only && is_stop_only(&programs));
    Ok(DirectiveOutcome {
        programs,
        notes,
        forced_program,
        stopped_by_directive,
    })
}

fn forced_program(programs: &[String], input: &DirectiveInput) -> Option<String> {
    let stop = &input.directives.stop_conditions;
    let first = programs.first()?;
    let start_with = stop
        .start_with_program
        .as_deref()
        .map(|p| input.normalize(p))
        .filter(|p| !input.is_done(p));
    let after = stop.after_program.as_deref().map(|p| input.normalize(p));
    start_with
        .into_iter()
        .chain(after)
        .find(|p| p == first && p != STOP)
}

fn is_stop_only(programs: &[String]) -> bool {
    programs.len() == 1 && programs[0] == STOP
}

fn position(programs: &[String], program: &str) -> Option<usize> {
    programs.iter().position(|p| p == program)
}

/// Insert ahead of `STOP` so the sentinel stays last.
fn insert_before_stop(programs: &mut Vec<String>, program: String) {
    let at = position(programs, STOP).unwrap_or(programs.len());
    programs.insert(at, program);
}

fn move_to_front(programs: &mut Vec<String>, program: &str) -> bool {
    match position(programs, program) {
        Some(0) => true,
        Some(pos) => {
            let item = programs.remove(pos);
            programs.insert(0, item);
            true
        }
        None => false,
    }
}

fn ensure_stop(programs: &mut Vec<String>) -> bool {
    if position(programs, STOP).is_some() {
        return false;
    }
    programs.push(STOP.to_string());
    true
}

// ---------------------------------------------------------------------------
// Stages
// ---------------------------------------------------------------------------

/// Cap on refinement cycles: refinement leaves, validation and `STOP` come in.
pub fn refinement_cap(programs: Vec<String>, input: &DirectiveInput) -> Result<StageOutput> {
    let Some(max) = input.directives.stop_conditions.max_refine_cycles else {
        return Ok((programs, vec![]));
    };
    let cycles = input.ctx.count("refine_cycles");
    let refinement_phase = matches!(
        input.phase,
        Phase::Refine | Phase::ReadyToRefine | Phase::Validate
    );
    if cycles < max || !refinement_phase {
        return Ok((programs, vec![]));
    }

    let schema = input.schema();
    let mut notes = Vec::new();
    let before = programs.len();
    let mut programs: Vec<String> = programs
        .into_iter()
        .filter(|p| !schema.has_category(p, ProgramCategory::Refinement))
        .collect();
    if programs.len() < before {
        notes.push(format!(
            "refinement cap of {max} cycle(s) reached after {cycles}; refinement removed"
        ));
    }
    if !input.ctx.flag("validation_done") {
        for program in schema.validation_programs(input.ctx.experiment_type()) {
            if position(&programs, program).is_none() && !schema.is_exhausted(program, input.ctx) {
                insert_before_stop(&mut programs, program.clone());
                notes.push(format!("{program} added for final validation"));
            }
        }
    }
    if ensure_stop(&mut programs) {
        notes.push("STOP offered after refinement cap".into());
    }
    Ok((programs, notes))
}

pub fn skip_validation(mut programs: Vec<String>, input: &DirectiveInput) -> Result<StageOutput> {
    let mut notes = Vec::new();
    if input.directives.stop_conditions.skip_validation && ensure_stop(&mut programs) {
        notes.push("validation may be skipped; STOP offered".into());
    }
    Ok((programs, notes))
}

/// Programs the user configured are offered when they can run.
pub fn program_settings(mut programs: Vec<String>, input: &DirectiveInput) -> Result<StageOutput> {
    let mut notes = Vec::new();
    for key in input.directives.program_settings.keys() {
        let Some(program) = input.schema().resolve_program_name(key) else {
            notes.push(format!("settings for unknown program '{key}' ignored"));
            continue;
        };
        if program == STOP || position(&programs, &program).is_some() {
            continue;
        }
        if input.is_done(&program) {
            notes.push(format!("{program} has settings but already ran; not re-offered"));
            continue;
        }
        match input.unavailable(&program)? {
            None => {
                notes.push(format!("{program} offered because settings were supplied"));
                insert_before_stop(&mut programs, program);
            }
            Some(why) => notes.push(format!("{program} has settings but cannot run yet: {why}")),
        }
    }
    Ok((programs, notes))
}

/// `after_cycle` / `after_program`: stop once satisfied, otherwise run the
/// target first when it can run.
pub fn explicit_target(mut programs: Vec<String>, input: &DirectiveInput) -> Result<StageOutput> {
    if let Some(reason) = stop_requested(input) {
        return Ok((vec![STOP.to_string()], vec![reason]));
    }
    let Some(raw) = input.directives.stop_conditions.after_program.as_deref() else {
        return Ok((programs, vec![]));
    };
    let target = input.normalize(raw);
    if target == STOP {
        return Ok((programs, vec![]));
    }
    let note = if move_to_front(&mut programs, &target) {
        format!("after_program target {target} moved to front")
    } else {
        match input.unavailable(&target)? {
            None => {
                programs.insert(0, target.clone());
                format!("after_program target {target} added")
            }
            Some(why) => {
                warn!(program = target.as_str(), reason = why.as_str(), "after_program suppressed");
                format!("after_program target {target} suppressed: {why}")
            }
        }
    };
    Ok((programs, vec![note]))
}

/// MR-SAD, experimental-phasing and molecular-replacement preferences.
pub fn named_preferences(mut programs: Vec<String>, input: &DirectiveInput) -> Result<StageOutput> {
    let prefs = &input.directives.workflow_preferences;
    let mut notes = Vec::new();
    if prefs.use_mr_sad {
        if !input.ctx.flag("phaser_done") && position(&programs, AUTOSOL).is_some() {
            programs.retain(|p| p != AUTOSOL);
            notes.push("MR-SAD: autosol held back until phaser has placed the model".into());
        }
        if move_to_front(&mut programs, PHASER) {
            notes.push("MR-SAD: phaser first".into());
        }
    }
    if prefs.use_experimental_phasing && move_to_front(&mut programs, AUTOSOL) {
        notes.push("experimental phasing preferred: autosol first".into());
    }
    if prefs.use_molecular_replacement && move_to_front(&mut programs, PHASER) {
        notes.push("molecular replacement preferred: phaser first".into());
    }
    Ok((programs, notes))
}

pub fn start_with(mut programs: Vec<String>, input: &DirectiveInput) -> Result<StageOutput> {
    let Some(raw) = input.directives.stop_conditions.start_with_program.as_deref() else {
        return Ok((programs, vec![]));
    };
    let target = input.normalize(raw);
    if target == STOP {
        return Ok((programs, vec![]));
    }
    if input.is_done(&target) {
        return Ok((
            programs,
            vec![format!("start_with_program {target} already ran; ignored")],
        ));
    }
    let note = if move_to_front(&mut programs, &target) {
        format!("starting with {target}")
    } else {
        match input.unavailable(&target)? {
            None => {
                programs.insert(0, target.clone());
                format!("starting with {target}")
            }
            Some(why) => {
                warn!(program = target.as_str(), reason = why.as_str(), "start_with_program suppressed");
                format!("start_with_program {target} suppressed: {why}")
            }
        }
    };
    Ok((programs, vec![note]))
}

pub fn remove_skipped(mut programs: Vec<String>, input: &DirectiveInput) -> Result<StageOutput> {
    let mut notes = Vec::new();
    for raw in &input.directives.workflow_preferences.skip_programs {
        let program = input.normalize(raw);
        if program == STOP {
            continue;
        }
        if position(&programs, &program).is_some() {
            programs.retain(|p| *p != program);
            notes.push(format!("{program} skipped by request"));
        }
    }
    Ok((programs, notes))
}

/// Reorder by `prefer_programs`; preferences never add programs, except
/// ligand fitting once its prerequisites hold.
pub fn prefer_programs(mut programs: Vec<String>, input: &DirectiveInput) -> Result<StageOutput> {
    let mut notes = Vec::new();

    let late_phase = matches!(
        input.phase,
        Phase::ReadyToRefine | Phase::Refine | Phase::Validate
    );
    if late_phase
        && position(&programs, LIGANDFIT).is_none()
        && ligand_fit_pending(input.ctx)
        && input.unavailable(LIGANDFIT)?.is_none()
    {
        insert_before_stop(&mut programs, LIGANDFIT.to_string());
        notes.push("ligand fitting offered now that refinement has run".into());
    }

    let mut front = Vec::new();
    for raw in &input.directives.workflow_preferences.prefer_programs {
        let program = input.normalize(raw);
        if let Some(pos) = position(&programs, &program) {
            front.push(programs.remove(pos));
        }
    }
    if !front.is_empty() {
        notes.push(format!("preferred order: {}", front.join(", ")));
        front.extend(programs);
        programs = front;
    }
    Ok((programs, notes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::UnknownPolicy;
    use phasewise_types::{StopConditions, WorkflowPreferences};

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

    fn list(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn run(
        programs: &[&str],
        directives: &Directives,
        ctx: &Context,
        phase: Phase,
    ) -> DirectiveOutcome {
        let schema = schema();
        let selector = ProgramSelector::new(&schema, UnknownPolicy::FailOpen);
        let input = DirectiveInput {
            directives,
            ctx,
            phase,
            selector: &selector,
        };
        apply_directives(list(programs), &input).unwrap()
    }

    fn with_stop(stop: StopConditions) -> Directives {
        Directives {
            stop_conditions: stop,
            ..Default::default()
        }
    }

    fn with_prefs(prefs: WorkflowPreferences) -> Directives {
        Directives {
            workflow_preferences: prefs,
            ..Default::default()
        }
    }

    #[test]
    fn no_directives_leave_list_untouched() {
        let outcome = run(
            &["phenix.refine"],
            &Directives::default(),
            &ctx("xray", &[]),
            Phase::Refine,
        );
        assert_eq!(outcome.programs, list(&["phenix.refine"]));
        assert!(outcome.notes.is_empty());
        assert_eq!(outcome.forced_program, None);
    }

    #[test]
    fn refinement_cap_swaps_in_validation() {
        let mut c = ctx("xray", &["has_data_mtz", "has_any_model"]);
        c.set("refine_cycles", 2);
        c.set("validation_done", false);
        let directives = with_stop(StopConditions {
            max_refine_cycles: Some(2),
            ..Default::default()
        });
        let outcome = run(&["phenix.refine"], &directives, &c, Phase::Refine);
        assert_eq!(
            outcome.programs,
            list(&["phenix.molprobity", "phenix.model_vs_data", STOP])
        );
        assert!(!outcome.notes.is_empty());
    }

    #[test]
    fn skip_validation_offers_stop() {
        let directives = with_stop(StopConditions {
            skip_validation: true,
            ..Default::default()
        });
        let outcome = run(
            &["phenix.molprobity"],
            &directives,
            &ctx("xray", &[]),
            Phase::Validate,
        );
        assert_eq!(outcome.programs, list(&["phenix.molprobity", STOP]));
    }

    #[test]
    fn satisfied_after_program_collapses_to_stop() {
        let directives = with_stop(StopConditions {
            after_program: Some("phaser".into()),
            start_with_program: Some("autobuild".into()),
            ..Default::default()
        });
        let c = ctx("xray", &["phaser_done", "has_data_mtz", "has_sequence"]);
        let outcome = run(&["phenix.refine"], &directives, &c, Phase::Refine);
        assert_eq!(outcome.programs, list(&[STOP]));
        assert!(outcome.stopped_by_directive);
    }

    #[test]
    fn after_cycle_collapses_to_stop() {
        let mut c = ctx("xray", &[]);
        c.set("cycle_number", 5);
        let directives = with_stop(StopConditions {
            after_cycle: Some(5),
            ..Default::default()
        });
        let outcome = run(&["phenix.refine"], &directives, &c, Phase::Refine);
        assert_eq!(outcome.programs, list(&[STOP]));
    }

    #[test]
    fn unsatisfied_after_program_moves_to_front_or_is_suppressed() {
        let directives = with_stop(StopConditions {
            after_program: Some("phenix.autosol".into()),
            ..Default::default()
        });
        let c = ctx("xray", &["has_data_mtz", "has_sequence"]);
        let outcome = run(
            &["phenix.phaser", "phenix.autosol"],
            &directives,
            &c,
            Phase::MolecularReplacement,
        );
        assert_eq!(outcome.programs, list(&["phenix.autosol", "phenix.phaser"]));
        assert_eq!(outcome.forced_program.as_deref(), Some("phenix.autosol"));

        let c = ctx("xray", &["has_data_mtz"]);
        let outcome = run(&["phenix.phaser"], &directives, &c, Phase::MolecularReplacement);
        assert_eq!(outcome.programs, list(&["phenix.phaser"]));
        assert!(outcome.notes[0].contains("suppressed"));
    }

    #[test]
    fn mr_sad_holds_autosol_until_phaser() {
        let directives = with_prefs(WorkflowPreferences {
            use_mr_sad: true,
            ..Default::default()
        });
        let outcome = run(
            &["phenix.autosol", "phenix.phaser"],
            &directives,
            &ctx("xray", &[]),
            Phase::MolecularReplacement,
        );
        assert_eq!(outcome.programs, list(&["phenix.phaser"]));
    }

    #[test]
    fn start_with_ignored_once_done() {
        let directives = with_stop(StopConditions {
            start_with_program: Some("refine".into()),
            ..Default::default()
        });
        let c = ctx("xray", &["has_data_mtz", "has_any_model"]);
        let outcome = run(&["phenix.xtriage"], &directives, &c, Phase::Analyze);
        assert_eq!(outcome.programs, list(&["phenix.refine", "phenix.xtriage"]));
        assert_eq!(outcome.forced_program.as_deref(), Some("phenix.refine"));

        let c = ctx("xray", &["has_data_mtz", "has_any_model", "refine_done"]);
        let outcome = run(&["phenix.molprobity"], &directives, &c, Phase::Validate);
        assert_eq!(outcome.programs, list(&["phenix.molprobity"]));
        assert_eq!(outcome.forced_program, None);
    }

    #[test]
    fn skipped_programs_removed_and_empty_becomes_stop() {
        let directives = with_prefs(WorkflowPreferences {
            skip_programs: vec!["xtriage".into()],
            ..Default::default()
        });
        let outcome = run(
            &["phenix.xtriage"],
            &directives,
            &ctx("xray", &[]),
            Phase::Analyze,
        );
        assert_eq!(outcome.programs, list(&[STOP]));
    }

    #[test]
    fn prefer_reorders_but_never_revives_done_programs() {
        let directives = with_prefs(WorkflowPreferences {
            prefer_programs: vec!["model_vs_data".into(), "phaser".into()],
            ..Default::default()
        });
        let c = ctx("xray", &["phaser_done"]);
        let outcome = run(
            &["phenix.molprobity", "phenix.model_vs_data", STOP],
            &directives,
            &c,
            Phase::Validate,
        );
        assert_eq!(
            outcome.programs,
            list(&["phenix.model_vs_data", "phenix.molprobity", STOP])
        );
    }

    #[test]
    fn settings_surface_runnable_programs() {
        let mut directives = Directives::default();
        directives
            .program_settings
            .insert("phenix.polder".into(), serde_json::json!({"selection": "resname ATP"}));
        directives
            .program_settings
            .insert("autobuild".into(), serde_json::json!({}));
        let c = ctx("xray", &["has_data_mtz", "has_ligand_fit_output"]);
        let outcome = run(&["phenix.molprobity", STOP], &directives, &c, Phase::Validate);
        assert_eq!(
            outcome.programs,
            list(&["phenix.molprobity", "phenix.polder", STOP])
        );
        assert!(outcome.notes.iter().any(|n| n.contains("autobuild") && n.contains("sequence")));
    }

    #[test]
    fn ligand_fit_injected_late() {
        let mut c = ctx(
            "cryoem",
            &["has_ligand", "has_any_model", "has_map", "has_full_map"],
        );
        c.set("refine_cycles", 1);
        let outcome = run(
            &["phenix.real_space_refine"],
            &Directives::default(),
            &c,
            Phase::Refine,
        );
        assert_eq!(
            outcome.programs,
            list(&["phenix.real_space_refine", "phenix.ligandfit"])
        );
    }
}
