//! Decision engine façade: one full pass per cycle.
//!
//! Context → phase → selection → directives → priorities → assembled
//! [`WorkflowState`]. The engine holds no state between cycles.

use std::borrow::Cow;

use phasewise_types::{
    categories, Context, CycleInputs, Directives, FileSet, HistoryInfo, HistoryRecord, Phase,
    PhaseResult, Result, WorkflowState, STOP,
};
use tracing::info;

use crate::cells::{CellReader, FileCellReader};
use crate::config::EngineConfig;
use crate::context::ContextBuilder;
use crate::directives::{apply_directives, DirectiveInput, DirectiveOutcome};
use crate::history::analyze_history;
use crate::phase::detect_phase;
use crate::placement::source;
use crate::priority::prioritize;
use crate::schema::WorkflowSchema;
use crate::selector::{ProgramSelector, Selection};
use crate::target::{assess_target, TargetAssessment};

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// The decision engine. Owns the schema, configuration and cell reader.
pub struct WorkflowEngine {
    schema: WorkflowSchema,
    config: EngineConfig,
    cells: Box<dyn CellReader>,
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// When placement rests on a directive or probe and the only models are
/// generic, report those models as positioned too.
fn promote_files<'f>(files: &'f FileSet, ctx: &Context) -> Cow<'f, FileSet> {
    let claimed = matches!(
        ctx.text("placement_source"),
        Some(source::DIRECTIVE | source::CONSTRAINTS | source::PROGRAM_REQUEST | source::PROBE)
    );
    let has_positioned = categories::POSITIONED_SUBCATEGORIES
        .iter()
        .any(|c| files.has(c));
    if !(ctx.flag("has_placed_model") && claimed && files.has(categories::MODEL) && !has_positioned)
    {
        return Cow::Borrowed(files);
    }
    let mut promoted = files.clone();
    for path in files.paths(categories::MODEL) {
        promoted.insert(categories::POSITIONED, path);
    }
    Cow::Owned(promoted)
}

fn stuck_hint(selection: &Selection) -> String {
    if selection.excluded.is_empty() {
        return "no program is declared for this phase; check the schema".into();
    }
    let blocked: Vec<String> = selection
        .excluded
        .iter()
        .map(|(program, why)| format!("{program}: {why}"))
        .collect();
    format!(
        "blocked: {}. Supply the missing inputs or adjust directives",
        blocked.join("; ")
    )
}

// ---------------------------------------------------------------------------
// WorkflowEngine
// ---------------------------------------------------------------------------

impl WorkflowEngine {
    /// Create an engine that reads unit cells from the local filesystem.
    pub fn new(schema: WorkflowSchema, config: EngineConfig) -> Self {
        Self {
            schema,
            config,
            cells: Box::new(FileCellReader),
        }
    }

    /// Create an engine over the built-in schema.
    pub fn with_builtin_schema(config: EngineConfig) -> Result<Self> {
        Ok(Self::new(WorkflowSchema::builtin()?, config))
    }

    pub fn with_cell_reader(mut self, cells: impl CellReader + 'static) -> Self {
        self.cells = Box::new(cells);
        self
    }

    pub fn schema(&self) -> &WorkflowSchema {
        &self.schema
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn selector(&self) -> ProgramSelector<'_> {
        ProgramSelector::new(&self.schema, self.config.unknown_policy())
    }

    /// Aggregate raw execution records.
    pub fn history_from_records(&self, records: &[HistoryRecord]) -> HistoryInfo {
        analyze_history(records, &self.schema)
    }

    pub fn build_context(&self, inputs: &CycleInputs) -> Context {
        ContextBuilder::new(&self.schema, &self.config, self.cells.as_ref()).build(inputs)
    }

    pub fn detect_phase(&self, ctx: &Context) -> PhaseResult {
        detect_phase(ctx, &self.schema, &self.config)
    }

    pub fn assess_target(&self, ctx: &Context) -> TargetAssessment {
        assess_target(ctx, &self.config)
    }

    /// Eligible programs for `phase`, before directives. Never empty.
    pub fn valid_programs(&self, phase: Phase, ctx: &Context) -> Result<Selection> {
        self.selector().select(phase, ctx)
    }

    pub fn apply_directives(
        &self,
        programs: Vec<String>,
        directives: &Directives,
        ctx: &Context,
        phase: Phase,
    ) -> Result<DirectiveOutcome> {
        let selector = self.selector();
        let input = DirectiveInput {
            directives,
            ctx,
            phase,
            selector: &selector,
        };
        apply_directives(programs, &input)
    }

    /// Unmet-condition explanation for `program`, or `None` when it could run.
    pub fn explain_unavailable(&self, program: &str, ctx: &Context) -> Result<Option<String>> {
        self.selector().explain_unavailable(program, ctx)
    }

    /// Run one full decision cycle.
    pub fn workflow_state(&self, inputs: &CycleInputs) -> Result<WorkflowState> {
        let ctx = self.build_context(inputs);
        let phase_info = self.detect_phase(&ctx);
        let selection = self.valid_programs(phase_info.phase, &ctx)?;
        let outcome = self.apply_directives(
            selection.programs.clone(),
            &inputs.directives,
            &ctx,
            phase_info.phase,
        )?;
        let program_priorities =
            prioritize(&outcome.programs, &ctx, &self.schema, self.config.unknown_policy())?;

        let declares_stop = self
            .schema
            .phase_spec(ctx.experiment_type(), phase_info.phase)
            .is_some_and(|spec| spec.programs.iter().any(|p| p.program == STOP));
        let stop_only = outcome.programs.len() == 1 && outcome.programs[0] == STOP;
        let reason = if outcome.stopped_by_directive {
            outcome
                .notes
                .iter()
                .rev()
                .find(|n| n.contains("stopping"))
                .cloned()
                .unwrap_or_else(|| phase_info.reason.clone())
        } else if stop_only && !phase_info.phase.is_terminal() && !declares_stop {
            format!("STUCK: {}; {}", phase_info.reason, stuck_hint(&selection))
        } else {
            phase_info.reason.clone()
        };

        let mut unavailable_explanations = selection.excluded;
        unavailable_explanations.retain(|program, _| !outcome.programs.contains(program));

        let resolution = ctx.number("resolution").or(inputs.session.resolution);
        let categorized_files = promote_files(&inputs.files, &ctx).into_owned();

        info!(
            phase = %phase_info.phase,
            programs = ?outcome.programs,
            forced = ?outcome.forced_program,
            "workflow decision"
        );

        Ok(WorkflowState {
            state: phase_info.phase.as_str().to_string(),
            experiment_type: ctx.experiment_type(),
            valid_programs: outcome.programs,
            program_priorities,
            forced_program: outcome.forced_program,
            reason,
            phase_info,
            context: ctx,
            resolution,
            unavailable_explanations,
            categorized_files,
            directive_notes: outcome.notes,
        })
    }
}
