//! Derives [`HistoryInfo`] from raw execution records.
//!
//! Callers that already aggregate their history can pass `HistoryInfo`
//! directly; this is the reference aggregation.

use phasewise_types::{HistoryInfo, HistoryRecord, ProbeOutcome};
use tracing::debug;

use crate::schema::WorkflowSchema;

const REFINE: &str = "phenix.refine";
const REAL_SPACE_REFINE: &str = "phenix.real_space_refine";
/// Record metric carrying a placement probe verdict.
pub const PROBE_METRIC: &str = "placement_probe";

/// Aggregate records, oldest first.
pub fn analyze_history(records: &[HistoryRecord], schema: &WorkflowSchema) -> HistoryInfo {
    let mut info = HistoryInfo {
        cycle_count: u32::try_from(records.len()).unwrap_or(u32::MAX),
        ..Default::default()
    };

    for record in records {
        let program = schema
            .resolve_program_name(&record.program)
            .unwrap_or_else(|| record.program.trim().to_string());

        if let Some(outcome) = record
            .metrics
            .get(PROBE_METRIC)
            .and_then(|v| v.as_str())
            .and_then(ProbeOutcome::parse)
        {
            debug!(program = program.as_str(), outcome = outcome.as_str(), "placement probe recorded");
            info.placement_probe = Some(outcome);
            info.placement_confirmed_after_probe = false;
        }

        if record.succeeded() {
            match program.as_str() {
                REFINE => info.refine_count += 1,
                REAL_SPACE_REFINE => info.rsr_count += 1,
                _ => {}
            }
            if schema.program(&program).is_some_and(|spec| spec.places_model) {
                info.has_placed_model_from_history = true;
                if info.placement_probe.is_some() {
                    info.placement_confirmed_after_probe = true;
                }
            }
            info.failed_programs.remove(&program);
            info.completed_programs.insert(program.clone());
        } else if record.failed() && !info.completed_programs.contains(&program) {
            info.failed_programs.insert(program.clone());
        }
        info.last_program = Some(program);
    }
    info
}
