use phasewise_types::{Context, Result};
use tracing::debug;

use crate::condition::{evaluate_conditions, UnknownPolicy};
use crate::schema::WorkflowSchema;

/// Programs in `programs` whose non-empty `priority_when` conditions all
/// hold, in list order.
pub fn prioritize(
    programs: &[String],
    ctx: &Context,
    schema: &WorkflowSchema,
    policy: UnknownPolicy,
) -> Result<Vec<String>> {
    let done_flag = |target: &str| schema.done_flag_for(target);
    let mut prioritized = Vec::new();
    for program in programs {
        let Some(spec) = schema.program(program) else {
            continue;
        };
        if spec.priority_when.is_empty() {
            continue;
        }
        if evaluate_conditions(&spec.priority_when, ctx, program, policy, &done_flag)?.satisfied() {
            debug!(program = program.as_str(), "program prioritized");
            prioritized.push(program.clone());
        }
    }
    Ok(prioritized)
}
