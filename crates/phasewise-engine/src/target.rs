//! Refinement target assessment: when further refinement stops paying off,
//! and whether a pending ligand fit still holds the workflow in refinement.

use phasewise_types::{Context, ExperimentType};

use crate::config::EngineConfig;

/// R-free above which further X-ray refinement is considered hopeless.
pub const HOPELESS_R_FREE: f64 = 0.50;
/// R-free gate for ligand fitting the user asked for.
pub const EXPLICIT_LIGAND_R_FREE: f64 = 0.50;
/// R-free gate for ligand fitting triggered by a ligand file alone.
pub const AUTO_LIGAND_R_FREE: f64 = 0.35;

/// Result of the refinement target check.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetAssessment {
    pub at_target: bool,
    pub reason: String,
}

impl TargetAssessment {
    fn reached(reason: impl Into<String>) -> Self {
        Self {
            at_target: true,
            reason: reason.into(),
        }
    }

    fn not_reached(reason: impl Into<String>) -> Self {
        Self {
            at_target: false,
            reason: reason.into(),
        }
    }
}

/// Automatic R-free target by resolution band.
pub fn auto_r_free_target(resolution: f64) -> f64 {
    match resolution {
        r if r < 1.5 => 0.20,
        r if r < 2.0 => 0.22,
        r if r < 2.5 => 0.25,
        r if r < 3.0 => 0.28,
        _ => 0.30,
    }
}

/// Ligand fitting is wanted (explicitly or because a ligand file exists) and
/// neither done nor failed. Ignores how many refinement cycles have run.
/// Without a ligand file ligandfit can never run, so a request alone is not enough.
pub fn ligand_fit_wanted(ctx: &Context) -> bool {
    if !ctx.flag("has_ligand") || ctx.flag("ligandfit_done") || ctx.flag("ligandfit_failed") {
        return false;
    }
    let cryoem = ctx.experiment_type() == ExperimentType::Cryoem;
    let r_free = ctx.number("r_free");
    let explicit = ctx.flag("wants_ligand_fit")
        && (cryoem || r_free.map_or(true, |r| r < EXPLICIT_LIGAND_R_FREE));
    let automatic = cryoem || r_free.is_some_and(|r| r < AUTO_LIGAND_R_FREE);
    explicit || automatic
}

/// Ligand fitting is wanted and its refinement prerequisite (one cycle) holds.
pub fn ligand_fit_pending(ctx: &Context) -> bool {
    ligand_fit_wanted(ctx) && ctx.count("refine_cycles") >= 1
}

/// Whether refinement should stop. Rules apply in order, first match wins.
pub fn assess_target(ctx: &Context, config: &EngineConfig) -> TargetAssessment {
    let cycles = ctx.count("refine_cycles");
    let xray = ctx.experiment_type() == ExperimentType::Xray;
    let r_free = ctx.number("r_free");

    let ligand_requested = ctx.flag("has_ligand")
        && !ctx.flag("ligandfit_done")
        && !ctx.flag("ligandfit_failed");
    if ligand_requested && cycles < 1 {
        return TargetAssessment::not_reached(
            "ligand fitting needs at least one refinement cycle first",
        );
    }

    if xray && cycles >= 1 {
        if let Some(r) = r_free.filter(|r| *r > HOPELESS_R_FREE) {
            return TargetAssessment::reached(format!(
                "R-free {r:.3} above {HOPELESS_R_FREE:.2} after {cycles} cycle(s); refinement will not converge"
            ));
        }
    }

    if let (Some(target), Some(r)) = (ctx.number("r_free_target"), r_free) {
        if r <= target {
            return TargetAssessment::reached(format!("R-free {r:.3} met target {target:.3}"));
        }
    }
    if let (Some(target), Some(cc)) = (ctx.number("map_cc_target"), ctx.number("map_cc")) {
        if cc >= target {
            return TargetAssessment::reached(format!("map CC {cc:.3} met target {target:.3}"));
        }
    }

    if let Some(max) = ctx.number("max_refine_cycles") {
        if f64::from(cycles) >= max {
            return TargetAssessment::reached(format!(
                "reached the maximum of {max} refinement cycle(s)"
            ));
        }
    }

    if cycles >= config.plateau_refine_cycles {
        return TargetAssessment::reached(format!(
            "{cycles} refinement cycles run; treating as plateau"
        ));
    }

    if xray && cycles >= 1 {
        if let (Some(resolution), Some(r)) = (ctx.number("resolution"), r_free) {
            let target = auto_r_free_target(resolution);
            if r <= target {
                return TargetAssessment::reached(format!(
                    "R-free {r:.3} met automatic target {target:.2} for {resolution:.2} Å data"
                ));
            }
        }
    }

    TargetAssessment::not_reached(match r_free {
        Some(r) => format!("R-free {r:.3} after {cycles} cycle(s); continue refining"),
        None => format!("{cycles} refinement cycle(s) run; continue refining"),
    })
}

pub fn is_at_target(ctx: &Context, config: &EngineConfig) -> bool {
    assess_target(ctx, config).at_target
}
