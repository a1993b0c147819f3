//! Workflow decision engine for X-ray and cryo-EM structure-solution pipelines.
//!
//! This crate decides, once per cycle, which pipeline phase a project is in
//! and which programs may run next: context assembly, three-tier placement
//! detection, ordered-guard phase machines, declarative program selection,
//! directive rewriting, and the 5 built-in schema lint rules.

pub mod cells;
pub mod condition;
pub mod config;
pub mod context;
pub mod directives;
pub mod engine;
pub mod history;
pub mod phase;
pub mod placement;
pub mod priority;
pub mod schema;
pub mod selector;
pub mod target;
pub mod validation;

pub use cells::{CellReader, FileCellReader};
pub use condition::{evaluate_conditions, parse_comparison, Comparison, Condition, Evaluation, UnknownPolicy};
pub use config::EngineConfig;
pub use context::{merge_flags, ContextBuilder};
pub use directives::{apply_directives, DirectiveInput, DirectiveOutcome};
pub use engine::WorkflowEngine;
pub use history::analyze_history;
pub use phase::{detect_phase, PhaseGuard};
pub use placement::{infer_from_constraints, PlacementDetector};
pub use priority::prioritize;
pub use schema::{PhaseProgram, PhaseSpec, ProgramCategory, ProgramSpec, WorkflowSchema};
pub use selector::{ProgramSelector, Selection};
pub use target::{assess_target, is_at_target, TargetAssessment};
pub use validation::{validate, validate_or_raise, Diagnostic, LintRule, Severity};
