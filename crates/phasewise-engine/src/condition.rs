//! Declarative eligibility conditions: parser and evaluator.
//!
//! A condition is a single-key JSON object:
//! ```text
//! {"has": "sequence"}                 context flag has_sequence is true
//! {"has_any": ["model", "docked"]}    at least one has_<x> flag is true
//! {"not_has": "processed_model"}      has_processed_model is false
//! {"not_done": "phaser"}              phaser's completion flag is not set
//! {"r_free": "< 0.35"}                metric comparison (<, <=, >, >=, ==, !=)
//! ```
//! A program's condition list is a conjunction. Any other keyword parses as
//! [`Condition::Unknown`], which evaluates as satisfied (fail-open) unless the
//! engine runs in strict mode, where it is an error (fail-closed).

use std::fmt;

use phasewise_types::{Context, Result, WorkflowError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::error;

/// One declarative condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Map<String, Value>", into = "Map<String, Value>")]
pub enum Condition {
    Has(String),
    HasAny(Vec<String>),
    NotHas(String),
    NotDone(String),
    Metric {
        metric: String,
        op: Comparison,
        threshold: f64,
    },
    /// A keyword the engine does not understand.
    Unknown { keyword: String, raw: Value },
}

/// Comparison operator for metric conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    NotEq,
}

impl Comparison {
    fn symbol(self) -> &'static str {
        match self {
            Comparison::Lt => "<",
            Comparison::Le => "<=",
            Comparison::Gt => ">",
            Comparison::Ge => ">=",
            Comparison::Eq => "==",
            Comparison::NotEq => "!=",
        }
    }

    pub fn holds(self, actual: f64, threshold: f64) -> bool {
        match self {
            Comparison::Lt => actual < threshold,
            Comparison::Le => actual <= threshold,
            Comparison::Gt => actual > threshold,
            Comparison::Ge => actual >= threshold,
            Comparison::Eq => (actual - threshold).abs() < f64::EPSILON,
            Comparison::NotEq => (actual - threshold).abs() >= f64::EPSILON,
        }
    }
}

impl fmt::Display for Comparison {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

/// Parse `"< 0.35"`, `">=1"`, `"== 2"` into an operator and threshold.
pub fn parse_comparison(input: &str) -> Option<(Comparison, f64)> {
    let trimmed = input.trim();
    // Two-character operators first so "<=" is not read as "<".
    let (op, rest) = [
        ("<=", Comparison::Le),
        (">=", Comparison::Ge),
        ("==", Comparison::Eq),
        ("!=", Comparison::NotEq),
        ("<", Comparison::Lt),
        (">", Comparison::Gt),
    ]
    .iter()
    .find_map(|&(sym, op)| trimmed.strip_prefix(sym).map(|rest| (op, rest)))?;
    let threshold: f64 = rest.trim().parse().ok()?;
    threshold.is_finite().then_some((op, threshold))
}

fn expect_string(keyword: &str, value: &Value) -> std::result::Result<String, String> {
    value
        .as_str()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| format!("'{keyword}' expects a non-empty string, got {value}"))
}

impl TryFrom<Map<String, Value>> for Condition {
    type Error = String;

    fn try_from(map: Map<String, Value>) -> std::result::Result<Self, Self::Error> {
        if map.len() != 1 {
            return Err(format!(
                "a condition must have exactly one key, found {}",
                map.len()
            ));
        }
        let Some((keyword, value)) = map.into_iter().next() else {
            return Err("empty condition".into());
        };
        let condition = match keyword.as_str() {
            "has" => Condition::Has(expect_string(&keyword, &value)?),
            "not_has" => Condition::NotHas(expect_string(&keyword, &value)?),
            "not_done" => Condition::NotDone(expect_string(&keyword, &value)?),
            "has_any" => {
                let items = value
                    .as_array()
                    .ok_or_else(|| format!("'has_any' expects a list, got {value}"))?;
                let names = items
                    .iter()
                    .map(|v| expect_string("has_any", v))
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                if names.is_empty() {
                    return Err("'has_any' needs at least one entry".into());
                }
                Condition::HasAny(names)
            }
            _ => match value.as_str().and_then(parse_comparison) {
                Some((op, threshold)) => Condition::Metric {
                    metric: keyword,
                    op,
                    threshold,
                },
                None => Condition::Unknown { keyword, raw: value },
            },
        };
        Ok(condition)
    }
}

impl From<Condition> for Map<String, Value> {
    fn from(condition: Condition) -> Self {
        let (key, value) = match condition {
            Condition::Has(name) => ("has".to_string(), Value::String(name)),
            Condition::NotHas(name) => ("not_has".to_string(), Value::String(name)),
            Condition::NotDone(name) => ("not_done".to_string(), Value::String(name)),
            Condition::HasAny(names) => (
                "has_any".to_string(),
                Value::Array(names.into_iter().map(Value::String).collect()),
            ),
            Condition::Metric {
                metric,
                op,
                threshold,
            } => (metric, Value::String(format!("{op} {threshold}"))),
            Condition::Unknown { keyword, raw } => (keyword, raw),
        };
        let mut map = Map::new();
        map.insert(key, value);
        map
    }
}

impl Condition {
    /// The keyword this condition was written with.
    pub fn keyword(&self) -> &str {
        match self {
            Condition::Has(_) => "has",
            Condition::HasAny(_) => "has_any",
            Condition::NotHas(_) => "not_has",
            Condition::NotDone(_) => "not_done",
            Condition::Metric { metric, .. } => metric,
            Condition::Unknown { keyword, .. } => keyword,
        }
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, Condition::Unknown { .. })
    }
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

/// How unknown keywords are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnknownPolicy {
    /// Log loudly and treat as satisfied.
    FailOpen,
    /// Return [`WorkflowError::UnknownCondition`].
    FailClosed,
}

impl UnknownPolicy {
    pub fn from_strict(strict: bool) -> Self {
        if strict {
            UnknownPolicy::FailClosed
        } else {
            UnknownPolicy::FailOpen
        }
    }
}

/// Outcome of evaluating a conjunction of conditions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Evaluation {
    /// One explanation per unmet condition, in declaration order.
    pub unmet: Vec<String>,
}

impl Evaluation {
    pub fn satisfied(&self) -> bool {
        self.unmet.is_empty()
    }

    /// Joined explanation, or `None` when everything holds.
    pub fn explanation(&self) -> Option<String> {
        (!self.unmet.is_empty()).then(|| self.unmet.join("; "))
    }
}

/// Resolve `has: x` to a context flag: `has_x` when the context carries it,
/// otherwise `x` itself (e.g. `strong_anomalous`).
pub fn has_signal(ctx: &Context, name: &str) -> bool {
    let name = name.strip_prefix("has_").unwrap_or(name);
    let key = format!("has_{name}");
    if ctx.contains(&key) {
        ctx.flag(&key)
    } else {
        ctx.flag(name)
    }
}

/// Evaluate `conditions` for `program` against `ctx`.
///
/// `done_flag` maps a `not_done` target (short or full program name) to the
/// context key holding its completion flag.
pub fn evaluate_conditions(
    conditions: &[Condition],
    ctx: &Context,
    program: &str,
    policy: UnknownPolicy,
    done_flag: &dyn Fn(&str) -> String,
) -> Result<Evaluation> {
    let mut evaluation = Evaluation::default();
    for condition in conditions {
        match condition {
            Condition::Has(name) => {
                if !has_signal(ctx, name) {
                    evaluation.unmet.push(format!("requires {name}"));
                }
            }
            Condition::HasAny(names) => {
                if !names.iter().any(|n| has_signal(ctx, n)) {
                    evaluation
                        .unmet
                        .push(format!("requires one of: {}", names.join(", ")));
                }
            }
            Condition::NotHas(name) => {
                if has_signal(ctx, name) {
                    evaluation
                        .unmet
                        .push(format!("not applicable when {name} is present"));
                }
            }
            Condition::NotDone(target) => {
                let flag = done_flag(target);
                if ctx.flag(&flag) {
                    evaluation
                        .unmet
                        .push(format!("{target} already completed ({flag})"));
                }
            }
            Condition::Metric {
                metric,
                op,
                threshold,
            } => match ctx.number(metric) {
                Some(actual) if op.holds(actual, *threshold) => {}
                Some(actual) => evaluation.unmet.push(format!(
                    "requires {metric} {op} {threshold} (current {actual})"
                )),
                None => evaluation.unmet.push(format!(
                    "requires {metric} {op} {threshold} ({metric} unknown)"
                )),
            },
            Condition::Unknown { keyword, .. } => match policy {
                UnknownPolicy::FailOpen => {
                    error!(
                        program,
                        keyword = keyword.as_str(),
                        "unknown condition keyword; treating as satisfied"
                    );
                }
                UnknownPolicy::FailClosed => {
                    return Err(WorkflowError::UnknownCondition {
                        keyword: keyword.clone(),
                        program: program.to_string(),
                    });
                }
            },
        }
    }
    Ok(evaluation)
}
