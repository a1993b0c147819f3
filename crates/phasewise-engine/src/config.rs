//! Engine configuration, threaded explicitly through every decision stage.

use std::path::Path;

use phasewise_types::Result;
use serde::{Deserialize, Serialize};

use crate::condition::UnknownPolicy;

/// Tunables for one engine instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Unknown condition keywords become errors instead of being treated as satisfied.
    pub strict_conditions: bool,
    /// Relative difference above which two unit-cell parameters disagree.
    pub cell_tolerance: f64,
    /// Refinement cycles after which further refinement is considered a plateau.
    pub plateau_refine_cycles: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            strict_conditions: false,
            cell_tolerance: 0.05,
            plateau_refine_cycles: 3,
        }
    }
}

impl EngineConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let source = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&source)?)
    }

    pub fn with_strict_conditions(mut self, strict: bool) -> Self {
        self.strict_conditions = strict;
        self
    }

    pub fn unknown_policy(&self) -> UnknownPolicy {
        UnknownPolicy::from_strict(self.strict_conditions)
    }
}
