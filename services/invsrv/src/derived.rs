//! Values computed from other registers after each poll cycle

use serde::{Deserialize, Serialize};

/// Post-processing applied to the weighted sum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Clamp {
    #[default]
    None,
    /// Negative results become zero
    NonNegative,
    /// Negative results are flipped
    Absolute,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Term {
    pub register: String,
    pub coefficient: f64,
}

impl Term {
    pub fn new(register: &str, coefficient: f64) -> Self {
        Self {
            register: register.to_string(),
            coefficient,
        }
    }
}

/// Weighted sum of scaled register values
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DerivedDef {
    pub name: String,
    pub unit: String,
    pub description: String,
    pub terms: Vec<Term>,
    pub clamp: Clamp,
}

impl DerivedDef {
    /// Evaluate with values from `lookup`.
    ///
    /// `None` unless every term has a value, so a derived value never mixes
    /// fresh and stale inputs.
    pub fn evaluate<F>(&self, lookup: F) -> Option<f64>
    where
        F: Fn(&str) -> Option<f64>,
    {
        let mut sum = 0.0;
        for term in &self.terms {
            sum += lookup(&term.register)? * term.coefficient;
        }
        Some(match self.clamp {
            Clamp::None => sum,
            Clamp::NonNegative => sum.max(0.0),
            Clamp::Absolute => sum.abs(),
        })
    }
}
