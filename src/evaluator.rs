//! Rule selection for a single reading.
//!
//! Evaluation has no side effects: it reads the active rules and decides
//! which one, if any, the reading triggers. Persisting the outcome is the
//! emitter's job.

use std::fmt;
use std::str::FromStr;

use crate::error::PersistenceError;
use crate::models::{EvaluationResult, Reading, Rule};
use crate::rule_store::RuleStore;

// ---

/// Which rule wins when several matches share the top severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TieBreak {
    /// Highest rule id.
    #[default]
    NewestRule,
    /// Lowest rule id.
    OldestRule,
}

impl fmt::Display for TieBreak {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TieBreak::NewestRule => f.write_str("newest"),
            TieBreak::OldestRule => f.write_str("oldest"),
        }
    }
}

impl FromStr for TieBreak {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "newest" => Ok(TieBreak::NewestRule),
            "oldest" => Ok(TieBreak::OldestRule),
            _ => Err(format!("expected 'newest' or 'oldest', got '{s}'")),
        }
    }
}

pub struct RuleEvaluator {
    rules: RuleStore,
    tie_break: TieBreak,
}

impl RuleEvaluator {
    // ---
    pub fn new(rules: RuleStore, tie_break: TieBreak) -> Self {
        Self { rules, tie_break }
    }

    pub async fn evaluate(&self, reading: &Reading) -> Result<EvaluationResult, PersistenceError> {
        // ---
        let rules = self.rules.active_rules_for(reading.metric_type).await?;
        let result = select_rule(&rules, reading.value, self.tie_break);

        tracing::debug!(
            metric = %reading.metric_type,
            value = reading.value,
            candidates = rules.len(),
            matched = ?result.matched_rule.as_ref().map(|r| r.id),
            "Reading evaluated"
        );
        Ok(result)
    }
}

/// Pick the rule a value triggers from rules sorted by ascending threshold.
///
/// Bands are scanned from the highest `low` down and the first containing
/// band wins. Every satisfied single-threshold rule is a candidate. The
/// overall winner has the highest severity, ties settled by `tie_break`.
pub fn select_rule(rules: &[Rule], value: f64, tie_break: TieBreak) -> EvaluationResult {
    // ---
    let band = rules
        .iter()
        .rev()
        .filter(|r| r.is_band())
        .find(|r| r.matches(value));

    let thresholds = rules
        .iter()
        .filter(|r| !r.is_band())
        .filter(|r| r.matches(value));

    band.into_iter()
        .chain(thresholds)
        .max_by(|a, b| {
            let by_id = match tie_break {
                TieBreak::NewestRule => a.id.cmp(&b.id),
                TieBreak::OldestRule => b.id.cmp(&a.id),
            };
            a.severity.cmp(&b.severity).then(by_id)
        })
        .cloned()
        .map(EvaluationResult::matched)
        .unwrap_or_else(EvaluationResult::no_match)
}
