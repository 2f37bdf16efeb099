//! Default alert rules inserted on first startup.

use crate::error::RuleError;
use crate::models::{Comparator, MetricType, RuleDraft, Severity, Threshold};
use crate::rule_store::RuleStore;

struct RuleDef {
    metric_type: MetricType,
    comparator: Comparator,
    threshold: Threshold,
    severity: Severity,
    title: &'static str,
}

const DEFAULT_RULES: &[RuleDef] = &[
    // ---- Weather ----
    RuleDef {
        metric_type: MetricType::RainfallMm,
        comparator: Comparator::Gt,
        threshold: Threshold::Value(50.0),
        severity: Severity::High,
        title: "Heavy Rain Warning",
    },
    RuleDef {
        metric_type: MetricType::TemperatureC,
        comparator: Comparator::Gt,
        threshold: Threshold::Value(38.0),
        severity: Severity::High,
        title: "Extreme Heat Advisory",
    },
    RuleDef {
        metric_type: MetricType::WindKmh,
        comparator: Comparator::Gt,
        threshold: Threshold::Value(60.0),
        severity: Severity::Moderate,
        title: "Strong Wind Warning",
    },
    // ---- Seismic ----
    RuleDef {
        metric_type: MetricType::EarthquakeMagnitude,
        comparator: Comparator::Between,
        threshold: Threshold::Band {
            low: 5.0,
            high: Some(6.0),
        },
        severity: Severity::Moderate,
        title: "Moderate Earthquake",
    },
    RuleDef {
        metric_type: MetricType::EarthquakeMagnitude,
        comparator: Comparator::Between,
        threshold: Threshold::Band {
            low: 6.0,
            high: Some(7.0),
        },
        severity: Severity::High,
        title: "Strong Earthquake",
    },
    RuleDef {
        metric_type: MetricType::EarthquakeMagnitude,
        comparator: Comparator::Between,
        threshold: Threshold::Band {
            low: 7.0,
            high: None,
        },
        severity: Severity::Critical,
        title: "Major Earthquake",
    },
];

pub fn default_rule_drafts() -> Vec<RuleDraft> {
    DEFAULT_RULES
        .iter()
        .map(|def| RuleDraft {
            id: None,
            metric_type: def.metric_type,
            comparator: def.comparator,
            threshold: def.threshold,
            severity: def.severity,
            title: def.title.to_string(),
            is_active: true,
            cooldown_minutes: None,
        })
        .collect()
}

/// Insert the default rules if the rule table is empty.
///
/// Returns the number of rules inserted.
pub async fn seed_default_rules(store: &RuleStore) -> Result<usize, RuleError> {
    // ---
    let existing = store.count_rules().await?;
    if existing > 0 {
        tracing::info!(existing, "Alert rules already present, skipping seed");
        return Ok(0);
    }

    let mut inserted = 0;
    for draft in default_rule_drafts() {
        let rule = store.upsert_rule(draft).await?;
        tracing::debug!(rule_id = rule.id, title = %rule.title, "Seeded default rule");
        inserted += 1;
    }

    tracing::info!(inserted, "Seeded default alert rules");
    Ok(inserted)
}
