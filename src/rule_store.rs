//! Rule administration and lookup.
//!
//! [`RuleStore`] wraps a [`RuleRepository`] with the checks a rule must pass
//! before it is accepted, and hands the evaluator the active rules for a
//! metric in a deterministic order.

use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{PersistenceError, RuleError};
use crate::models::{Comparator, MetricType, Rule, RuleDraft, Threshold};
use crate::store::{bounded, RuleRepository};

// ---

#[derive(Clone)]
pub struct RuleStore {
    repo: Arc<dyn RuleRepository>,
    timeout: Duration,
}

impl RuleStore {
    // ---
    pub fn new(repo: Arc<dyn RuleRepository>, timeout: Duration) -> Self {
        Self { repo, timeout }
    }

    /// Active rules for `metric`, ordered by ascending threshold, then id.
    pub async fn active_rules_for(&self, metric: MetricType) -> Result<Vec<Rule>, PersistenceError> {
        // ---
        let mut rules: Vec<Rule> = bounded(
            "load rules",
            self.timeout,
            self.repo.list_rules(Some(metric)),
        )
        .await?
        .into_iter()
        .filter(|r| r.is_active)
        .collect();

        rules.sort_by(|a, b| {
            a.threshold
                .sort_key()
                .total_cmp(&b.threshold.sort_key())
                .then(a.id.cmp(&b.id))
        });
        Ok(rules)
    }

    pub async fn list_rules(&self) -> Result<Vec<Rule>, PersistenceError> {
        bounded("list rules", self.timeout, self.repo.list_rules(None)).await
    }

    pub async fn get_rule(&self, id: i64) -> Result<Rule, RuleError> {
        bounded("get rule", self.timeout, self.repo.get_rule(id))
            .await?
            .ok_or(RuleError::NotFound(id))
    }

    /// Validate and store a rule definition.
    ///
    /// Inserts when `draft.id` is `None`, otherwise replaces the existing
    /// rule. Rejects definitions that overlap another active rule of the
    /// same metric.
    pub async fn upsert_rule(&self, draft: RuleDraft) -> Result<Rule, RuleError> {
        // ---
        validate_draft(&draft)?;

        // An update to a missing rule is NotFound, whatever it would conflict with
        if let Some(id) = draft.id {
            self.get_rule(id).await?;
        }

        let peers = bounded(
            "load rules",
            self.timeout,
            self.repo.list_rules(Some(draft.metric_type)),
        )
        .await?;
        check_conflicts(&draft, &peers)?;

        let rule = match draft.id {
            None => bounded("insert rule", self.timeout, self.repo.insert_rule(&draft)).await?,
            Some(id) => bounded("update rule", self.timeout, self.repo.update_rule(id, &draft))
                .await?
                .ok_or(RuleError::NotFound(id))?,
        };

        tracing::info!(
            rule_id = rule.id,
            metric = %rule.metric_type,
            comparator = %rule.comparator,
            threshold = %rule.threshold,
            severity = %rule.severity,
            active = rule.is_active,
            "Rule saved"
        );
        Ok(rule)
    }

    /// Soft-delete: the rule stays referenced by historical alerts and logs.
    pub async fn deactivate_rule(&self, id: i64) -> Result<(), RuleError> {
        // ---
        let found = bounded(
            "deactivate rule",
            self.timeout,
            self.repo.set_rule_active(id, false),
        )
        .await?;

        if !found {
            return Err(RuleError::NotFound(id));
        }
        tracing::info!(rule_id = id, "Rule deactivated");
        Ok(())
    }

    pub async fn count_rules(&self) -> Result<i64, PersistenceError> {
        bounded("count rules", self.timeout, self.repo.count_rules()).await
    }
}

/// Largest cooldown the `INTEGER` column can hold.
pub const MAX_COOLDOWN_MINUTES: u32 = i32::MAX as u32;

/// Structural checks that do not depend on other rules.
pub fn validate_draft(draft: &RuleDraft) -> Result<(), RuleError> {
    // ---
    if draft.title.trim().is_empty() {
        return Err(RuleError::Validation("title must not be empty".into()));
    }

    if draft.cooldown_minutes == Some(0) {
        return Err(RuleError::Validation(
            "cooldown_minutes must be positive when set".into(),
        ));
    }
    if draft.cooldown_minutes.is_some_and(|m| m > MAX_COOLDOWN_MINUTES) {
        return Err(RuleError::Validation(format!(
            "cooldown_minutes must not exceed {MAX_COOLDOWN_MINUTES}"
        )));
    }

    match (draft.comparator, draft.threshold) {
        (Comparator::Between, Threshold::Band { low, high }) => {
            if !low.is_finite() || high.is_some_and(|h| !h.is_finite()) {
                return Err(RuleError::Validation("band edges must be finite".into()));
            }
            if let Some(high) = high {
                if low >= high {
                    return Err(RuleError::Validation(format!(
                        "band low ({low}) must be below high ({high})"
                    )));
                }
            }
        }
        (Comparator::Between, Threshold::Value(_)) => {
            return Err(RuleError::Validation(
                "'between' requires a {low, high} band threshold".into(),
            ));
        }
        (comparator, Threshold::Band { .. }) => {
            return Err(RuleError::Validation(format!(
                "'{comparator}' requires a single threshold value"
            )));
        }
        (_, Threshold::Value(v)) => {
            if !v.is_finite() {
                return Err(RuleError::Validation("threshold must be finite".into()));
            }
        }
    }

    Ok(())
}

fn bands_overlap(a: &Threshold, b: &Threshold) -> bool {
    // ---
    match (a, b) {
        (
            Threshold::Band {
                low: a_low,
                high: a_high,
            },
            Threshold::Band {
                low: b_low,
                high: b_high,
            },
        ) => {
            let a_before_b_ends = b_high.map_or(true, |h| *a_low < h);
            let b_before_a_ends = a_high.map_or(true, |h| *b_low < h);
            a_before_b_ends && b_before_a_ends
        }
        _ => false,
    }
}

/// Reject a draft that would make band selection ambiguous.
///
/// Only active rules of the same metric are considered, and a rule never
/// conflicts with its own previous definition.
pub fn check_conflicts(draft: &RuleDraft, peers: &[Rule]) -> Result<(), RuleError> {
    // ---
    if !draft.is_active {
        return Ok(());
    }

    let others = peers
        .iter()
        .filter(|p| p.is_active && p.metric_type == draft.metric_type)
        .filter(|p| Some(p.id) != draft.id);

    for peer in others {
        if draft.comparator == Comparator::Between && peer.is_band() {
            if bands_overlap(&draft.threshold, &peer.threshold) {
                return Err(RuleError::ConfigurationConflict {
                    existing_id: peer.id,
                    reason: format!(
                        "band {} overlaps band {} of '{}'",
                        draft.threshold, peer.threshold, peer.title
                    ),
                });
            }
        } else if draft.comparator == peer.comparator
            && draft.threshold.sort_key().total_cmp(&peer.threshold.sort_key()) == Ordering::Equal
        {
            return Err(RuleError::ConfigurationConflict {
                existing_id: peer.id,
                reason: format!(
                    "'{}' already uses {} {}",
                    peer.title, peer.comparator, peer.threshold
                ),
            });
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::models::Severity;
    use crate::store::memory::MemoryStore;

    fn store() -> RuleStore {
        RuleStore::new(Arc::new(MemoryStore::new()), Duration::from_secs(1))
    }

    fn band(low: f64, high: Option<f64>, severity: Severity) -> RuleDraft {
        // ---
        RuleDraft {
            id: None,
            metric_type: MetricType::EarthquakeMagnitude,
            comparator: Comparator::Between,
            threshold: Threshold::Band { low, high },
            severity,
            title: format!("Magnitude {low}+"),
            is_active: true,
            cooldown_minutes: None,
        }
    }

    fn over(metric: MetricType, value: f64, severity: Severity) -> RuleDraft {
        // ---
        RuleDraft {
            id: None,
            metric_type: metric,
            comparator: Comparator::Gt,
            threshold: Threshold::Value(value),
            severity,
            title: format!("{metric} over {value}"),
            is_active: true,
            cooldown_minutes: None,
        }
    }

    #[test]
    fn test_validation_rejects_bad_shapes() {
        // ---
        let mut d = band(5.0, Some(6.0), Severity::Moderate);
        d.threshold = Threshold::Value(5.0);
        assert!(matches!(validate_draft(&d), Err(RuleError::Validation(_))));

        let mut d = over(MetricType::RainfallMm, 50.0, Severity::High);
        d.threshold = Threshold::Band {
            low: 1.0,
            high: None,
        };
        assert!(matches!(validate_draft(&d), Err(RuleError::Validation(_))));

        assert!(matches!(
            validate_draft(&band(6.0, Some(6.0), Severity::High)),
            Err(RuleError::Validation(_))
        ));
        assert!(matches!(
            validate_draft(&over(MetricType::WindKmh, f64::INFINITY, Severity::High)),
            Err(RuleError::Validation(_))
        ));

        let mut d = over(MetricType::WindKmh, 60.0, Severity::High);
        d.title = "  ".into();
        assert!(matches!(validate_draft(&d), Err(RuleError::Validation(_))));

        let mut d = over(MetricType::WindKmh, 60.0, Severity::High);
        d.cooldown_minutes = Some(0);
        assert!(matches!(validate_draft(&d), Err(RuleError::Validation(_))));

        d.cooldown_minutes = Some(MAX_COOLDOWN_MINUTES + 1);
        assert!(matches!(validate_draft(&d), Err(RuleError::Validation(_))));
        d.cooldown_minutes = Some(MAX_COOLDOWN_MINUTES);
        assert!(validate_draft(&d).is_ok());
    }

    #[test]
    fn test_band_overlap_detection() {
        // ---
        let b = |low, high| Threshold::Band { low, high };
        assert!(!bands_overlap(&b(5.0, Some(6.0)), &b(6.0, Some(7.0))));
        assert!(bands_overlap(&b(5.0, Some(6.5)), &b(6.0, Some(7.0))));
        assert!(bands_overlap(&b(7.0, None), &b(8.0, Some(9.0))));
        assert!(!bands_overlap(&b(7.0, None), &b(6.0, Some(7.0))));
        assert!(bands_overlap(&b(7.0, None), &b(7.5, None)));
    }

    #[tokio::test]
    async fn test_contiguous_bands_accepted_and_ordered() {
        // ---
        let s = store();
        s.upsert_rule(band(7.0, None, Severity::Critical)).await.unwrap();
        s.upsert_rule(band(5.0, Some(6.0), Severity::Moderate)).await.unwrap();
        s.upsert_rule(band(6.0, Some(7.0), Severity::High)).await.unwrap();

        let rules = s
            .active_rules_for(MetricType::EarthquakeMagnitude)
            .await
            .unwrap();
        let lows: Vec<f64> = rules.iter().map(|r| r.threshold.sort_key()).collect();
        assert_eq!(lows, vec![5.0, 6.0, 7.0]);
    }

    #[tokio::test]
    async fn test_overlapping_band_rejected() {
        // ---
        let s = store();
        let existing = s.upsert_rule(band(6.0, Some(7.0), Severity::High)).await.unwrap();

        let err = s
            .upsert_rule(band(6.5, Some(7.5), Severity::Critical))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RuleError::ConfigurationConflict { existing_id, .. } if existing_id == existing.id
        ));
    }

    #[tokio::test]
    async fn test_duplicate_threshold_rejected_but_tiering_allowed() {
        // ---
        let s = store();
        s.upsert_rule(over(MetricType::RainfallMm, 50.0, Severity::High)).await.unwrap();
        s.upsert_rule(over(MetricType::RainfallMm, 100.0, Severity::Critical)).await.unwrap();

        let dup = s
            .upsert_rule(over(MetricType::RainfallMm, 50.0, Severity::Low))
            .await;
        assert!(matches!(dup, Err(RuleError::ConfigurationConflict { .. })));

        // Same threshold on another metric is fine
        s.upsert_rule(over(MetricType::WindKmh, 50.0, Severity::Low)).await.unwrap();
    }

    #[tokio::test]
    async fn test_update_does_not_conflict_with_itself() {
        // ---
        let s = store();
        let rule = s.upsert_rule(band(6.0, Some(7.0), Severity::High)).await.unwrap();

        let mut edit = band(6.0, Some(7.0), Severity::Critical);
        edit.id = Some(rule.id);
        let updated = s.upsert_rule(edit).await.unwrap();
        assert_eq!(updated.id, rule.id);
        assert_eq!(updated.severity, Severity::Critical);
    }

    #[tokio::test]
    async fn test_update_missing_rule_is_not_found() {
        // ---
        let s = store();
        let mut edit = over(MetricType::WindKmh, 60.0, Severity::Moderate);
        edit.id = Some(42);
        assert!(matches!(s.upsert_rule(edit).await, Err(RuleError::NotFound(42))));

        // Overlapping an existing band still reports the missing id
        s.upsert_rule(band(6.0, Some(7.0), Severity::High)).await.unwrap();
        let mut clash = band(6.5, Some(7.5), Severity::Critical);
        clash.id = Some(42);
        assert!(matches!(s.upsert_rule(clash).await, Err(RuleError::NotFound(42))));
    }

    #[tokio::test]
    async fn test_deactivate_is_soft_and_frees_band() {
        // ---
        let s = store();
        let rule = s.upsert_rule(band(6.0, Some(7.0), Severity::High)).await.unwrap();
        s.deactivate_rule(rule.id).await.unwrap();

        assert!(s
            .active_rules_for(MetricType::EarthquakeMagnitude)
            .await
            .unwrap()
            .is_empty());
        // Still retrievable for historical references
        assert!(!s.get_rule(rule.id).await.unwrap().is_active);

        // Inactive bands no longer block new definitions
        s.upsert_rule(band(6.5, Some(7.5), Severity::High)).await.unwrap();

        assert!(matches!(s.deactivate_rule(999).await, Err(RuleError::NotFound(999))));
    }
}
