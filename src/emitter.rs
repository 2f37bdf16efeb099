//! Persists the outcome of an evaluation.
//!
//! Every call writes exactly one automation log entry. A fired alert, its
//! `fired` log entry and the cooldown claim go to the store in one
//! transaction, so a failed write leaves the key idle. Failures are returned
//! to the caller and are never retried here.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SubsecRound, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::dedup::Deduplicator;
use crate::error::PersistenceError;
use crate::models::{
    render_title, AutomationLogEntry, Decision, EvaluationResult, FiredAlert, Reading,
};
use crate::store::{bounded, AlertRepository};

// ---

/// What the emitter recorded for one evaluation.
#[derive(Debug, Clone, Serialize)]
pub struct Emission {
    pub decision: Decision,
    pub alert: Option<FiredAlert>,
}

pub struct AlertEmitter {
    alerts: Arc<dyn AlertRepository>,
    dedup: Deduplicator,
    timeout: Duration,
}

impl AlertEmitter {
    // ---
    pub fn new(alerts: Arc<dyn AlertRepository>, dedup: Deduplicator, timeout: Duration) -> Self {
        Self {
            alerts,
            dedup,
            timeout,
        }
    }

    /// Record `result` for `reading` as of `now`.
    pub async fn emit(
        &self,
        result: &EvaluationResult,
        reading: &Reading,
        now: DateTime<Utc>,
    ) -> Result<Emission, PersistenceError> {
        // ---
        let now = now.trunc_subsecs(6);
        let snapshot = serde_json::to_value(reading)?;

        let Some(rule) = &result.matched_rule else {
            self.append(log_entry(None, None, snapshot, Decision::NoMatch, now))
                .await?;
            return Ok(Emission {
                decision: Decision::NoMatch,
                alert: None,
            });
        };

        if self.dedup.should_suppress(rule, &reading.location, now).await? {
            return self.suppressed(rule.id, snapshot, now).await;
        }

        let claim = self.dedup.claim_for(rule, &reading.location, now);
        let alert = FiredAlert {
            id: Uuid::new_v4(),
            rule_id: rule.id,
            location: reading.location.clone(),
            severity: rule.severity,
            title: render_title(&rule.title, rule, reading),
            value: reading.value,
            fired_at: now,
            suppressed_until: claim.until,
        };
        let entry = log_entry(
            Some(rule.id),
            Some(alert.id),
            snapshot.clone(),
            Decision::Fired,
            now,
        );

        if !self.dedup.try_fire(&claim, &alert, &entry).await? {
            // A concurrent evaluation fired for the same key first
            return self.suppressed(rule.id, snapshot, now).await;
        }

        tracing::info!(
            rule_id = rule.id,
            alert_id = %alert.id,
            severity = %alert.severity,
            value = alert.value,
            title = %alert.title,
            "Alert fired"
        );
        Ok(Emission {
            decision: Decision::Fired,
            alert: Some(alert),
        })
    }

    async fn suppressed(
        &self,
        rule_id: i64,
        snapshot: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<Emission, PersistenceError> {
        // ---
        self.append(log_entry(
            Some(rule_id),
            None,
            snapshot,
            Decision::Suppressed,
            now,
        ))
        .await?;
        Ok(Emission {
            decision: Decision::Suppressed,
            alert: None,
        })
    }

    async fn append(&self, entry: AutomationLogEntry) -> Result<(), PersistenceError> {
        // ---
        tracing::debug!(rule_id = ?entry.rule_id, decision = %entry.decision, "Automation log entry");
        bounded(
            "append automation log",
            self.timeout,
            self.alerts.append_log(&entry),
        )
        .await
    }
}

fn log_entry(
    rule_id: Option<i64>,
    alert_id: Option<Uuid>,
    reading_snapshot: serde_json::Value,
    decision: Decision,
    now: DateTime<Utc>,
) -> AutomationLogEntry {
    AutomationLogEntry {
        id: Uuid::new_v4(),
        rule_id,
        alert_id,
        reading_snapshot,
        decision,
        created_at: now,
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::dedup::{CooldownKey, LocationGrid};
    use crate::models::{Comparator, Location, MetricType, Rule, Severity, Threshold};
    use crate::store::memory::MemoryStore;
    use crate::store::{CooldownLedger, LogFilter};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Ledger over a [`MemoryStore`] whose first alert write fails.
    struct FlakyLedger {
        inner: Arc<MemoryStore>,
        failed: AtomicBool,
    }

    #[async_trait]
    impl CooldownLedger for FlakyLedger {
        async fn cooldown_until(
            &self,
            key: &CooldownKey,
        ) -> Result<Option<DateTime<Utc>>, PersistenceError> {
            self.inner.cooldown_until(key).await
        }

        async fn try_fire(
            &self,
            key: &CooldownKey,
            now: DateTime<Utc>,
            until: DateTime<Utc>,
            alert: &FiredAlert,
            entry: &AutomationLogEntry,
        ) -> Result<bool, PersistenceError> {
            // ---
            if !self.failed.swap(true, Ordering::SeqCst) {
                return Err(PersistenceError::Unavailable("database down".into()));
            }
            self.inner.try_fire(key, now, until, alert, entry).await
        }
    }

    fn rule() -> Rule {
        // ---
        let ts = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        Rule {
            id: 11,
            metric_type: MetricType::WindKmh,
            comparator: Comparator::Gt,
            threshold: Threshold::Value(60.0),
            severity: Severity::Moderate,
            title: "Strong Wind Warning ({value}) in {area}".to_string(),
            is_active: true,
            cooldown_minutes: None,
            created_at: ts,
            updated_at: ts,
        }
    }

    fn reading() -> Reading {
        Reading {
            metric_type: MetricType::WindKmh,
            value: 85.0,
            location: Location {
                latitude: 10.3,
                longitude: 123.9,
                area: Some("Cebu".into()),
            },
            observed_at: Utc.with_ymd_and_hms(2025, 9, 1, 3, 0, 0).unwrap(),
        }
    }

    fn emitter(alerts: Arc<dyn AlertRepository>, ledger: Arc<dyn CooldownLedger>) -> AlertEmitter {
        // ---
        let dedup = Deduplicator::new(
            ledger,
            LocationGrid::new(10.0),
            chrono::Duration::minutes(60),
            Duration::from_secs(1),
        );
        AlertEmitter::new(alerts, dedup, Duration::from_secs(1))
    }

    fn all_logs() -> LogFilter {
        LogFilter {
            decision: None,
            limit: 100,
        }
    }

    #[tokio::test]
    async fn test_no_match_writes_log_only() {
        // ---
        let store = Arc::new(MemoryStore::new());
        let e = emitter(store.clone(), store.clone());

        let emission = e
            .emit(&EvaluationResult::no_match(), &reading(), Utc::now())
            .await
            .unwrap();
        assert_eq!(emission.decision, Decision::NoMatch);
        assert!(emission.alert.is_none());

        let logs = store.list_logs(all_logs()).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].decision, Decision::NoMatch);
        assert_eq!(logs[0].rule_id, None);
        assert_eq!(logs[0].reading_snapshot["metric_type"], "wind_kmh");
        assert!(store.list_alerts(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fire_then_suppress() {
        // ---
        let store = Arc::new(MemoryStore::new());
        let e = emitter(store.clone(), store.clone());
        let result = EvaluationResult::matched(rule());
        let now = Utc.with_ymd_and_hms(2025, 9, 1, 3, 0, 0).unwrap();

        let first = e.emit(&result, &reading(), now).await.unwrap();
        let alert = first.alert.clone().unwrap();
        assert_eq!(first.decision, Decision::Fired);
        assert_eq!(alert.title, "Strong Wind Warning (85km/h) in Cebu");
        assert_eq!(alert.suppressed_until, now + chrono::Duration::minutes(60));

        let second = e
            .emit(&result, &reading(), now + chrono::Duration::minutes(1))
            .await
            .unwrap();
        assert_eq!(second.decision, Decision::Suppressed);
        assert!(second.alert.is_none());

        let fired = store
            .list_logs(LogFilter {
                decision: Some(Decision::Fired),
                limit: 10,
            })
            .await
            .unwrap();
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].alert_id, Some(alert.id));
        assert_eq!(store.list_logs(all_logs()).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_failed_write_leaves_key_idle() {
        // ---
        let store = Arc::new(MemoryStore::new());
        let ledger = Arc::new(FlakyLedger {
            inner: store.clone(),
            failed: AtomicBool::new(false),
        });
        let e = emitter(store.clone(), ledger);
        let result = EvaluationResult::matched(rule());
        let now = Utc.with_ymd_and_hms(2025, 9, 1, 3, 0, 0).unwrap();

        let err = e.emit(&result, &reading(), now).await.unwrap_err();
        assert!(matches!(err, PersistenceError::Unavailable(_)));
        assert!(store.list_alerts(10).await.unwrap().is_empty());

        // Nothing was claimed, so the retry fires instead of being suppressed
        let retry = e
            .emit(&result, &reading(), now + chrono::Duration::minutes(1))
            .await
            .unwrap();
        assert_eq!(retry.decision, Decision::Fired);
        assert_eq!(store.list_alerts(10).await.unwrap().len(), 1);

        let suppressed = store
            .list_logs(LogFilter {
                decision: Some(Decision::Suppressed),
                limit: 10,
            })
            .await
            .unwrap();
        assert!(suppressed.is_empty());
    }
}
