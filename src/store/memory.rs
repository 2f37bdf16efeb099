//! In-process backend used by tests and `STORAGE_BACKEND=memory` runs.
//!
//! Everything sits behind one mutex, which makes each trait call atomic with
//! respect to the others.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{AlertRepository, CooldownLedger, LogFilter, RuleRepository};
use crate::dedup::{CooldownKey, CooldownState};
use crate::error::PersistenceError;
use crate::models::{AutomationLogEntry, FiredAlert, MetricType, Rule, RuleDraft};

#[derive(Default)]
struct State {
    rules: Vec<Rule>,
    next_rule_id: i64,
    alerts: Vec<FiredAlert>,
    logs: Vec<AutomationLogEntry>,
    cooldowns: HashMap<CooldownKey, DateTime<Utc>>,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    // ---
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, PersistenceError> {
        self.state
            .lock()
            .map_err(|_| PersistenceError::Unavailable("memory store lock poisoned".into()))
    }
}

fn apply_draft(rule: &mut Rule, draft: &RuleDraft, now: DateTime<Utc>) {
    rule.metric_type = draft.metric_type;
    rule.comparator = draft.comparator;
    rule.threshold = draft.threshold;
    rule.severity = draft.severity;
    rule.title = draft.title.clone();
    rule.is_active = draft.is_active;
    rule.cooldown_minutes = draft.cooldown_minutes;
    rule.updated_at = now;
}

#[async_trait]
impl RuleRepository for MemoryStore {
    async fn list_rules(&self, metric: Option<MetricType>) -> Result<Vec<Rule>, PersistenceError> {
        let state = self.lock()?;
        Ok(state
            .rules
            .iter()
            .filter(|r| metric.map_or(true, |m| r.metric_type == m))
            .cloned()
            .collect())
    }

    async fn get_rule(&self, id: i64) -> Result<Option<Rule>, PersistenceError> {
        let state = self.lock()?;
        Ok(state.rules.iter().find(|r| r.id == id).cloned())
    }

    async fn insert_rule(&self, draft: &RuleDraft) -> Result<Rule, PersistenceError> {
        // ---
        let mut state = self.lock()?;
        state.next_rule_id += 1;
        let now = Utc::now();
        let rule = Rule {
            id: state.next_rule_id,
            metric_type: draft.metric_type,
            comparator: draft.comparator,
            threshold: draft.threshold,
            severity: draft.severity,
            title: draft.title.clone(),
            is_active: draft.is_active,
            cooldown_minutes: draft.cooldown_minutes,
            created_at: now,
            updated_at: now,
        };
        state.rules.push(rule.clone());
        Ok(rule)
    }

    async fn update_rule(
        &self,
        id: i64,
        draft: &RuleDraft,
    ) -> Result<Option<Rule>, PersistenceError> {
        // ---
        let mut state = self.lock()?;
        let Some(rule) = state.rules.iter_mut().find(|r| r.id == id) else {
            return Ok(None);
        };
        apply_draft(rule, draft, Utc::now());
        Ok(Some(rule.clone()))
    }

    async fn set_rule_active(&self, id: i64, active: bool) -> Result<bool, PersistenceError> {
        // ---
        let mut state = self.lock()?;
        match state.rules.iter_mut().find(|r| r.id == id) {
            Some(rule) => {
                rule.is_active = active;
                rule.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn count_rules(&self) -> Result<i64, PersistenceError> {
        Ok(self.lock()?.rules.len() as i64)
    }
}

#[async_trait]
impl AlertRepository for MemoryStore {
    async fn append_log(&self, entry: &AutomationLogEntry) -> Result<(), PersistenceError> {
        self.lock()?.logs.push(entry.clone());
        Ok(())
    }

    async fn list_alerts(&self, limit: u32) -> Result<Vec<FiredAlert>, PersistenceError> {
        let state = self.lock()?;
        Ok(state
            .alerts
            .iter()
            .rev()
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn list_logs(
        &self,
        filter: LogFilter,
    ) -> Result<Vec<AutomationLogEntry>, PersistenceError> {
        // ---
        let state = self.lock()?;
        Ok(state
            .logs
            .iter()
            .rev()
            .filter(|e| filter.decision.map_or(true, |d| e.decision == d))
            .take(filter.limit as usize)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl CooldownLedger for MemoryStore {
    async fn cooldown_until(
        &self,
        key: &CooldownKey,
    ) -> Result<Option<DateTime<Utc>>, PersistenceError> {
        Ok(self.lock()?.cooldowns.get(key).copied())
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
        let mut state = self.lock()?;
        let current = CooldownState::from_expiry(state.cooldowns.get(key).copied());
        if current.should_suppress(now) {
            return Ok(false);
        }

        // Expired keys behave exactly like absent ones
        state.cooldowns.retain(|_, expiry| *expiry > now);
        state.cooldowns.insert(*key, until);
        state.alerts.push(alert.clone());
        state.logs.push(entry.clone());
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::dedup::LocationBucket;
    use crate::models::{Comparator, Decision, Location, Severity, Threshold};
    use chrono::{Duration, TimeZone};
    use tokio_test::assert_ok;

    fn draft(metric: MetricType, threshold: f64) -> RuleDraft {
        // ---
        RuleDraft {
            id: None,
            metric_type: metric,
            comparator: Comparator::Gt,
            threshold: Threshold::Value(threshold),
            severity: Severity::Moderate,
            title: "Test rule".to_string(),
            is_active: true,
            cooldown_minutes: None,
        }
    }

    fn log(decision: Decision) -> AutomationLogEntry {
        AutomationLogEntry {
            id: uuid::Uuid::new_v4(),
            rule_id: None,
            alert_id: None,
            reading_snapshot: serde_json::json!({}),
            decision,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_rule_ids_increase_in_creation_order() {
        // ---
        let store = MemoryStore::new();
        let a = store.insert_rule(&draft(MetricType::WindKmh, 60.0)).await.unwrap();
        let b = store.insert_rule(&draft(MetricType::WindKmh, 90.0)).await.unwrap();
        assert!(b.id > a.id);

        let wind = store.list_rules(Some(MetricType::WindKmh)).await.unwrap();
        assert_eq!(wind.len(), 2);
        assert!(store.list_rules(Some(MetricType::RainfallMm)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_update_and_deactivate() {
        // ---
        let store = MemoryStore::new();
        let rule = store.insert_rule(&draft(MetricType::WindKmh, 60.0)).await.unwrap();

        let mut changed = draft(MetricType::WindKmh, 75.0);
        changed.title = "Gale".to_string();
        let updated = store.update_rule(rule.id, &changed).await.unwrap().unwrap();
        assert_eq!(updated.threshold, Threshold::Value(75.0));
        assert_eq!(updated.created_at, rule.created_at);

        assert!(store.update_rule(999, &changed).await.unwrap().is_none());
        assert!(assert_ok!(store.set_rule_active(rule.id, false).await));
        assert!(!store.get_rule(rule.id).await.unwrap().unwrap().is_active);
        assert!(!assert_ok!(store.set_rule_active(999, false).await));
    }

    #[tokio::test]
    async fn test_logs_filtered_newest_first() {
        // ---
        let store = MemoryStore::new();
        for d in [Decision::NoMatch, Decision::Suppressed, Decision::NoMatch] {
            store.append_log(&log(d)).await.unwrap();
        }

        let all = store
            .list_logs(LogFilter {
                decision: None,
                limit: 10,
            })
            .await
            .unwrap();
        assert_eq!(all.len(), 3);

        let no_match = store
            .list_logs(LogFilter {
                decision: Some(Decision::NoMatch),
                limit: 1,
            })
            .await
            .unwrap();
        assert_eq!(no_match.len(), 1);
        assert_eq!(no_match[0].id, all[0].id);
    }

    fn key(rule_id: i64, lat_cell: i64) -> CooldownKey {
        CooldownKey {
            rule_id,
            bucket: LocationBucket {
                lat_cell,
                lon_cell: 0,
            },
        }
    }

    fn fired(rule_id: i64, now: DateTime<Utc>) -> (FiredAlert, AutomationLogEntry) {
        // ---
        let alert = FiredAlert {
            id: uuid::Uuid::new_v4(),
            rule_id,
            location: Location {
                latitude: 0.0,
                longitude: 0.0,
                area: None,
            },
            severity: Severity::High,
            title: "Heavy Rain Warning".to_string(),
            value: 55.0,
            fired_at: now,
            suppressed_until: now + Duration::minutes(10),
        };
        let mut entry = log(Decision::Fired);
        entry.rule_id = Some(rule_id);
        entry.alert_id = Some(alert.id);
        (alert, entry)
    }

    #[tokio::test]
    async fn test_try_fire_writes_nothing_while_cooling_down() {
        // ---
        let store = MemoryStore::new();
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
        let until = now + Duration::minutes(10);

        let (alert, entry) = fired(1, now);
        assert!(store.try_fire(&key(1, 0), now, until, &alert, &entry).await.unwrap());
        assert_eq!(store.cooldown_until(&key(1, 0)).await.unwrap(), Some(until));

        let later = now + Duration::minutes(5);
        let (alert, entry) = fired(1, later);
        assert!(!store.try_fire(&key(1, 0), later, later + Duration::minutes(10), &alert, &entry).await.unwrap());

        assert_eq!(store.list_alerts(10).await.unwrap().len(), 1);
        assert_eq!(store.cooldown_until(&key(1, 0)).await.unwrap(), Some(until));
        let logs = store
            .list_logs(LogFilter {
                decision: None,
                limit: 10,
            })
            .await
            .unwrap();
        assert_eq!(logs.len(), 1);
    }

    #[tokio::test]
    async fn test_expired_cooldowns_are_pruned() {
        // ---
        let store = MemoryStore::new();
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();

        for cell in 0..5 {
            let (alert, entry) = fired(1, now);
            assert_ok!(store.try_fire(&key(1, cell), now, now + Duration::minutes(10), &alert, &entry).await);
        }
        assert_eq!(store.lock().unwrap().cooldowns.len(), 5);

        let later = now + Duration::minutes(30);
        let (alert, entry) = fired(2, later);
        assert!(store.try_fire(&key(2, 0), later, later + Duration::minutes(10), &alert, &entry).await.unwrap());

        let state = store.lock().unwrap();
        assert_eq!(state.cooldowns.len(), 1);
        assert!(state.cooldowns.contains_key(&key(2, 0)));
    }
}
