//! Persistence boundary for rules, alerts, automation logs and cooldowns.
//!
//! The pipeline only talks to the traits below. Two backends implement them:
//! [`postgres`] for deployments and [`memory`] for tests and database-less
//! runs. Both honour the same atomicity guarantees: a fired alert and its log
//! entry are written together with the cooldown claim that allowed them, or
//! not at all.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::dedup::CooldownKey;
use crate::error::PersistenceError;
use crate::models::{AutomationLogEntry, Decision, FiredAlert, MetricType, Rule, RuleDraft};

pub mod memory;
pub mod postgres;

// ---

/// Raw rule persistence. Validation lives in [`crate::rule_store::RuleStore`].
#[async_trait]
pub trait RuleRepository: Send + Sync {
    /// All rules, active or not, optionally narrowed to one metric, ordered by id.
    async fn list_rules(&self, metric: Option<MetricType>) -> Result<Vec<Rule>, PersistenceError>;

    async fn get_rule(&self, id: i64) -> Result<Option<Rule>, PersistenceError>;

    /// Insert a new rule; the store assigns an increasing id.
    async fn insert_rule(&self, draft: &RuleDraft) -> Result<Rule, PersistenceError>;

    /// Replace the definition of rule `id`. `None` if it does not exist.
    async fn update_rule(&self, id: i64, draft: &RuleDraft)
        -> Result<Option<Rule>, PersistenceError>;

    /// Flip the active flag. `false` if the rule does not exist.
    async fn set_rule_active(&self, id: i64, active: bool) -> Result<bool, PersistenceError>;

    async fn count_rules(&self) -> Result<i64, PersistenceError>;
}

/// Filter for listing automation log entries.
#[derive(Debug, Clone, Copy)]
pub struct LogFilter {
    pub decision: Option<Decision>,
    pub limit: u32,
}

/// Append-only storage for the automation log, plus read access to alerts.
///
/// Fired alerts are written only through [`CooldownLedger::try_fire`].
#[async_trait]
pub trait AlertRepository: Send + Sync {
    async fn append_log(&self, entry: &AutomationLogEntry) -> Result<(), PersistenceError>;

    /// Newest first.
    async fn list_alerts(&self, limit: u32) -> Result<Vec<FiredAlert>, PersistenceError>;

    /// Newest first.
    async fn list_logs(&self, filter: LogFilter)
        -> Result<Vec<AutomationLogEntry>, PersistenceError>;
}

/// Keyed cooldown expiries, one per (rule, location bucket).
///
/// An expiry only exists for a key whose alert was written, since the claim
/// and the alert are committed together.
#[async_trait]
pub trait CooldownLedger: Send + Sync {
    /// Current expiry of `key`, if it ever fired.
    async fn cooldown_until(&self, key: &CooldownKey)
        -> Result<Option<DateTime<Utc>>, PersistenceError>;

    /// If `key` is idle at `now`, set its expiry to `until` and write `alert`
    /// with its `fired` log `entry`, all in one transaction.
    ///
    /// Returns `false` and writes nothing when the key is still cooling down.
    /// Two concurrent callers for the same key can never both get `true`.
    async fn try_fire(
        &self,
        key: &CooldownKey,
        now: DateTime<Utc>,
        until: DateTime<Utc>,
        alert: &FiredAlert,
        entry: &AutomationLogEntry,
    ) -> Result<bool, PersistenceError>;
}

/// The set of repositories the pipeline runs against.
#[derive(Clone)]
pub struct Backend {
    pub rules: Arc<dyn RuleRepository>,
    pub alerts: Arc<dyn AlertRepository>,
    pub cooldowns: Arc<dyn CooldownLedger>,
}

impl Backend {
    // ---
    pub fn postgres(pool: PgPool) -> Self {
        let store = Arc::new(postgres::PgStore::new(pool));
        Self {
            rules: store.clone(),
            alerts: store.clone(),
            cooldowns: store,
        }
    }

    pub fn memory() -> Self {
        let store = Arc::new(memory::MemoryStore::new());
        Self {
            rules: store.clone(),
            alerts: store.clone(),
            cooldowns: store,
        }
    }
}

/// Run a store call with an upper bound on how long it may take.
pub async fn bounded<T, F>(
    operation: &'static str,
    limit: Duration,
    call: F,
) -> Result<T, PersistenceError>
where
    F: Future<Output = Result<T, PersistenceError>>,
{
    // ---
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => {
            tracing::error!(operation, timeout_ms = limit.as_millis() as u64, "Store call timed out");
            Err(PersistenceError::Timeout {
                operation,
                timeout_ms: limit.as_millis() as u64,
            })
        }
    }
}
