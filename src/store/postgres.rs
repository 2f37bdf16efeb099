//! PostgreSQL backend.
//!
//! All statements bind their values as parameters. Rows are read into plain
//! `FromRow` structs and converted into domain types, so a corrupt enum value
//! in the database surfaces as a [`PersistenceError::CorruptRow`] instead of
//! a panic.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use super::{AlertRepository, CooldownLedger, LogFilter, RuleRepository};
use crate::dedup::CooldownKey;
use crate::error::PersistenceError;
use crate::models::{
    AutomationLogEntry, Comparator, FiredAlert, Location, MetricType, Rule, RuleDraft, Threshold,
};

const RULE_COLUMNS: &str = "id, metric_type, comparator, threshold, threshold_high, severity, \
                            title, is_active, cooldown_minutes, created_at, updated_at";

// ---

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct RuleRow {
    // ---
    id: i64,
    metric_type: String,
    comparator: String,
    threshold: f64,
    threshold_high: Option<f64>,
    severity: String,
    title: String,
    is_active: bool,
    cooldown_minutes: Option<i32>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

fn corrupt(table: &'static str) -> impl Fn(String) -> PersistenceError {
    move |reason| PersistenceError::CorruptRow { table, reason }
}

impl TryFrom<RuleRow> for Rule {
    type Error = PersistenceError;

    fn try_from(row: RuleRow) -> Result<Self, Self::Error> {
        // ---
        let comparator: Comparator = row.comparator.parse().map_err(corrupt("alert_rules"))?;
        let threshold = if comparator == Comparator::Between {
            Threshold::Band {
                low: row.threshold,
                high: row.threshold_high,
            }
        } else {
            Threshold::Value(row.threshold)
        };
        let cooldown_minutes = row
            .cooldown_minutes
            .map(u32::try_from)
            .transpose()
            .map_err(|e| corrupt("alert_rules")(e.to_string()))?;

        Ok(Rule {
            id: row.id,
            metric_type: row.metric_type.parse().map_err(corrupt("alert_rules"))?,
            comparator,
            threshold,
            severity: row.severity.parse().map_err(corrupt("alert_rules"))?,
            title: row.title,
            is_active: row.is_active,
            cooldown_minutes,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Split a threshold into the `(threshold, threshold_high)` column pair.
fn threshold_columns(threshold: &Threshold) -> (f64, Option<f64>) {
    match threshold {
        Threshold::Value(v) => (*v, None),
        Threshold::Band { low, high } => (*low, *high),
    }
}

fn cooldown_column(draft: &RuleDraft) -> Result<Option<i32>, PersistenceError> {
    draft
        .cooldown_minutes
        .map(i32::try_from)
        .transpose()
        .map_err(|e| corrupt("alert_rules")(format!("cooldown_minutes: {e}")))
}

#[async_trait]
impl RuleRepository for PgStore {
    async fn list_rules(&self, metric: Option<MetricType>) -> Result<Vec<Rule>, PersistenceError> {
        // ---
        let sql = format!(
            "SELECT {RULE_COLUMNS} FROM alert_rules \
             WHERE ($1::TEXT IS NULL OR metric_type = $1) ORDER BY id"
        );
        let rows: Vec<RuleRow> = sqlx::query_as(&sql)
            .bind(metric.map(|m| m.as_str()))
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Rule::try_from).collect()
    }

    async fn get_rule(&self, id: i64) -> Result<Option<Rule>, PersistenceError> {
        let sql = format!("SELECT {RULE_COLUMNS} FROM alert_rules WHERE id = $1");
        let row: Option<RuleRow> = sqlx::query_as(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Rule::try_from).transpose()
    }

    async fn insert_rule(&self, draft: &RuleDraft) -> Result<Rule, PersistenceError> {
        // ---
        let (threshold, threshold_high) = threshold_columns(&draft.threshold);
        let sql = format!(
            r#"
            INSERT INTO alert_rules (
                metric_type, comparator, threshold, threshold_high,
                severity, title, is_active, cooldown_minutes
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING {RULE_COLUMNS}
            "#
        );
        let row: RuleRow = sqlx::query_as(&sql)
            .bind(draft.metric_type.as_str())
            .bind(draft.comparator.as_str())
            .bind(threshold)
            .bind(threshold_high)
            .bind(draft.severity.as_str())
            .bind(&draft.title)
            .bind(draft.is_active)
            .bind(cooldown_column(draft)?)
            .fetch_one(&self.pool)
            .await?;
        Rule::try_from(row)
    }

    async fn update_rule(
        &self,
        id: i64,
        draft: &RuleDraft,
    ) -> Result<Option<Rule>, PersistenceError> {
        // ---
        let (threshold, threshold_high) = threshold_columns(&draft.threshold);
        let sql = format!(
            r#"
            UPDATE alert_rules SET
                metric_type = $1, comparator = $2, threshold = $3, threshold_high = $4,
                severity = $5, title = $6, is_active = $7, cooldown_minutes = $8,
                updated_at = NOW()
            WHERE id = $9
            RETURNING {RULE_COLUMNS}
            "#
        );
        let row: Option<RuleRow> = sqlx::query_as(&sql)
            .bind(draft.metric_type.as_str())
            .bind(draft.comparator.as_str())
            .bind(threshold)
            .bind(threshold_high)
            .bind(draft.severity.as_str())
            .bind(&draft.title)
            .bind(draft.is_active)
            .bind(cooldown_column(draft)?)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Rule::try_from).transpose()
    }

    async fn set_rule_active(&self, id: i64, active: bool) -> Result<bool, PersistenceError> {
        let result =
            sqlx::query("UPDATE alert_rules SET is_active = $1, updated_at = NOW() WHERE id = $2")
                .bind(active)
                .bind(id)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn count_rules(&self) -> Result<i64, PersistenceError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM alert_rules")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

#[derive(Debug, sqlx::FromRow)]
struct AlertRow {
    // ---
    id: Uuid,
    rule_id: i64,
    latitude: f64,
    longitude: f64,
    area: Option<String>,
    severity: String,
    title: String,
    value: f64,
    fired_at: DateTime<Utc>,
    suppressed_until: DateTime<Utc>,
}

impl TryFrom<AlertRow> for FiredAlert {
    type Error = PersistenceError;

    fn try_from(row: AlertRow) -> Result<Self, Self::Error> {
        Ok(FiredAlert {
            id: row.id,
            rule_id: row.rule_id,
            location: Location {
                latitude: row.latitude,
                longitude: row.longitude,
                area: row.area,
            },
            severity: row.severity.parse().map_err(corrupt("fired_alerts"))?,
            title: row.title,
            value: row.value,
            fired_at: row.fired_at,
            suppressed_until: row.suppressed_until,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct LogRow {
    id: Uuid,
    rule_id: Option<i64>,
    alert_id: Option<Uuid>,
    reading_snapshot: serde_json::Value,
    decision: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<LogRow> for AutomationLogEntry {
    type Error = PersistenceError;

    fn try_from(row: LogRow) -> Result<Self, Self::Error> {
        Ok(AutomationLogEntry {
            id: row.id,
            rule_id: row.rule_id,
            alert_id: row.alert_id,
            reading_snapshot: row.reading_snapshot,
            decision: row.decision.parse().map_err(corrupt("alert_automation_logs"))?,
            created_at: row.created_at,
        })
    }
}

async fn insert_log(conn: &mut PgConnection, entry: &AutomationLogEntry) -> Result<(), sqlx::Error> {
    // ---
    sqlx::query(
        r#"
        INSERT INTO alert_automation_logs (
            id, rule_id, alert_id, reading_snapshot, decision, created_at
        ) VALUES ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(entry.id)
    .bind(entry.rule_id)
    .bind(entry.alert_id)
    .bind(&entry.reading_snapshot)
    .bind(entry.decision.as_str())
    .bind(entry.created_at)
    .execute(conn)
    .await?;

    Ok(())
}

#[async_trait]
impl AlertRepository for PgStore {
    async fn append_log(&self, entry: &AutomationLogEntry) -> Result<(), PersistenceError> {
        let mut conn = self.pool.acquire().await?;
        insert_log(&mut conn, entry).await?;
        Ok(())
    }

    async fn list_alerts(&self, limit: u32) -> Result<Vec<FiredAlert>, PersistenceError> {
        // ---
        let rows: Vec<AlertRow> = sqlx::query_as(
            r#"
            SELECT id, rule_id, latitude, longitude, area,
                   severity, title, value, fired_at, suppressed_until
            FROM fired_alerts
            ORDER BY fired_at DESC
            LIMIT $1
            "#,
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(FiredAlert::try_from).collect()
    }

    async fn list_logs(
        &self,
        filter: LogFilter,
    ) -> Result<Vec<AutomationLogEntry>, PersistenceError> {
        // ---
        let rows: Vec<LogRow> = sqlx::query_as(
            r#"
            SELECT id, rule_id, alert_id, reading_snapshot, decision, created_at
            FROM alert_automation_logs
            WHERE ($1::TEXT IS NULL OR decision = $1)
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(filter.decision.map(|d| d.as_str()))
        .bind(i64::from(filter.limit))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(AutomationLogEntry::try_from).collect()
    }
}

async fn insert_alert(conn: &mut PgConnection, alert: &FiredAlert) -> Result<(), PersistenceError> {
    // ---
    sqlx::query(
        r#"
        INSERT INTO fired_alerts (
            id, rule_id, latitude, longitude, area,
            severity, title, value, fired_at, suppressed_until
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        "#,
    )
    .bind(alert.id)
    .bind(alert.rule_id)
    .bind(alert.location.latitude)
    .bind(alert.location.longitude)
    .bind(&alert.location.area)
    .bind(alert.severity.as_str())
    .bind(&alert.title)
    .bind(alert.value)
    .bind(alert.fired_at)
    .bind(alert.suppressed_until)
    .execute(conn)
    .await?;

    Ok(())
}

#[async_trait]
impl CooldownLedger for PgStore {
    async fn cooldown_until(
        &self,
        key: &CooldownKey,
    ) -> Result<Option<DateTime<Utc>>, PersistenceError> {
        // ---
        let until: Option<DateTime<Utc>> = sqlx::query_scalar(
            r#"
            SELECT suppressed_until FROM alert_cooldowns
            WHERE rule_id = $1 AND lat_cell = $2 AND lon_cell = $3
            "#,
        )
        .bind(key.rule_id)
        .bind(key.bucket.lat_cell)
        .bind(key.bucket.lon_cell)
        .fetch_optional(&self.pool)
        .await?;

        Ok(until)
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
        let mut tx = self.pool.begin().await?;

        // The conflict arm only overwrites an expired row. Concurrent claims on
        // the same key serialize on the row lock until the winner commits or
        // rolls back; a loser sees the fresh expiry and gets no row back.
        let claimed: Option<i64> = sqlx::query_scalar(
            r#"
            INSERT INTO alert_cooldowns (rule_id, lat_cell, lon_cell, suppressed_until)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (rule_id, lat_cell, lon_cell) DO UPDATE
                SET suppressed_until = EXCLUDED.suppressed_until
                WHERE alert_cooldowns.suppressed_until <= $5
            RETURNING rule_id
            "#,
        )
        .bind(key.rule_id)
        .bind(key.bucket.lat_cell)
        .bind(key.bucket.lon_cell)
        .bind(until)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;

        if claimed.is_none() {
            tx.rollback().await?;
            return Ok(false);
        }

        // Any failure below drops `tx`, which rolls the claim back with it
        insert_alert(&mut *tx, alert).await?;
        insert_log(&mut *tx, entry).await?;
        tx.commit().await?;

        Ok(true)
    }
}
