//! Versioned database migrations for `safehaven-alerts`.
//!
//! Each migration runs once, in version order, inside its own transaction,
//! and is recorded in `schema_migrations`. Applied once on startup from
//! `main.rs` (EMBP: single gateway call).

use anyhow::{Context, Result};
use sqlx::PgPool;

// ---

struct Migration {
    version: i32,
    name: &'static str,
    statements: &'static [&'static str],
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "alert_automation_tables",
        statements: &[
            r#"
            CREATE TABLE IF NOT EXISTS alert_rules (
                id                BIGSERIAL PRIMARY KEY,
                metric_type       TEXT             NOT NULL,
                comparator        TEXT             NOT NULL,
                threshold         DOUBLE PRECISION NOT NULL,
                threshold_high    DOUBLE PRECISION,
                severity          TEXT             NOT NULL,
                title             TEXT             NOT NULL,
                is_active         BOOLEAN          NOT NULL DEFAULT TRUE,
                cooldown_minutes  INTEGER,
                created_at        TIMESTAMPTZ      NOT NULL DEFAULT NOW(),
                updated_at        TIMESTAMPTZ      NOT NULL DEFAULT NOW()
            );
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS fired_alerts (
                id                UUID PRIMARY KEY,
                rule_id           BIGINT           NOT NULL REFERENCES alert_rules (id),
                latitude          DOUBLE PRECISION NOT NULL,
                longitude         DOUBLE PRECISION NOT NULL,
                area              TEXT,
                severity          TEXT             NOT NULL,
                title             TEXT             NOT NULL,
                value             DOUBLE PRECISION NOT NULL,
                fired_at          TIMESTAMPTZ      NOT NULL,
                suppressed_until  TIMESTAMPTZ      NOT NULL
            );
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS alert_automation_logs (
                id                UUID PRIMARY KEY,
                rule_id           BIGINT REFERENCES alert_rules (id),
                alert_id          UUID REFERENCES fired_alerts (id),
                reading_snapshot  JSONB        NOT NULL,
                decision          TEXT         NOT NULL,
                created_at        TIMESTAMPTZ  NOT NULL
            );
            "#,
        ],
    },
    Migration {
        version: 2,
        name: "alert_cooldowns",
        statements: &[r#"
            CREATE TABLE IF NOT EXISTS alert_cooldowns (
                rule_id           BIGINT      NOT NULL REFERENCES alert_rules (id),
                lat_cell          BIGINT      NOT NULL,
                lon_cell          BIGINT      NOT NULL,
                suppressed_until  TIMESTAMPTZ NOT NULL,
                PRIMARY KEY (rule_id, lat_cell, lon_cell)
            );
            "#],
    },
    Migration {
        version: 3,
        name: "query_indexes",
        statements: &[
            r#"
            CREATE INDEX IF NOT EXISTS idx_alert_rules_metric_active
                ON alert_rules (metric_type, is_active);
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_fired_alerts_fired_at
                ON fired_alerts (fired_at DESC);
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_automation_logs_created_at
                ON alert_automation_logs (created_at DESC);
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_automation_logs_decision
                ON alert_automation_logs (decision);
            "#,
        ],
    },
];

/// Apply all pending migrations (idempotent).
///
/// Safe to call on every startup; already applied versions are skipped.
/// Errors are propagated if any SQL execution fails, leaving the failing
/// migration unrecorded.
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    // ---
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_migrations (
            version     INTEGER PRIMARY KEY,
            name        TEXT        NOT NULL,
            applied_at  TIMESTAMPTZ NOT NULL DEFAULT NOW()
        );
        "#,
    )
    .execute(pool)
    .await?;

    let applied: Vec<i32> = sqlx::query_scalar("SELECT version FROM schema_migrations")
        .fetch_all(pool)
        .await?;

    for migration in MIGRATIONS.iter().filter(|m| !applied.contains(&m.version)) {
        let mut tx = pool.begin().await?;

        for statement in migration.statements {
            sqlx::query(*statement)
                .execute(&mut *tx)
                .await
                .with_context(|| {
                    format!(
                        "migration {} ({}) failed",
                        migration.version, migration.name
                    )
                })?;
        }

        sqlx::query("INSERT INTO schema_migrations (version, name) VALUES ($1, $2)")
            .bind(migration.version)
            .bind(migration.name)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        tracing::info!(
            version = migration.version,
            name = migration.name,
            "Applied migration"
        );
    }

    Ok(())
}
