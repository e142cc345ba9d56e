use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;

pub fn connect_lazy(database_url: &str) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(8))
        .connect_lazy(database_url)
        .with_context(|| format!("Failed to create lazy database pool for {database_url}"))
}

/// Creates the tables the runtime needs when they do not exist yet. The
/// statements are idempotent so startup on an already-provisioned database
/// is a no-op.
pub async fn ensure_schema(pool: &PgPool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS devices (
            device_id    TEXT PRIMARY KEY,
            name         TEXT,
            location     TEXT,
            max_distance DOUBLE PRECISION,
            max_gas      DOUBLE PRECISION,
            min_flow     DOUBLE PRECISION,
            min_battery  DOUBLE PRECISION,
            created_at   TIMESTAMPTZ NOT NULL DEFAULT now()
        )
        "#,
    )
    .execute(pool)
    .await
    .context("failed to ensure devices table")?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS readings (
            device_id     TEXT NOT NULL,
            observed_at   TIMESTAMPTZ NOT NULL,
            sewage_level  DOUBLE PRECISION NOT NULL,
            methane_level DOUBLE PRECISION NOT NULL,
            flow_rate     DOUBLE PRECISION NOT NULL,
            battery_level DOUBLE PRECISION NOT NULL,
            temperature   DOUBLE PRECISION,
            humidity      DOUBLE PRECISION,
            status        TEXT NOT NULL,
            inserted_at   TIMESTAMPTZ NOT NULL DEFAULT now(),
            PRIMARY KEY (device_id, observed_at)
        )
        "#,
    )
    .execute(pool)
    .await
    .context("failed to ensure readings table")?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS readings_observed_at_idx ON readings (observed_at)",
    )
    .execute(pool)
    .await
    .context("failed to ensure readings index")?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS alerts (
            id           UUID PRIMARY KEY,
            device_id    TEXT NOT NULL,
            alert_type   TEXT NOT NULL,
            status       TEXT NOT NULL,
            opened_at    TIMESTAMPTZ NOT NULL,
            last_seen_at TIMESTAMPTZ NOT NULL,
            closed_at    TIMESTAMPTZ,
            notes        JSONB NOT NULL DEFAULT '[]'::jsonb
        )
        "#,
    )
    .execute(pool)
    .await
    .context("failed to ensure alerts table")?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS alerts_device_status_idx ON alerts (device_id, status)",
    )
    .execute(pool)
    .await
    .context("failed to ensure alerts index")?;

    Ok(())
}
