//! Recurring-pipeline schedules.
//!
//! `claim_due_schedule` is the scheduler's exclusivity primitive: the due row
//! comes back locked (`FOR UPDATE SKIP LOCKED`), so concurrent scheduler
//! replicas skip it and at most one replica fires any schedule per tick.
//! Firing (run insert, job insert, `next_run_at` advance) happens in the
//! same transaction, so a crash mid-fire never double-fires.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, PgPool, Row};
use uuid::Uuid;

pub const MIN_INTERVAL_SECONDS: i64 = 60;

#[derive(Debug, Clone)]
pub struct ScheduleRow {
    pub id: Uuid,
    pub target_id: Uuid,
    pub enabled: bool,
    pub interval_seconds: i64,
    pub next_run_at: Option<DateTime<Utc>>,
    pub pipeline_config: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn schedule_from_row(row: &PgRow) -> Result<ScheduleRow> {
    Ok(ScheduleRow {
        id: row.try_get("id")?,
        target_id: row.try_get("target_id")?,
        enabled: row.try_get("enabled")?,
        interval_seconds: row.try_get("interval_seconds")?,
        next_run_at: row.try_get("next_run_at")?,
        pipeline_config: row.try_get("pipeline_config")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

const SCHEDULE_COLUMNS: &str =
    "id, target_id, enabled, interval_seconds, next_run_at, pipeline_config, created_at, updated_at";

#[derive(Debug, Clone)]
pub struct NewSchedule {
    pub target_id: Uuid,
    pub enabled: bool,
    pub interval_seconds: i64,
    pub next_run_at: Option<DateTime<Utc>>,
    pub pipeline_config: Option<Value>,
}

pub async fn create_schedule(pool: &PgPool, new: &NewSchedule) -> Result<ScheduleRow> {
    if new.interval_seconds < MIN_INTERVAL_SECONDS {
        return Err(anyhow!(
            "schedule interval_seconds must be >= {MIN_INTERVAL_SECONDS}, got {}",
            new.interval_seconds
        ));
    }

    let row = sqlx::query(&format!(
        r#"
        insert into schedules (id, target_id, enabled, interval_seconds, next_run_at, pipeline_config)
        values ($1, $2, $3, $4, $5, $6)
        returning {SCHEDULE_COLUMNS}
        "#
    ))
    .bind(Uuid::new_v4())
    .bind(new.target_id)
    .bind(new.enabled)
    .bind(new.interval_seconds)
    .bind(new.next_run_at)
    .bind(&new.pipeline_config)
    .fetch_one(pool)
    .await
    .context("create_schedule failed")?;

    schedule_from_row(&row)
}

pub async fn list_schedules(pool: &PgPool, target_id: Uuid) -> Result<Vec<ScheduleRow>> {
    let rows = sqlx::query(&format!(
        r#"
        select {SCHEDULE_COLUMNS}
        from schedules
        where target_id = $1
        order by created_at asc
        "#
    ))
    .bind(target_id)
    .fetch_all(pool)
    .await
    .context("list_schedules failed")?;

    rows.iter().map(schedule_from_row).collect()
}

/// Lock and return one due schedule, or `None`.
///
/// Must run inside the scheduler's firing transaction; the returned row stays
/// locked until the caller commits.
pub async fn claim_due_schedule(conn: &mut PgConnection) -> Result<Option<ScheduleRow>> {
    let row = sqlx::query(&format!(
        r#"
        select {SCHEDULE_COLUMNS}
        from schedules
        where enabled
          and (next_run_at is null or next_run_at <= now())
        order by next_run_at asc nulls first, created_at asc
        limit 1
        for update skip locked
        "#
    ))
    .fetch_optional(conn)
    .await
    .context("claim_due_schedule failed")?;

    row.as_ref().map(schedule_from_row).transpose()
}

/// Advance `next_run_at` to `fired_at + interval_seconds` (clamped to the
/// minimum interval). Same transaction as the fire.
pub async fn advance_schedule(
    conn: &mut PgConnection,
    schedule_id: Uuid,
    fired_at: DateTime<Utc>,
    interval_seconds: i64,
) -> Result<()> {
    let interval = interval_seconds.max(MIN_INTERVAL_SECONDS);
    sqlx::query(
        r#"
        update schedules
        set next_run_at = $2 + ($3::bigint * interval '1 second'),
            updated_at = now()
        where id = $1
        "#,
    )
    .bind(schedule_id)
    .bind(fired_at)
    .bind(interval)
    .execute(conn)
    .await
    .context("advance_schedule failed")?;
    Ok(())
}
