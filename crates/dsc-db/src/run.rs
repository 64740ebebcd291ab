//! Run lifecycle: one run is one atomic sweep of a target's surface.
//!
//! Transitions: `queued → running → (completed | failed | discarded |
//! cancelled)`. Terminal states are absorbing; every guard below carries the
//! source state in its `where` clause so a concurrent discard is never
//! overwritten.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, PgPool, Row};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunTrigger {
    Manual,
    Scheduled,
}

impl RunTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunTrigger::Manual => "manual",
            RunTrigger::Scheduled => "scheduled",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "manual" => Ok(RunTrigger::Manual),
            "scheduled" => Ok(RunTrigger::Scheduled),
            other => Err(anyhow!("invalid run trigger: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Discarded,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Discarded => "discarded",
            RunStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "queued" => Ok(RunStatus::Queued),
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            "discarded" => Ok(RunStatus::Discarded),
            "cancelled" => Ok(RunStatus::Cancelled),
            other => Err(anyhow!("invalid run status: {}", other)),
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Queued | RunStatus::Running)
    }
}

#[derive(Debug, Clone)]
pub struct RunRow {
    pub id: Uuid,
    pub target_id: Uuid,
    pub trigger: RunTrigger,
    pub status: RunStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

fn run_from_row(row: &PgRow) -> Result<RunRow> {
    Ok(RunRow {
        id: row.try_get("id")?,
        target_id: row.try_get("target_id")?,
        trigger: RunTrigger::parse(&row.try_get::<String, _>("trigger")?)?,
        status: RunStatus::parse(&row.try_get::<String, _>("status")?)?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        created_at: row.try_get("created_at")?,
    })
}

const RUN_COLUMNS: &str = "id, target_id, trigger, status, started_at, completed_at, created_at";

/// Insert a run in `queued`. Executes on a caller-supplied connection so the
/// scheduler can bundle run + job + schedule advance into one transaction.
pub async fn create_run(
    conn: &mut PgConnection,
    target_id: Uuid,
    trigger: RunTrigger,
) -> Result<RunRow> {
    let row = sqlx::query(&format!(
        r#"
        insert into runs (id, target_id, trigger, status)
        values ($1, $2, $3, 'queued')
        returning {RUN_COLUMNS}
        "#
    ))
    .bind(Uuid::new_v4())
    .bind(target_id)
    .bind(trigger.as_str())
    .fetch_one(conn)
    .await
    .context("create_run failed")?;

    run_from_row(&row)
}

pub async fn fetch_run(pool: &PgPool, run_id: Uuid) -> Result<Option<RunRow>> {
    let row = sqlx::query(&format!(
        r#"
        select {RUN_COLUMNS}
        from runs
        where id = $1
        "#
    ))
    .bind(run_id)
    .fetch_optional(pool)
    .await
    .context("fetch_run failed")?;

    row.as_ref().map(run_from_row).transpose()
}

/// Current status only: the pipeline's cancellation probe between stages.
pub async fn run_status(pool: &PgPool, run_id: Uuid) -> Result<Option<RunStatus>> {
    let row: Option<(String,)> = sqlx::query_as(
        r#"
        select status
        from runs
        where id = $1
        "#,
    )
    .bind(run_id)
    .fetch_optional(pool)
    .await
    .context("run_status failed")?;

    row.map(|(s,)| RunStatus::parse(&s)).transpose()
}

/// `queued → running`, stamping `started_at` once.
/// Returns false when the run is no longer queued (e.g. discarded first).
pub async fn mark_run_running(pool: &PgPool, run_id: Uuid) -> Result<bool> {
    let row: Option<(Uuid,)> = sqlx::query_as(
        r#"
        update runs
        set status = 'running',
            started_at = coalesce(started_at, now())
        where id = $1
          and status = 'queued'
        returning id
        "#,
    )
    .bind(run_id)
    .fetch_optional(pool)
    .await
    .context("mark_run_running failed")?;

    Ok(row.is_some())
}

/// `running → completed`. Guarded; terminal states are preserved.
pub async fn mark_run_completed(conn: &mut PgConnection, run_id: Uuid) -> Result<bool> {
    let row: Option<(Uuid,)> = sqlx::query_as(
        r#"
        update runs
        set status = 'completed',
            completed_at = now()
        where id = $1
          and status = 'running'
        returning id
        "#,
    )
    .bind(run_id)
    .fetch_optional(conn)
    .await
    .context("mark_run_completed failed")?;

    Ok(row.is_some())
}

/// Non-terminal → failed. Guarded; terminal states are preserved.
pub async fn mark_run_failed(pool: &PgPool, run_id: Uuid) -> Result<bool> {
    let row: Option<(Uuid,)> = sqlx::query_as(
        r#"
        update runs
        set status = 'failed',
            completed_at = now()
        where id = $1
          and status in ('queued', 'running')
        returning id
        "#,
    )
    .bind(run_id)
    .fetch_optional(pool)
    .await
    .context("mark_run_failed failed")?;

    Ok(row.is_some())
}

/// Stamp `completed_at` without touching status, for when a cancellation
/// unwinds and the run already carries its terminal status.
pub async fn stamp_run_completed_at(pool: &PgPool, run_id: Uuid) -> Result<()> {
    sqlx::query(
        r#"
        update runs
        set completed_at = coalesce(completed_at, now())
        where id = $1
        "#,
    )
    .bind(run_id)
    .execute(pool)
    .await
    .context("stamp_run_completed_at failed")?;
    Ok(())
}

/// Discard a run and cancel all of its live jobs in one transaction.
///
/// The job update is a single statement over `queued`/`running` rows; worker
/// `complete_job`/`fail_job` cannot re-enter them because those ops only
/// transition rows still in `running`.
pub async fn discard_run(pool: &PgPool, run_id: Uuid, reason: &str) -> Result<bool> {
    let mut tx = pool.begin().await.context("discard_run begin failed")?;

    let updated: Option<(Uuid,)> = sqlx::query_as(
        r#"
        update runs
        set status = 'discarded',
            completed_at = now()
        where id = $1
          and status in ('queued', 'running')
        returning id
        "#,
    )
    .bind(run_id)
    .fetch_optional(&mut *tx)
    .await
    .context("discard_run run update failed")?;

    sqlx::query(
        r#"
        update jobs
        set status = 'cancelled',
            last_error = $2,
            locked_at = null,
            locked_by = null,
            updated_at = now()
        where run_id = $1
          and status in ('queued', 'running')
        "#,
    )
    .bind(run_id)
    .bind(reason)
    .execute(&mut *tx)
    .await
    .context("discard_run job cancel failed")?;

    tx.commit().await.context("discard_run commit failed")?;
    Ok(updated.is_some())
}
