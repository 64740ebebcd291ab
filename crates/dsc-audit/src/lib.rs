//! Append-only run-event stream.
//!
//! Events narrate what the platform did (jobs claimed, scans run, pipelines
//! completed) for consumers and operators. They are never read back by the
//! core and never drive a state transition.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, Row};
use uuid::Uuid;

/// Event types emitted by the core.
pub mod event_type {
    pub const PIPELINE_TRIGGERED: &str = "pipeline_triggered";
    pub const PIPELINE_STARTED: &str = "pipeline_started";
    pub const PIPELINE_COMPLETED: &str = "pipeline_completed";
    pub const SCAN_STARTED: &str = "scan_started";
    pub const SCAN_COMPLETED: &str = "scan_completed";
    pub const JOB_CLAIMED: &str = "job_claimed";
    pub const JOB_COMPLETED: &str = "job_completed";
    pub const JOB_FAILED: &str = "job_failed";
}

#[derive(Debug, Clone)]
pub struct RunEventRow {
    pub id: Uuid,
    pub target_id: Uuid,
    pub run_id: Option<Uuid>,
    pub event_type: String,
    pub detail: Option<Value>,
    pub actor: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Append one event. Takes a caller connection so events ride whatever
/// transaction (or pool) the caller is using.
pub async fn log_event(
    conn: &mut PgConnection,
    target_id: Uuid,
    run_id: Option<Uuid>,
    event_type: &str,
    detail: Option<Value>,
    actor: &str,
) -> Result<Uuid> {
    let (id,): (Uuid,) = sqlx::query_as(
        r#"
        insert into run_events (id, target_id, run_id, event_type, detail, actor)
        values ($1, $2, $3, $4, $5, $6)
        returning id
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(target_id)
    .bind(run_id)
    .bind(event_type)
    .bind(detail)
    .bind(actor)
    .fetch_one(conn)
    .await
    .context("log_event failed")?;

    Ok(id)
}

/// Recent events for a target, newest first.
pub async fn list_events(
    conn: &mut PgConnection,
    target_id: Uuid,
    limit: i64,
) -> Result<Vec<RunEventRow>> {
    let rows = sqlx::query(
        r#"
        select id, target_id, run_id, event_type, detail, actor, created_at
        from run_events
        where target_id = $1
        order by created_at desc
        limit $2
        "#,
    )
    .bind(target_id)
    .bind(limit)
    .fetch_all(conn)
    .await
    .context("list_events failed")?;

    rows.iter().map(event_from_row).collect()
}

fn event_from_row(row: &PgRow) -> Result<RunEventRow> {
    Ok(RunEventRow {
        id: row.try_get("id")?,
        target_id: row.try_get("target_id")?,
        run_id: row.try_get("run_id")?,
        event_type: row.try_get("event_type")?,
        detail: row.try_get("detail")?,
        actor: row.try_get("actor")?,
        created_at: row.try_get("created_at")?,
    })
}
