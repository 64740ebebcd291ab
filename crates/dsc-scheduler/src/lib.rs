//! The scheduler: fire due recurring pipelines, exactly once each.
//!
//! One tick is one transaction: lock a due schedule (`FOR UPDATE SKIP
//! LOCKED`), create the queued run, enqueue the `run_pipeline` job, advance
//! `next_run_at`, commit. Replicas racing on the same tick skip each other's
//! locked row, and a crash before commit fires nothing: job insertion and
//! schedule advancement are atomic.
//!
//! The scheduler never executes a pipeline; it only produces jobs.

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::{json, Value};
use sqlx::PgPool;
use tracing::{info, warn};
use uuid::Uuid;

use dsc_config::Settings;
use dsc_db::{JobType, NewJob, RunTrigger};

/// What one tick fired, if anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fired {
    pub schedule_id: Uuid,
    pub run_id: Uuid,
    pub job_id: Uuid,
}

/// Fire at most one due schedule. Returns `None` when nothing is due (or
/// every due row is locked by a peer).
pub async fn tick_once(pool: &PgPool) -> Result<Option<Fired>> {
    let now = Utc::now();
    let mut tx = pool.begin().await.context("scheduler tick begin failed")?;

    let Some(schedule) = dsc_db::claim_due_schedule(&mut tx).await? else {
        return Ok(None);
    };

    let run = dsc_db::create_run(&mut tx, schedule.target_id, RunTrigger::Scheduled).await?;

    let mut payload = match schedule.pipeline_config.clone() {
        Some(Value::Object(map)) => Value::Object(map),
        _ => json!({}),
    };
    payload["scheduled"] = Value::Bool(true);

    let job = dsc_db::enqueue_job(
        &mut tx,
        &NewJob {
            job_type: JobType::RunPipeline,
            target_id: schedule.target_id,
            run_id: Some(run.id),
            payload,
            available_at: Some(now),
        },
    )
    .await?;

    dsc_db::advance_schedule(&mut tx, schedule.id, now, schedule.interval_seconds).await?;

    tx.commit().await.context("scheduler tick commit failed")?;

    Ok(Some(Fired {
        schedule_id: schedule.id,
        run_id: run.id,
        job_id: job.id,
    }))
}

/// Poll loop: fire due schedules back-to-back, sleep when idle, survive
/// transient errors.
pub async fn run_forever(pool: &PgPool, settings: &Settings) -> Result<()> {
    loop {
        match tick_once(pool).await {
            Ok(Some(fired)) => {
                info!(
                    schedule_id = %fired.schedule_id,
                    run_id = %fired.run_id,
                    job_id = %fired.job_id,
                    "schedule fired"
                );
            }
            Ok(None) => tokio::time::sleep(settings.scheduler_poll).await,
            Err(e) => {
                warn!(error = %e, "scheduler tick failed");
                tokio::time::sleep(settings.scheduler_poll).await;
            }
        }
    }
}
