// crates/dsc-db/src/lib.rs
use anyhow::{Context, Result};
use sqlx::{postgres::PgPoolOptions, PgPool};

pub const ENV_DB_URL: &str = "DSC_DATABASE_URL";

pub mod job;
pub mod recovery;
pub mod retention;
pub mod run;
pub mod scan;
pub mod schedule;
pub mod target;

pub use job::{
    cancel_job, claim_next_job, complete_job, enqueue_job, fail_job, fetch_job, heartbeat_job,
    JobRow, JobStatus, JobType, NewJob,
};
pub use recovery::{recover_orphans, recover_stale_jobs, RecoverySummary};
pub use retention::{purge_old_data, RetentionSummary};
pub use run::{
    create_run, discard_run, fetch_run, mark_run_completed, mark_run_failed, mark_run_running,
    run_status, stamp_run_completed_at, RunRow, RunStatus, RunTrigger,
};
pub use scan::{fetch_scan, finish_scan, insert_finding, start_scan, NewFinding, ScanRow, ScanStatus};
pub use schedule::{
    advance_schedule, claim_due_schedule, create_schedule, list_schedules, NewSchedule,
    ScheduleRow, MIN_INTERVAL_SECONDS,
};
pub use target::{create_target, fetch_target, get_or_create_target, list_targets, TargetRow};

/// Connect to Postgres using DSC_DATABASE_URL.
pub async fn connect_from_env() -> Result<PgPool> {
    let url = std::env::var(ENV_DB_URL).with_context(|| format!("missing env var {ENV_DB_URL}"))?;

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&url)
        .await
        .context("failed to connect to Postgres")?;

    Ok(pool)
}

/// Test helper used by integration tests:
/// - Connect using DSC_DATABASE_URL
/// - Ensure migrations are applied
pub async fn testkit_db_pool() -> Result<PgPool> {
    let pool = connect_from_env().await?;
    migrate(&pool).await?;
    Ok(pool)
}

/// Run embedded SQLx migrations.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("db migrate failed")?;
    Ok(())
}

/// Simple status query (connectivity + schema presence).
pub async fn status(pool: &PgPool) -> Result<DbStatus> {
    let (one,): (i32,) = sqlx::query_as::<_, (i32,)>("select 1")
        .fetch_one(pool)
        .await
        .context("status connectivity query failed")?;
    let ok = one == 1;

    let (exists,): (bool,) = sqlx::query_as::<_, (bool,)>(
        r#"
        select exists (
            select 1
            from information_schema.tables
            where table_schema='public' and table_name='jobs'
        )
        "#,
    )
    .fetch_one(pool)
    .await
    .context("status table-exists query failed")?;

    Ok(DbStatus {
        ok,
        has_jobs_table: exists,
    })
}

#[derive(Debug, Clone)]
pub struct DbStatus {
    pub ok: bool,
    pub has_jobs_table: bool,
}
