//! The worker: claim one job, execute it, settle it, repeat.
//!
//! Claims use a short transaction so no row lock is held across probe
//! execution. While a job runs, a background task refreshes its
//! `locked_at` heartbeat so stale-claim recovery on peers leaves live work
//! alone. Retry policy: attempts 1 and 2 requeue with a 10 s backoff,
//! attempt 3 fails terminally. A [`Cancelled`] unwind settles the job as
//! cancelled and preserves the run's terminal status.
//!
//! The worker also owns two periodic chores: the hourly retention purge and
//! stale-claim recovery.

use std::time::Duration;

use anyhow::{anyhow, Result};
use serde_json::json;
use sqlx::PgPool;
use tracing::{error, info, warn};
use uuid::Uuid;

use dsc_audit::event_type;
use dsc_config::Settings;
use dsc_db::{JobRow, JobType, RunTrigger};
use dsc_pipeline::{Cancelled, PipelineDeps, PipelineScanners};
use dsc_resolve::DnsResolver;
use dsc_scan::{HttpxScanner, NmapScanner, NucleiScanner, SubfinderScanner, ToolExec};
use dsc_verify::VerifierDeps;

/// Attempts before a retryable failure becomes terminal.
pub const MAX_ATTEMPTS: i32 = 3;
/// Backoff between retryable attempts.
pub const RETRY_BACKOFF: Duration = Duration::from_secs(10);
/// Retention purge cadence.
pub const RETENTION_INTERVAL: Duration = Duration::from_secs(3600);

pub struct Worker {
    pool: PgPool,
    settings: Settings,
    pipeline: PipelineDeps,
    verifier: VerifierDeps,
}

impl Worker {
    /// Production wiring: subprocess adapters plus the shared resolver.
    pub fn new(pool: PgPool, settings: Settings) -> Result<Self> {
        let exec = match settings.tools_container.as_deref() {
            Some(c) => ToolExec::in_container(c),
            None => ToolExec::direct(),
        };
        let resolver: std::sync::Arc<dyn dsc_resolve::Resolve> =
            std::sync::Arc::new(DnsResolver::from_system_or_default()?);

        let pipeline = PipelineDeps {
            scanners: PipelineScanners {
                subdomain: Box::new(SubfinderScanner::new(exec.clone())),
                port_scan: Box::new(NmapScanner::new(exec.clone())),
                http_probe: Box::new(HttpxScanner::new(exec.clone())),
                vuln_probe: Box::new(NucleiScanner::new(exec)),
            },
            resolver: std::sync::Arc::clone(&resolver),
        };
        let verifier = VerifierDeps::new(resolver)?;

        Ok(Self {
            pool,
            settings,
            pipeline,
            verifier,
        })
    }

    /// Test wiring with injected probe seats.
    pub fn with_deps(
        pool: PgPool,
        settings: Settings,
        pipeline: PipelineDeps,
        verifier: VerifierDeps,
    ) -> Self {
        Self {
            pool,
            settings,
            pipeline,
            verifier,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.settings.worker_id
    }

    /// Run until the process is asked to stop.
    pub async fn run_forever(&self) -> Result<()> {
        let mut last_retention = tokio::time::Instant::now() - RETENTION_INTERVAL;
        let mut last_stale_recovery = tokio::time::Instant::now();

        loop {
            if last_retention.elapsed() >= RETENTION_INTERVAL {
                if let Err(e) = dsc_db::purge_old_data(&self.pool, &self.settings).await {
                    warn!(error = %e, "retention purge failed");
                }
                last_retention = tokio::time::Instant::now();
            }

            if last_stale_recovery.elapsed() >= self.settings.job_stale_after {
                match dsc_db::recover_stale_jobs(&self.pool, self.settings.job_stale_after).await {
                    Ok(0) => {}
                    Ok(n) => warn!(count = n, "recovered stale jobs from dead workers"),
                    Err(e) => warn!(error = %e, "stale-claim recovery failed"),
                }
                last_stale_recovery = tokio::time::Instant::now();
            }

            match self.tick().await {
                Ok(true) => {} // claimed and processed; go straight back for more
                Ok(false) => tokio::time::sleep(self.settings.worker_poll).await,
                Err(e) => {
                    error!(error = %e, "worker tick failed");
                    tokio::time::sleep(self.settings.worker_poll).await;
                }
            }
        }
    }

    /// Claim and process at most one job. Returns whether one was claimed.
    pub async fn tick(&self) -> Result<bool> {
        let job = self.claim().await?;
        let Some(job) = job else {
            return Ok(false);
        };

        let actor = format!("worker:{}", self.settings.worker_id);
        {
            let mut conn = self.pool.acquire().await?;
            dsc_audit::log_event(
                &mut conn,
                job.target_id,
                job.run_id,
                event_type::JOB_CLAIMED,
                Some(json!({
                    "job_id": job.id,
                    "job_type": job.job_type.as_str(),
                    "attempt": job.attempts,
                })),
                &actor,
            )
            .await?;
        }

        let heartbeat = self.spawn_heartbeat(job.id);
        let outcome = self.process(&job).await;
        heartbeat.abort();

        match outcome {
            Ok(()) => {
                dsc_db::complete_job(&self.pool, job.id).await?;
                let mut conn = self.pool.acquire().await?;
                dsc_audit::log_event(
                    &mut conn,
                    job.target_id,
                    job.run_id,
                    event_type::JOB_COMPLETED,
                    Some(json!({"job_id": job.id, "job_type": job.job_type.as_str()})),
                    &actor,
                )
                .await?;
            }
            Err(err) => {
                if let Some(cancelled) = err.downcast_ref::<Cancelled>() {
                    info!(job_id = %job.id, run_id = %cancelled.run_id, "job cancelled mid-pipeline");
                    dsc_db::cancel_job(&self.pool, job.id, Some(&cancelled.to_string())).await?;
                } else {
                    let retry_in = if job.attempts < MAX_ATTEMPTS {
                        Some(chrono::Duration::from_std(RETRY_BACKOFF)?)
                    } else {
                        None
                    };
                    warn!(
                        job_id = %job.id,
                        attempt = job.attempts,
                        retrying = retry_in.is_some(),
                        error = %err,
                        "job failed"
                    );
                    dsc_db::fail_job(&self.pool, job.id, &err.to_string(), retry_in).await?;

                    let mut conn = self.pool.acquire().await?;
                    dsc_audit::log_event(
                        &mut conn,
                        job.target_id,
                        job.run_id,
                        event_type::JOB_FAILED,
                        Some(json!({
                            "job_id": job.id,
                            "job_type": job.job_type.as_str(),
                            "error": truncate(&err.to_string(), 500),
                        })),
                        &actor,
                    )
                    .await?;
                }
            }
        }

        Ok(true)
    }

    /// Short claim transaction; no locks survive past the claim itself.
    async fn claim(&self) -> Result<Option<JobRow>> {
        let mut tx = self.pool.begin().await?;
        let job = dsc_db::claim_next_job(&mut tx, &self.settings, &self.settings.worker_id).await?;
        tx.commit().await?;
        Ok(job)
    }

    fn spawn_heartbeat(&self, job_id: Uuid) -> tokio::task::JoinHandle<()> {
        let pool = self.pool.clone();
        let worker_id = self.settings.worker_id.clone();
        let interval = self.settings.job_heartbeat;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // first tick fires immediately; skip it
            loop {
                ticker.tick().await;
                match dsc_db::heartbeat_job(&pool, job_id, &worker_id).await {
                    Ok(true) => {}
                    // Job left running state (or changed owner); stop beating.
                    Ok(false) => break,
                    Err(e) => warn!(job_id = %job_id, error = %e, "job heartbeat failed"),
                }
            }
        })
    }

    async fn process(&self, job: &JobRow) -> Result<()> {
        match job.job_type {
            JobType::RunPipeline => {
                let scheduled = job
                    .payload
                    .as_ref()
                    .and_then(|p| p.get("scheduled"))
                    .and_then(serde_json::Value::as_bool)
                    .unwrap_or(false);
                let trigger = if scheduled {
                    RunTrigger::Scheduled
                } else {
                    RunTrigger::Manual
                };
                dsc_pipeline::run_pipeline(
                    &self.pool,
                    &self.pipeline,
                    job.target_id,
                    job.run_id,
                    trigger,
                    job.payload.as_ref(),
                )
                .await?;
                Ok(())
            }
            JobType::VerifyAsset => {
                let run_id = job
                    .run_id
                    .ok_or_else(|| anyhow!("verify_asset job {} missing run_id", job.id))?;
                let asset_id = payload_id(job, "asset_id")?;
                dsc_verify::verify_asset(&self.pool, &self.verifier, asset_id, job.target_id, run_id)
                    .await?;
                Ok(())
            }
            JobType::VerifyService => {
                let run_id = job
                    .run_id
                    .ok_or_else(|| anyhow!("verify_service job {} missing run_id", job.id))?;
                let service_id = payload_id(job, "service_id")?;
                dsc_verify::verify_service(
                    &self.pool,
                    &self.verifier,
                    service_id,
                    job.target_id,
                    run_id,
                )
                .await?;
                Ok(())
            }
        }
    }
}

fn payload_id(job: &JobRow, key: &str) -> Result<Uuid> {
    job.payload
        .as_ref()
        .and_then(|p| p.get(key))
        .and_then(serde_json::Value::as_str)
        .and_then(|s| Uuid::parse_str(s).ok())
        .ok_or_else(|| anyhow!("{} job {} missing {}", job.job_type.as_str(), job.id, key))
}

fn truncate(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_policy_constants() {
        assert_eq!(MAX_ATTEMPTS, 3);
        assert_eq!(RETRY_BACKOFF, Duration::from_secs(10));
    }
}
