//! Environment-driven settings.
//!
//! Every binary calls [`Settings::from_env`] once at startup after an
//! optional [`load_dotenv`] for dev-time `.env.local` bootstrap. Settings are
//! plain values; nothing here touches the network or the database.

use std::time::Duration;

/// Runtime configuration, read once from the environment.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Cap on `status = running` jobs across all targets.
    pub max_concurrent_jobs_global: i64,
    /// Default cap on `status = running` jobs per target; a target's scope
    /// record may override it.
    pub max_concurrent_jobs_per_target: i64,
    /// Idle worker poll interval when the queue is empty.
    pub worker_poll: Duration,
    /// Scheduler loop interval.
    pub scheduler_poll: Duration,
    /// Age after which `scans.raw_output` is nulled.
    pub retention_raw_output_days: i64,
    /// Age after which terminal runs and their scans are deleted.
    pub retention_completed_runs_days: i64,
    /// Stable worker identity recorded in `jobs.locked_by`.
    pub worker_id: String,
    /// Interval at which a busy worker refreshes `jobs.locked_at`.
    pub job_heartbeat: Duration,
    /// Running jobs whose heartbeat is older than this are considered
    /// abandoned by `recover_stale_jobs`.
    pub job_stale_after: Duration,
    /// Optional tools container for probe binaries (`docker exec` wrapping).
    pub tools_container: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_concurrent_jobs_global: 5,
            max_concurrent_jobs_per_target: 2,
            worker_poll: Duration::from_secs(2),
            scheduler_poll: Duration::from_secs(5),
            retention_raw_output_days: 30,
            retention_completed_runs_days: 90,
            worker_id: format!("worker-{}", std::process::id()),
            job_heartbeat: Duration::from_secs(30),
            job_stale_after: Duration::from_secs(300),
            tools_container: None,
        }
    }
}

impl Settings {
    pub fn from_env() -> Self {
        let d = Settings::default();
        Settings {
            max_concurrent_jobs_global: env_i64("MAX_CONCURRENT_JOBS_GLOBAL", d.max_concurrent_jobs_global),
            max_concurrent_jobs_per_target: env_i64(
                "MAX_CONCURRENT_JOBS_PER_TARGET",
                d.max_concurrent_jobs_per_target,
            ),
            worker_poll: env_secs("WORKER_POLL_SECONDS", d.worker_poll),
            scheduler_poll: env_secs("SCHEDULER_POLL_SECONDS", d.scheduler_poll),
            retention_raw_output_days: env_i64("RETENTION_RAW_OUTPUT_DAYS", d.retention_raw_output_days),
            retention_completed_runs_days: env_i64(
                "RETENTION_COMPLETED_RUNS_DAYS",
                d.retention_completed_runs_days,
            ),
            worker_id: std::env::var("WORKER_ID").unwrap_or(d.worker_id),
            job_heartbeat: env_secs("DSC_JOB_HEARTBEAT_SECONDS", d.job_heartbeat),
            job_stale_after: env_secs("DSC_JOB_STALE_SECONDS", d.job_stale_after),
            tools_container: std::env::var("DSC_TOOLS_CONTAINER").ok().filter(|s| !s.is_empty()),
        }
    }
}

/// Load `.env.local` if present. Silent when missing; production injects
/// env vars directly.
pub fn load_dotenv() {
    let _ = dotenvy::from_filename(".env.local");
}

fn env_i64(key: &str, default: i64) -> i64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_secs(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let d = Settings::default();
        assert_eq!(d.max_concurrent_jobs_global, 5);
        assert_eq!(d.max_concurrent_jobs_per_target, 2);
        assert_eq!(d.worker_poll, Duration::from_secs(2));
        assert_eq!(d.scheduler_poll, Duration::from_secs(5));
        assert_eq!(d.retention_raw_output_days, 30);
        assert_eq!(d.retention_completed_runs_days, 90);
        assert!(d.worker_id.starts_with("worker-"));
    }

    #[test]
    fn env_parsers_fall_back_on_garbage() {
        assert_eq!(env_i64("DSC_TEST_UNSET_KEY", 7), 7);
        assert_eq!(env_secs("DSC_TEST_UNSET_KEY", Duration::from_secs(9)), Duration::from_secs(9));
    }
}
