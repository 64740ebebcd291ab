//! Scenario: Discard Mid-Pipeline Cancels at the Stage Boundary
//!
//! The run is discarded while stage 3 (per-host port scans) is underway.
//! The next boundary check observes the discarded run and unwinds: later
//! stages never execute, the job settles as `cancelled`, the run keeps its
//! `discarded` status with `completed_at` stamped, and the assets stages
//! 1–2 already ingested remain with this run as their `first_seen_run_id`.
//!
//! Skips gracefully when `DSC_DATABASE_URL` is not set.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde_json::json;

use dsc_config::Settings;
use dsc_db::{JobStatus, RunStatus};
use dsc_scan::{LineSink, ScanConfig, ScanResult, Scanner};
use dsc_testkit::*;
use dsc_worker::Worker;

/// A port-scan seat that discards the run on its first invocation, then
/// answers like a quiet scanner. The boundary check before the next host
/// must observe the discard.
struct DiscardingScanner {
    pool: sqlx::PgPool,
    run_id: uuid::Uuid,
    calls: AtomicUsize,
}

#[async_trait]
impl Scanner for DiscardingScanner {
    fn name(&self) -> &'static str {
        "nmap"
    }

    async fn run(&self, target: &str, _config: &ScanConfig, _stream: Option<LineSink>) -> ScanResult {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            dsc_db::discard_run(&self.pool, self.run_id, "discarded_by_user")
                .await
                .expect("discard inside scan");
        }
        ScanResult::started("nmap", target).finish()
    }
}

#[tokio::test]
#[ignore = "requires DSC_DATABASE_URL; see dsc_testkit::DB_HINT"]
async fn discard_during_stage_three_stops_the_pipeline() -> anyhow::Result<()> {
    let pool = make_pool().await?;
    let root = unique_root("midway");
    let www = format!("www.{root}");
    let target = make_target(&pool, &root).await?;

    // Three addresses so stage 3 has multiple boundary checks to trip on.
    let resolver =
        StaticResolver::new().with_entry(&www, &["192.0.2.41", "192.0.2.42", "192.0.2.43"]);

    // The run and job are created up front so the scanner knows what to
    // discard.
    let (run, job) = make_pipeline_job(&pool, target.id, json!({"scheduled": false})).await?;

    let nmap = DiscardingScanner {
        pool: pool.clone(),
        run_id: run.id,
        calls: AtomicUsize::new(0),
    };

    let deps = dsc_pipeline::PipelineDeps {
        scanners: dsc_pipeline::PipelineScanners {
            subdomain: Box::new(ScriptedScanner::new(
                "subfinder",
                vec![subdomain_result("subfinder", &root, &[&www])],
            )),
            port_scan: Box::new(nmap),
            http_probe: Box::new(ScriptedScanner::empty("httpx")),
            vuln_probe: Box::new(ScriptedScanner::empty("nuclei")),
        },
        resolver: std::sync::Arc::new(resolver.clone()),
    };
    let worker = Worker::with_deps(
        pool.clone(),
        Settings {
            max_concurrent_jobs_global: 100,
            ..Settings::default()
        },
        deps,
        verifier_with_resolver(resolver)?,
    );

    drain_queue(&worker).await?;

    // The run keeps the status the discard gave it, now closed out.
    let run_row = dsc_db::fetch_run(&pool, run.id).await?.unwrap();
    assert_eq!(run_row.status, RunStatus::Discarded, "terminal status is preserved");
    assert!(run_row.completed_at.is_some());

    let job_row = dsc_db::fetch_job(&pool, job.id).await?.unwrap();
    assert_eq!(job_row.status, JobStatus::Cancelled);

    // Exactly one port scan ran before the boundary check tripped; the
    // later stages never produced scan rows.
    let scans: Vec<(String,)> =
        sqlx::query_as("select scanner from scans where run_id = $1 order by created_at")
            .bind(run.id)
            .fetch_all(&pool)
            .await?;
    let scanners: Vec<&str> = scans.iter().map(|(s,)| s.as_str()).collect();
    assert_eq!(scanners, vec!["subfinder", "dns_resolve", "nmap"]);

    // Stage 1–2 artifacts survive, provenance intact.
    let mut conn = pool.acquire().await?;
    let assets = dsc_inventory::list_assets(&mut conn, target.id, None).await?;
    let norms: Vec<&str> = assets.iter().map(|a| a.normalized.as_str()).collect();
    assert!(norms.contains(&www.as_str()));
    assert!(norms.contains(&"192.0.2.41"));
    for asset in &assets {
        assert_eq!(asset.first_seen_run_id, Some(run.id));
    }

    // No verification sweep ran for the discarded run.
    let (verify_jobs,): (i64,) = sqlx::query_as(
        "select count(*)::bigint from jobs where run_id = $1 and type in ('verify_asset', 'verify_service')",
    )
    .bind(run.id)
    .fetch_one(&pool)
    .await?;
    assert_eq!(verify_jobs, 0);

    Ok(())
}
