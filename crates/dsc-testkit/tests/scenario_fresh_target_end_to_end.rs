//! Scenario: Fresh Target, Full Pipeline, Green Path
//!
//! Trigger a pipeline against a brand-new target with scripted probes:
//! subfinder finds one subdomain, DNS resolves it, nmap sees one http port,
//! httpx confirms one live URL, nuclei finds nothing.
//!
//! Expected end state: one completed run; four assets (subdomain, ip, host,
//! url); one service; two edges (`resolves_to`, `serves`); zero
//! verification jobs, since nothing disappeared on a first sight.
//!
//! Skips gracefully when `DSC_DATABASE_URL` is not set.

use serde_json::json;

use dsc_config::Settings;
use dsc_db::{JobStatus, RunStatus};
use dsc_inventory::LifecycleStatus;
use dsc_scan::AssetType;
use dsc_testkit::*;
use dsc_worker::Worker;

#[tokio::test]
#[ignore = "requires DSC_DATABASE_URL; see dsc_testkit::DB_HINT"]
async fn fresh_target_builds_the_expected_graph() -> anyhow::Result<()> {
    let pool = make_pool().await?;
    let root = unique_root("fresh");
    let www = format!("www.{root}");
    let url = format!("http://{www}");
    let target = make_target(&pool, &root).await?;

    let resolver = StaticResolver::new().with_entry(&www, &["192.0.2.10"]);
    let deps = scripted_pipeline(
        ScriptedScanner::new("subfinder", vec![subdomain_result("subfinder", &root, &[&www])]),
        ScriptedScanner::new("nmap", vec![nmap_result("nmap", "192.0.2.10", &[(80, "http")])]),
        ScriptedScanner::new("httpx", vec![httpx_result("httpx", &root, &[(&url, &www)])]),
        ScriptedScanner::empty("nuclei"),
        resolver.clone(),
    );
    let worker = Worker::with_deps(
        pool.clone(),
        Settings {
            max_concurrent_jobs_global: 100,
            ..Settings::default()
        },
        deps,
        verifier_with_resolver(resolver)?,
    );

    let (run, job) = make_pipeline_job(
        &pool,
        target.id,
        json!({"max_hosts": 1, "max_http_targets": 1, "scheduled": false}),
    )
    .await?;

    let processed = drain_queue(&worker).await?;
    assert_eq!(processed, 1, "one pipeline job, zero verification jobs");

    let run_row = dsc_db::fetch_run(&pool, run.id).await?.unwrap();
    assert_eq!(run_row.status, RunStatus::Completed);
    assert!(run_row.started_at.is_some());
    assert!(run_row.completed_at.is_some());

    let job_row = dsc_db::fetch_job(&pool, job.id).await?.unwrap();
    assert_eq!(job_row.status, JobStatus::Completed);
    assert_eq!(job_row.attempts, 1);

    // The inventory graph: subdomain, ip, host, url. All active, all
    // stamped with this run as first and last sight.
    let mut conn = pool.acquire().await?;
    let assets = dsc_inventory::list_assets(&mut conn, target.id, None).await?;
    let mut kinds: Vec<&str> = assets.iter().map(|a| a.asset_type.as_str()).collect();
    kinds.sort_unstable();
    assert_eq!(kinds, vec!["host", "ip", "subdomain", "url"]);
    for asset in &assets {
        assert_eq!(asset.status, LifecycleStatus::Active, "{} must be active", asset.normalized);
        assert_eq!(asset.first_seen_run_id, Some(run.id));
        assert_eq!(asset.last_seen_run_id, Some(run.id));
    }
    let url_asset = assets.iter().find(|a| a.asset_type == AssetType::Url).unwrap();
    assert_eq!(url_asset.normalized, format!("http://{www}/"));

    let services = dsc_inventory::list_services(&mut conn, target.id, None).await?;
    assert_eq!(services.len(), 1);
    assert_eq!(services[0].port, 80);
    assert_eq!(services[0].status, LifecycleStatus::Active);

    let (edges, rels): (i64, Vec<String>) = {
        let rows: Vec<(String,)> =
            sqlx::query_as("select rel_type from edges where target_id = $1 order by rel_type")
                .bind(target.id)
                .fetch_all(&pool)
                .await?;
        (rows.len() as i64, rows.into_iter().map(|(r,)| r).collect())
    };
    assert_eq!(edges, 2);
    assert_eq!(rels, vec!["resolves_to", "serves"]);

    // No disappearances on first sight: the sweep enqueued nothing.
    let (verify_jobs,): (i64,) = sqlx::query_as(
        "select count(*)::bigint from jobs where target_id = $1 and type in ('verify_asset', 'verify_service')",
    )
    .bind(target.id)
    .fetch_one(&pool)
    .await?;
    assert_eq!(verify_jobs, 0);

    Ok(())
}
