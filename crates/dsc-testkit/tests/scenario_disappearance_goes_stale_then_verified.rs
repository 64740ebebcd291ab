//! Scenario: Disappearance → Stale → Verified Dead
//!
//! Run the pipeline twice. The second pass sees nothing: every asset from
//! pass one goes `stale` with reason `not_seen_in_run:<run2>`, verification
//! jobs are enqueued, and the verifier concludes `unresolved` (the name no
//! longer resolves) or `closed` (the endpoint no longer answers).
//!
//! Addresses use the TEST-NET-1 block (192.0.2.0/24) so the service probe
//! never reaches a live host.
//!
//! Skips gracefully when `DSC_DATABASE_URL` is not set.

use serde_json::json;

use dsc_config::Settings;
use dsc_db::RunStatus;
use dsc_inventory::{stale_reason, LifecycleStatus};
use dsc_scan::AssetType;
use dsc_testkit::*;
use dsc_worker::Worker;

fn settings() -> Settings {
    Settings {
        max_concurrent_jobs_global: 100,
        ..Settings::default()
    }
}

#[tokio::test]
#[ignore = "requires DSC_DATABASE_URL; see dsc_testkit::DB_HINT; performs local-only network probes against TEST-NET addresses"]
async fn vanished_assets_go_stale_and_verify_dead() -> anyhow::Result<()> {
    let pool = make_pool().await?;
    let root = unique_root("vanish");
    let www = format!("www.{root}");
    let url = format!("http://{www}");
    let target = make_target(&pool, &root).await?;

    // Pass 1: the asset exists.
    let resolver = StaticResolver::new().with_entry(&www, &["192.0.2.10"]);
    let worker = Worker::with_deps(
        pool.clone(),
        settings(),
        scripted_pipeline(
            ScriptedScanner::new("subfinder", vec![subdomain_result("subfinder", &root, &[&www])]),
            ScriptedScanner::new("nmap", vec![nmap_result("nmap", "192.0.2.10", &[(80, "http")])]),
            ScriptedScanner::new("httpx", vec![httpx_result("httpx", &root, &[(&url, &www)])]),
            ScriptedScanner::empty("nuclei"),
            resolver.clone(),
        ),
        verifier_with_resolver(resolver.clone())?,
    );
    make_pipeline_job(&pool, target.id, json!({"scheduled": false})).await?;
    drain_queue(&worker).await?;

    // Pass 2: the world went dark. Subfinder finds nothing, the name no
    // longer resolves.
    resolver.remove(&www);
    let worker = Worker::with_deps(
        pool.clone(),
        settings(),
        scripted_pipeline(
            ScriptedScanner::empty("subfinder"),
            ScriptedScanner::empty("nmap"),
            ScriptedScanner::empty("httpx"),
            ScriptedScanner::empty("nuclei"),
            resolver.clone(),
        ),
        verifier_with_resolver(resolver.clone())?,
    );
    let (run2, _job) = make_pipeline_job(&pool, target.id, json!({"scheduled": false})).await?;

    // Process the pipeline job only, then inspect the intermediate state.
    assert!(worker.tick().await?, "pipeline job must be claimable");

    let run_row = dsc_db::fetch_run(&pool, run2.id).await?.unwrap();
    assert_eq!(run_row.status, RunStatus::Completed);

    {
        let mut conn = pool.acquire().await?;
        let stale = dsc_inventory::list_assets(&mut conn, target.id, Some(LifecycleStatus::Stale))
            .await?;
        let mut kinds: Vec<&str> = stale.iter().map(|a| a.asset_type.as_str()).collect();
        kinds.sort_unstable();
        assert_eq!(kinds, vec!["subdomain", "url"], "sweep covers subdomains and urls");
        for asset in &stale {
            assert_eq!(asset.status_reason.as_deref(), Some(stale_reason(run2.id).as_str()));
        }

        let stale_services =
            dsc_inventory::list_services(&mut conn, target.id, Some(LifecycleStatus::Stale)).await?;
        assert_eq!(stale_services.len(), 1, "the service is swept regardless of type");
    }

    let (verify_jobs,): (i64,) = sqlx::query_as(
        "select count(*)::bigint from jobs where target_id = $1 and type in ('verify_asset', 'verify_service') and run_id = $2",
    )
    .bind(target.id)
    .bind(run2.id)
    .fetch_one(&pool)
    .await?;
    assert_eq!(verify_jobs, 3, "one per stale asset plus the service");

    // Let the verifier work through the queue.
    drain_queue(&worker).await?;

    let mut conn = pool.acquire().await?;
    let assets = dsc_inventory::list_assets(&mut conn, target.id, None).await?;

    let sub = assets
        .iter()
        .find(|a| a.asset_type == AssetType::Subdomain)
        .unwrap();
    assert_eq!(sub.status, LifecycleStatus::Unresolved, "NXDOMAIN concludes unresolved");
    assert_eq!(sub.status_reason.as_deref(), Some("NXDOMAIN"));
    assert_eq!(sub.verified_run_id, Some(run2.id));
    assert!(sub.verified_at.is_some());

    let url_asset = assets.iter().find(|a| a.asset_type == AssetType::Url).unwrap();
    assert!(
        matches!(url_asset.status, LifecycleStatus::Closed | LifecycleStatus::Unresolved),
        "dead URL concludes closed or unresolved, got {:?}",
        url_asset.status
    );
    assert_eq!(url_asset.verified_run_id, Some(run2.id));

    let services = dsc_inventory::list_services(&mut conn, target.id, None).await?;
    assert!(
        matches!(
            services[0].status,
            LifecycleStatus::Closed | LifecycleStatus::Unresolved
        ),
        "dead service concludes closed or unresolved, got {:?}",
        services[0].status
    );
    assert_eq!(services[0].verified_run_id, Some(run2.id));

    // Every verification left a scan row behind.
    let (verify_scans,): (i64,) = sqlx::query_as(
        "select count(*)::bigint from scans where target_id = $1 and scanner in ('verify_asset', 'verify_service') and status = 'completed'",
    )
    .bind(target.id)
    .fetch_one(&pool)
    .await?;
    assert_eq!(verify_scans, 3, "verification conclusions are normal completions");

    Ok(())
}
