//! Scenario: Re-Observation Resurrects With Provenance Intact
//!
//! Three passes: seen, vanished (verified unresolved), seen again. The
//! third sighting returns the subdomain to `active`, clears the status
//! reason, and leaves `first_seen_run_id` pointing at the very first run.
//!
//! Skips gracefully when `DSC_DATABASE_URL` is not set.

use serde_json::json;

use dsc_config::Settings;
use dsc_inventory::LifecycleStatus;
use dsc_scan::AssetType;
use dsc_testkit::*;
use dsc_worker::Worker;

fn settings() -> Settings {
    Settings {
        max_concurrent_jobs_global: 100,
        ..Settings::default()
    }
}

fn pass_worker(
    pool: &sqlx::PgPool,
    resolver: &StaticResolver,
    subfinder: ScriptedScanner,
) -> anyhow::Result<Worker> {
    Ok(Worker::with_deps(
        pool.clone(),
        settings(),
        scripted_pipeline(
            subfinder,
            ScriptedScanner::empty("nmap"),
            ScriptedScanner::empty("httpx"),
            ScriptedScanner::empty("nuclei"),
            resolver.clone(),
        ),
        verifier_with_resolver(resolver.clone())?,
    ))
}

#[tokio::test]
#[ignore = "requires DSC_DATABASE_URL; see dsc_testkit::DB_HINT"]
async fn third_sighting_restores_active_with_original_first_seen() -> anyhow::Result<()> {
    let pool = make_pool().await?;
    let root = unique_root("lazarus");
    let www = format!("www.{root}");
    let target = make_target(&pool, &root).await?;

    let resolver = StaticResolver::new().with_entry(&www, &["192.0.2.20"]);

    // Pass 1: first sight.
    let worker = pass_worker(
        &pool,
        &resolver,
        ScriptedScanner::new("subfinder", vec![subdomain_result("subfinder", &root, &[&www])]),
    )?;
    let (run1, _) = make_pipeline_job(&pool, target.id, json!({"scheduled": false})).await?;
    drain_queue(&worker).await?;

    // Pass 2: vanished; verification concludes unresolved.
    resolver.remove(&www);
    let worker = pass_worker(&pool, &resolver, ScriptedScanner::empty("subfinder"))?;
    make_pipeline_job(&pool, target.id, json!({"scheduled": false})).await?;
    drain_queue(&worker).await?;

    {
        let mut conn = pool.acquire().await?;
        let assets = dsc_inventory::list_assets(&mut conn, target.id, None).await?;
        let sub = assets.iter().find(|a| a.asset_type == AssetType::Subdomain).unwrap();
        assert_eq!(sub.status, LifecycleStatus::Unresolved, "pass 2 must bury the asset");
    }

    // Pass 3: back from the dead.
    resolver.set(&www, &["192.0.2.21"]);
    let worker = pass_worker(
        &pool,
        &resolver,
        ScriptedScanner::new("subfinder", vec![subdomain_result("subfinder", &root, &[&www])]),
    )?;
    let (run3, _) = make_pipeline_job(&pool, target.id, json!({"scheduled": false})).await?;
    drain_queue(&worker).await?;

    let mut conn = pool.acquire().await?;
    let assets = dsc_inventory::list_assets(&mut conn, target.id, None).await?;
    let sub = assets.iter().find(|a| a.asset_type == AssetType::Subdomain).unwrap();

    assert_eq!(sub.status, LifecycleStatus::Active);
    assert_eq!(sub.status_reason, None, "resurrection clears the reason");
    assert_eq!(sub.first_seen_run_id, Some(run1.id), "first sight is forever");
    assert_eq!(sub.last_seen_run_id, Some(run3.id));

    // The new address was picked up on the way back.
    let ips: Vec<&str> = assets
        .iter()
        .filter(|a| a.asset_type == AssetType::Ip)
        .map(|a| a.normalized.as_str())
        .collect();
    assert!(ips.contains(&"192.0.2.21"), "pass 3 address must be recorded, got {ips:?}");

    Ok(())
}
