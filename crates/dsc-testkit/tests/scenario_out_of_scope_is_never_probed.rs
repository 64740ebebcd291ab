//! Scenario: Out-of-Scope Discoveries Are Dropped Before Any Probe
//!
//! The enumeration stage returns a name outside the target's allow-list.
//! The scope filter drops it before DNS resolution: no asset row, no edge,
//! no resolution attempt for the foreign name.
//!
//! Skips gracefully when `DSC_DATABASE_URL` is not set.

use serde_json::json;

use dsc_config::Settings;
use dsc_db::RunStatus;
use dsc_testkit::*;
use dsc_worker::Worker;

#[tokio::test]
#[ignore = "requires DSC_DATABASE_URL; see dsc_testkit::DB_HINT"]
async fn foreign_domains_never_enter_the_inventory() -> anyhow::Result<()> {
    let pool = make_pool().await?;
    let root = unique_root("scoped");
    let www = format!("www.{root}");
    let target = make_target(&pool, &root).await?;

    // The resolver knows the foreign name; only the scope filter stands
    // between it and the inventory.
    let resolver = StaticResolver::new()
        .with_entry(&www, &["192.0.2.30"])
        .with_entry("www.evil.test", &["192.0.2.66"]);

    let worker = Worker::with_deps(
        pool.clone(),
        Settings {
            max_concurrent_jobs_global: 100,
            ..Settings::default()
        },
        scripted_pipeline(
            ScriptedScanner::new(
                "subfinder",
                vec![subdomain_result("subfinder", &root, &[&www, "www.evil.test"])],
            ),
            ScriptedScanner::empty("nmap"),
            ScriptedScanner::empty("httpx"),
            ScriptedScanner::empty("nuclei"),
            resolver.clone(),
        ),
        verifier_with_resolver(resolver)?,
    );

    let (run, _) = make_pipeline_job(&pool, target.id, json!({"scheduled": false})).await?;
    drain_queue(&worker).await?;

    let run_row = dsc_db::fetch_run(&pool, run.id).await?.unwrap();
    assert_eq!(run_row.status, RunStatus::Completed);

    let mut conn = pool.acquire().await?;
    let assets = dsc_inventory::list_assets(&mut conn, target.id, None).await?;
    assert!(
        assets.iter().all(|a| !a.normalized.contains("evil")),
        "out-of-scope name must not be recorded: {:?}",
        assets.iter().map(|a| &a.normalized).collect::<Vec<_>>()
    );
    assert!(
        assets.iter().any(|a| a.normalized == www),
        "in-scope name must still be recorded"
    );
    assert!(
        assets.iter().all(|a| a.normalized != "192.0.2.66"),
        "the foreign address must never be resolved into the graph"
    );

    Ok(())
}
