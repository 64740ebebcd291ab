//! dsc-worker entry point.
//!
//! Thin main: tracing, settings, pool, then the claim/execute loop until
//! ctrl-c.

use anyhow::Context;
use tracing::info;

use dsc_config::Settings;
use dsc_worker::Worker;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dsc_config::load_dotenv();
    init_tracing();

    let settings = Settings::from_env();
    let pool = dsc_db::connect_from_env().await?;
    dsc_db::migrate(&pool).await?;

    let worker = Worker::new(pool, settings).context("worker wiring failed")?;
    info!(worker_id = worker.worker_id(), "dsc-worker started");

    tokio::select! {
        result = worker.run_forever() => result,
        _ = tokio::signal::ctrl_c() => {
            info!("dsc-worker shutting down");
            Ok(())
        }
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}
