//! dsc-scheduler entry point.

use tracing::info;

use dsc_config::Settings;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dsc_config::load_dotenv();
    init_tracing();

    let settings = Settings::from_env();
    let pool = dsc_db::connect_from_env().await?;
    dsc_db::migrate(&pool).await?;

    info!(
        poll_seconds = settings.scheduler_poll.as_secs(),
        "dsc-scheduler started"
    );

    tokio::select! {
        result = dsc_scheduler::run_forever(&pool, &settings) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("dsc-scheduler shutting down");
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
