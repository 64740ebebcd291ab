use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use uuid::Uuid;

use dsc_db::{JobType, NewJob, RunTrigger};
use dsc_normalize::normalize_domain;

#[derive(Parser)]
#[command(name = "dsc")]
#[command(about = "driftscan operator CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Database commands
    Db {
        #[command(subcommand)]
        cmd: DbCmd,
    },

    /// Target commands
    Target {
        #[command(subcommand)]
        cmd: TargetCmd,
    },

    /// Pipeline commands
    Pipeline {
        #[command(subcommand)]
        cmd: PipelineCmd,
    },

    /// Run commands
    Run {
        #[command(subcommand)]
        cmd: RunCmd,
    },

    /// Schedule commands
    Schedule {
        #[command(subcommand)]
        cmd: ScheduleCmd,
    },

    /// Fail orphaned running jobs/runs/scans (single-process recovery)
    Recover,
}

#[derive(Subcommand)]
enum DbCmd {
    Status,
    Migrate,
}

#[derive(Subcommand)]
enum TargetCmd {
    /// Register a target (idempotent on root domain)
    Add {
        root_domain: String,

        /// Display name; defaults to the root domain
        #[arg(long)]
        name: Option<String>,
    },
    List,
}

#[derive(Subcommand)]
enum PipelineCmd {
    /// Create a queued run + run_pipeline job for a target
    Trigger {
        target_id: Uuid,

        #[arg(long)]
        max_hosts: Option<u64>,

        #[arg(long)]
        max_http_targets: Option<u64>,
    },
}

#[derive(Subcommand)]
enum RunCmd {
    /// Discard a run and cancel its live jobs
    Discard {
        run_id: Uuid,

        #[arg(long)]
        reason: Option<String>,
    },
    /// Show a run
    Show { run_id: Uuid },
}

#[derive(Subcommand)]
enum ScheduleCmd {
    /// Add a recurring pipeline schedule for a target
    Add {
        target_id: Uuid,

        /// Firing interval; minimum 60
        #[arg(long, default_value_t = 86400)]
        interval_seconds: i64,
    },
    List {
        target_id: Uuid,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dsc_config::load_dotenv();
    let cli = Cli::parse();

    let pool = dsc_db::connect_from_env().await?;

    match cli.cmd {
        Commands::Db { cmd } => match cmd {
            DbCmd::Status => {
                let s = dsc_db::status(&pool).await?;
                println!("db_ok={} has_jobs_table={}", s.ok, s.has_jobs_table);
            }
            DbCmd::Migrate => {
                dsc_db::migrate(&pool).await?;
                println!("migrations_applied=true");
            }
        },

        Commands::Target { cmd } => match cmd {
            TargetCmd::Add { root_domain, name } => {
                let root = normalize_domain(&root_domain);
                if root.is_empty() {
                    return Err(anyhow!("invalid root domain: {root_domain:?}"));
                }
                let t = dsc_db::get_or_create_target(&pool, &root, name.as_deref(), None).await?;
                println!("target_id={} root_domain={}", t.id, t.root_domain);
            }
            TargetCmd::List => {
                for t in dsc_db::list_targets(&pool).await? {
                    println!("{}  {}  {}", t.id, t.root_domain, t.name);
                }
            }
        },

        Commands::Pipeline { cmd } => match cmd {
            PipelineCmd::Trigger {
                target_id,
                max_hosts,
                max_http_targets,
            } => {
                if dsc_db::fetch_target(&pool, target_id).await?.is_none() {
                    return Err(anyhow!("target {target_id} not found"));
                }
                let mut conn = pool.acquire().await?;
                let run = dsc_db::create_run(&mut conn, target_id, RunTrigger::Manual).await?;
                let job = dsc_db::enqueue_job(
                    &mut conn,
                    &NewJob {
                        job_type: JobType::RunPipeline,
                        target_id,
                        run_id: Some(run.id),
                        payload: json!({
                            "max_hosts": max_hosts,
                            "max_http_targets": max_http_targets,
                            "scheduled": false,
                        }),
                        available_at: None,
                    },
                )
                .await?;
                println!("run_id={} job_id={}", run.id, job.id);
            }
        },

        Commands::Run { cmd } => match cmd {
            RunCmd::Discard { run_id, reason } => {
                let discarded = dsc_db::discard_run(
                    &pool,
                    run_id,
                    reason.as_deref().unwrap_or("discarded_by_operator"),
                )
                .await?;
                println!("run_id={run_id} discarded={discarded}");
            }
            RunCmd::Show { run_id } => {
                let run = dsc_db::fetch_run(&pool, run_id)
                    .await?
                    .ok_or_else(|| anyhow!("run {run_id} not found"))?;
                println!(
                    "run_id={} target_id={} trigger={} status={} started_at={:?} completed_at={:?}",
                    run.id,
                    run.target_id,
                    run.trigger.as_str(),
                    run.status.as_str(),
                    run.started_at,
                    run.completed_at,
                );
            }
        },

        Commands::Schedule { cmd } => match cmd {
            ScheduleCmd::Add {
                target_id,
                interval_seconds,
            } => {
                let s = dsc_db::create_schedule(
                    &pool,
                    &dsc_db::NewSchedule {
                        target_id,
                        enabled: true,
                        interval_seconds,
                        next_run_at: None,
                        pipeline_config: None,
                    },
                )
                .await?;
                println!("schedule_id={} interval_seconds={}", s.id, s.interval_seconds);
            }
            ScheduleCmd::List { target_id } => {
                for s in dsc_db::list_schedules(&pool, target_id).await? {
                    println!(
                        "{}  enabled={}  interval={}s  next_run_at={:?}",
                        s.id, s.enabled, s.interval_seconds, s.next_run_at
                    );
                }
            }
        },

        Commands::Recover => {
            let summary = dsc_db::recover_orphans(&pool).await?;
            println!(
                "jobs_failed={} runs_failed={} scans_failed={}",
                summary.jobs_failed, summary.runs_failed, summary.scans_failed
            );
        }
    }

    Ok(())
}
