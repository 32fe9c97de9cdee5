//! Database backup scheduler
//!
//! Runs the scheduler as a service, or a single job from the command line.

use anyhow::{Context, Result, anyhow};
use chrono::{Local, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use dbbackup_scheduler::backup::ProcessDumper;
use dbbackup_scheduler::config::AppConfig;
use dbbackup_scheduler::models::{JobId, RunRecord, RunStatus};
use dbbackup_scheduler::notify::LogNotifier;
use dbbackup_scheduler::scheduler::{
    CronTrigger, JobRunner, LockManager, RunReport, SchedulerService, trigger_id,
};
use dbbackup_scheduler::store::{ConfigStore, HistoryStore, MemoryStore, PgHistoryStore};

#[derive(Parser)]
#[command(name = "dbbackup-scheduler", version, about = "Scheduled database backups")]
struct Cli {
    /// Path to the JSON configuration
    #[arg(short, long, global = true, env = "BACKUP_CONFIG", default_value = "config.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the scheduler and run until Ctrl-C
    Serve,
    /// Run one job immediately
    Run { job_id: JobId },
    /// List the triggers that would be installed, with their next fire times
    Jobs,
    /// Show the next firing times of a job
    NextRuns {
        job_id: JobId,
        #[arg(short = 'n', long, default_value_t = 5)]
        count: usize,
    },
    /// Show recent runs of a job
    History {
        job_id: JobId,
        #[arg(short, long, default_value_t = 10)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    match run_app(cli).await {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:?}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(default_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

async fn run_app(cli: Cli) -> Result<()> {
    let app_config = AppConfig::load_from_json(&cli.config).context(format!(
        "Failed to load application configuration from {}",
        cli.config.display()
    ))?;
    init_tracing(&app_config.settings.log_level);

    match cli.command {
        Commands::Jobs => {
            print_jobs(&app_config);
            Ok(())
        }
        Commands::NextRuns { job_id, count } => print_next_runs(&app_config, job_id, count),
        Commands::History { job_id, limit } => {
            let history = history_store(&app_config).await?;
            let runs = history
                .recent_runs(job_id, limit)
                .await
                .context("Failed to read backup history")?;
            if runs.is_empty() {
                println!("No runs recorded for job {}", job_id);
            }
            for run in &runs {
                print_run(run);
            }
            Ok(())
        }
        Commands::Run { job_id } => {
            let runner = build_runner(&app_config).await?;
            match runner.execute(job_id).await {
                RunReport::Completed(record) => {
                    print_run(&record);
                    if record.status == RunStatus::Success {
                        Ok(())
                    } else {
                        Err(anyhow!("Backup job {} failed", job_id))
                    }
                }
                RunReport::Skipped(reason) => Err(anyhow!("Backup job {} skipped: {:?}", job_id, reason)),
            }
        }
        Commands::Serve => {
            let runner = build_runner(&app_config).await?;
            let scheduler = SchedulerService::new(runner, app_config.settings.scheduler_settings());
            let scheduled = scheduler
                .start(&app_config.settings.workspace_root)
                .await
                .context("Failed to start scheduler")?;
            info!(jobs = scheduled, "Scheduler running, press Ctrl-C to stop");

            tokio::signal::ctrl_c().await.context("Failed to listen for shutdown signal")?;
            info!("Shutdown requested, waiting for running jobs");
            scheduler.shutdown().await;
            Ok(())
        }
    }
}

async fn history_store(app_config: &AppConfig) -> Result<Arc<dyn HistoryStore>> {
    match &app_config.settings.history_database_url {
        Some(url) => {
            let store = PgHistoryStore::connect(url)
                .await
                .context("Failed to connect to the history database")?;
            Ok(Arc::new(store))
        }
        None => Ok(Arc::new(MemoryStore::default())),
    }
}

async fn build_runner(app_config: &AppConfig) -> Result<JobRunner> {
    let settings = &app_config.settings;
    let config: Arc<dyn ConfigStore> = Arc::new(app_config.memory_store());
    let history = history_store(app_config).await?;
    let locks = LockManager::new(settings.lock_dir.clone())
        .with_context(|| format!("Lock directory {} is not usable", settings.lock_dir.display()))?;

    Ok(JobRunner::new(
        config,
        history,
        Arc::new(ProcessDumper::new()),
        Arc::new(LogNotifier),
        locks,
        settings.runner_settings(),
    ))
}

fn print_jobs(app_config: &AppConfig) {
    let now = Utc::now();
    for job in &app_config.jobs {
        let next_run = if job.is_active {
            CronTrigger::parse(&job.cron_expression())
                .ok()
                .and_then(|trigger| trigger.next_fire_after(now))
                .map(|at| at.format("%Y-%m-%d %H:%M:%S UTC").to_string())
                .unwrap_or_else(|| "Not scheduled".to_string())
        } else {
            "inactive".to_string()
        };
        println!(
            "{:<16} {:<24} {:<8} {:<16} {:<24} {}",
            trigger_id(job.id),
            job.name,
            job.cadence(),
            job.cron_expression(),
            next_run,
            job.schedule_folder()
        );
    }
}

fn print_next_runs(app_config: &AppConfig, job_id: JobId, count: usize) -> Result<()> {
    let job = app_config
        .jobs
        .iter()
        .find(|job| job.id == job_id)
        .ok_or_else(|| anyhow!("Job {} not found", job_id))?;
    let trigger = CronTrigger::parse(&job.cron_expression())?;
    println!("{} ({})", job.name, trigger.describe());
    for at in trigger.next_fire_times(Utc::now(), count) {
        println!(
            "  {}  ({} local)",
            at.format("%Y-%m-%d %H:%M UTC"),
            at.with_timezone(&Local).format("%Y-%m-%d %H:%M")
        );
    }
    Ok(())
}

fn print_run(run: &RunRecord) {
    println!(
        "#{} job {} {} started {} ended {} size {} {}",
        run.id,
        run.job_id,
        run.status,
        run.start_time.format("%Y-%m-%d %H:%M:%S"),
        run.end_time
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "-".to_string()),
        run.byte_size.unwrap_or(0),
        run.message.as_deref().unwrap_or("")
    );
    if let Some(locator) = &run.locator {
        println!("    {}", locator);
    }
}
