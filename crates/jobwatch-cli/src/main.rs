use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use jobwatch_pipeline::{
    maybe_build_scheduler, HealthReport, LogSink, PipelineConfig, ReportSink, RunOptions, RunReport, Runner,
};
use jobwatch_storage::{JobStore, MemoryJobStore, PgJobStore};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "jobwatch")]
#[command(about = "Internship job aggregation pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch every enabled watchlist target once.
    Run {
        /// Fetch, normalize and filter without persisting or notifying.
        #[arg(long)]
        dry_run: bool,
        /// Only targets whose company contains this text.
        #[arg(long)]
        company: Option<String>,
    },
    /// Apply database migrations.
    Migrate,
    /// Mark jobs not seen for a number of days inactive.
    Cleanup {
        #[arg(long)]
        days: Option<i64>,
        #[arg(long)]
        dry_run: bool,
    },
    /// Run on the configured cron schedule until interrupted.
    Schedule,
    /// Show fetch health per watchlist target, worst first.
    Health {
        /// Only targets with at least this many consecutive failures.
        #[arg(long, default_value_t = 0)]
        min_failures: u32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();

    let cli = Cli::parse();
    let config = PipelineConfig::from_env();

    match cli.command.unwrap_or(Commands::Run {
        dry_run: false,
        company: None,
    }) {
        Commands::Run { dry_run, company } => {
            let store: Arc<dyn JobStore> = if dry_run {
                Arc::new(MemoryJobStore::new())
            } else {
                Arc::new(connect(&config).await?)
            };
            let runner = build_runner(config, store)?;
            let report = runner
                .run_watchlist(&RunOptions {
                    dry_run,
                    company_filter: company,
                })
                .await?;
            print_summary(&report);
        }
        Commands::Migrate => {
            connect(&config).await?.migrate().await?;
            println!("migrations applied");
        }
        Commands::Cleanup { days, dry_run } => {
            let days = days.unwrap_or(config.stale_days);
            let store = Arc::new(connect(&config).await?);
            let runner = build_runner(config, store)?;
            let report = runner.cleanup(days, dry_run).await?;
            let verb = if dry_run { "would deactivate" } else { "deactivated" };
            println!("cleanup: {verb} {} jobs not seen since {}", report.stale, report.cutoff);
        }
        Commands::Schedule => {
            let mut config = config;
            config.scheduler_enabled = true;
            let store = Arc::new(connect(&config).await?);
            let runner = Arc::new(build_runner(config, store)?);
            let cron = runner.config().cron.clone();
            let mut sched = maybe_build_scheduler(runner)
                .await?
                .context("scheduler disabled")?;
            sched.start().await.context("starting scheduler")?;
            tracing::info!(%cron, "scheduler running; ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Health { min_failures } => {
            let store = Arc::new(connect(&config).await?);
            let runner = build_runner(config, store)?;
            print_health(&runner.health(min_failures).await?);
        }
    }

    Ok(())
}

async fn connect(config: &PipelineConfig) -> Result<PgJobStore> {
    PgJobStore::connect(&config.database_url)
        .await
        .context("connecting to DATABASE_URL")
}

fn build_runner(config: PipelineConfig, store: Arc<dyn JobStore>) -> Result<Runner> {
    let reports_dir = config.reports_dir.clone();
    Ok(Runner::from_config(config, store)?
        .with_sink(Arc::new(LogSink))
        .with_sink(Arc::new(ReportSink::new(reports_dir))))
}

fn print_summary(report: &RunReport) {
    let stats = &report.stats;
    println!(
        "run complete: run_id={} dry_run={} companies={} fetched={} filtered={} invalid={} new={} updated={} duplicates={} notifications={} errors={}",
        report.run_id,
        report.dry_run,
        stats.companies_processed,
        stats.jobs_fetched,
        stats.jobs_filtered,
        stats.jobs_invalid,
        stats.jobs_new,
        stats.jobs_updated,
        stats.duplicates_flagged,
        stats.notifications_sent,
        stats.errors
    );
    for (reason, count) in &stats.filter_reasons {
        println!("  filtered {reason}: {count}");
    }
}

fn print_health(report: &HealthReport) {
    let summary = &report.summary;
    println!(
        "targets={} healthy={} degraded={} failed={}",
        summary.total, summary.healthy, summary.degraded, summary.failed
    );
    for target in &report.targets {
        println!(
            "  {:<16} {:<28} {:<11} failures={} successes={} {}",
            target.status.as_str(),
            target.company,
            target.ats_type,
            target.failure_count,
            target.success_count,
            target.last_error.as_deref().unwrap_or("")
        );
    }
}
