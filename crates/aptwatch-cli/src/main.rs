use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use aptwatch_core::{ComplexSummary, DayRule, ScheduleEntry, ScheduledTask};
use aptwatch_pipeline::{CrawlManager, PipelineConfig, ScheduleStore, Ticker};
use aptwatch_source::{BackoffPolicy, HttpClientConfig, PortalSource, ScrapeSource};
use aptwatch_store::{MemStore, PgStore, TrackerStore};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "aptwatch")]
#[command(about = "Apartment listing watch: crawl, diff and serve listing changes")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the web API and the schedule tick loop.
    Serve,
    /// Crawl one complex and wait for the result.
    Crawl {
        complex_id: String,
        /// Register the complex under this name first if it is unknown.
        #[arg(long)]
        register: Option<String>,
    },
    /// Crawl every registered complex as one batch job.
    CrawlAll,
    /// Create the database schema (idempotent).
    Migrate,
    /// Inspect and edit recurring schedules.
    Schedule {
        #[command(subcommand)]
        action: ScheduleAction,
    },
}

#[derive(Debug, Subcommand)]
enum ScheduleAction {
    List,
    Add {
        name: String,
        /// crawl_all_complexes or cleanup_snapshots
        task: String,
        #[arg(long)]
        hour: u32,
        #[arg(long)]
        minute: u32,
        /// "*", "0".."6" (0=Sunday), MONTHLY_n or QUARTERLY_n
        #[arg(long, default_value = "*")]
        day: String,
        #[arg(long)]
        description: Option<String>,
    },
    Remove {
        name: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = PipelineConfig::from_env();

    match cli.command {
        Commands::Serve => serve(config).await,
        Commands::Crawl {
            complex_id,
            register,
        } => crawl_one(config, &complex_id, register).await,
        Commands::CrawlAll => crawl_all(config).await,
        Commands::Migrate => migrate(config).await,
        Commands::Schedule { action } => schedule(config, action).await,
    }
}

async fn build_store(config: &PipelineConfig) -> Result<Arc<dyn TrackerStore>> {
    match &config.database_url {
        Some(url) => {
            let store = PgStore::connect(url)
                .await
                .context("connecting to database")?;
            store.init_schema().await?;
            Ok(Arc::new(store))
        }
        None => {
            warn!("DATABASE_URL not set, using in-memory store (state is lost on exit)");
            Ok(Arc::new(MemStore::new()))
        }
    }
}

fn build_source(config: &PipelineConfig) -> Result<Arc<dyn ScrapeSource>> {
    let source = PortalSource::new(
        config.portal_base_url.clone(),
        HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: config.user_agent.clone(),
            backoff: BackoffPolicy::default(),
        },
    )
    .context("building portal client")?;
    Ok(Arc::new(source))
}

async fn build_manager(config: &PipelineConfig) -> Result<Arc<CrawlManager>> {
    let store = build_store(config).await?;
    let source = build_source(config)?;
    Ok(CrawlManager::new(store, source, config.manager_config()))
}

async fn serve(config: PipelineConfig) -> Result<()> {
    let manager = build_manager(&config).await?;
    let schedules = Arc::new(ScheduleStore::load(&config.schedule_file)?);
    info!(schedules = schedules.list().await.len(), "schedules loaded");

    let ticker = Ticker::new(schedules.clone(), manager.clone(), &config);
    tokio::spawn(ticker.run());

    let state = aptwatch_web::AppState::new(manager, schedules);
    aptwatch_web::serve(state, config.bind_port).await
}

async fn crawl_one(
    config: PipelineConfig,
    complex_id: &str,
    register: Option<String>,
) -> Result<()> {
    let manager = build_manager(&config).await?;
    if let Some(name) = register {
        manager
            .store()
            .register_complex(&ComplexSummary {
                complex_id: complex_id.to_string(),
                name,
            })
            .await?;
    }

    let job_id = manager.trigger(complex_id).await?;
    manager.wait(job_id).await;
    report_job(&manager, job_id).await
}

async fn crawl_all(config: PipelineConfig) -> Result<()> {
    let manager = build_manager(&config).await?;
    let job_id = manager.trigger_all().await?;
    manager.wait(job_id).await;
    report_job(&manager, job_id).await
}

async fn report_job(manager: &Arc<CrawlManager>, job_id: uuid::Uuid) -> Result<()> {
    let job = manager.status(job_id).await?;
    println!(
        "job {} finished: status={:?} collected={} new={} updated={} skipped={}",
        job.job_id,
        job.status,
        job.articles_collected,
        job.articles_new,
        job.articles_updated,
        job.articles_skipped
    );
    if let Some(message) = job.error_message {
        println!("error: {message}");
    }
    Ok(())
}

async fn migrate(config: PipelineConfig) -> Result<()> {
    let Some(url) = config.database_url else {
        bail!("DATABASE_URL must be set for migrate");
    };
    let store = PgStore::connect(&url).await.context("connecting to database")?;
    store.init_schema().await?;
    println!("schema ready");
    Ok(())
}

async fn schedule(config: PipelineConfig, action: ScheduleAction) -> Result<()> {
    let store = ScheduleStore::load(&config.schedule_file)?;
    match action {
        ScheduleAction::List => {
            for entry in store.list().await {
                println!(
                    "{}: {:?} at {:02}:{:02} on {} ({})",
                    entry.name,
                    entry.task,
                    entry.hour,
                    entry.minute,
                    entry.day_of_week,
                    if entry.enabled { "enabled" } else { "disabled" }
                );
            }
        }
        ScheduleAction::Add {
            name,
            task,
            hour,
            minute,
            day,
            description,
        } => {
            let task = match task.as_str() {
                "crawl_all_complexes" => ScheduledTask::CrawlAllComplexes,
                "cleanup_snapshots" => ScheduledTask::CleanupSnapshots,
                other => bail!("unknown task: {other}"),
            };
            let day_of_week: DayRule = day.parse().map_err(anyhow::Error::msg)?;
            store
                .create(ScheduleEntry {
                    name: name.clone(),
                    task,
                    hour,
                    minute,
                    day_of_week,
                    enabled: true,
                    description,
                })
                .await?;
            println!("schedule '{name}' created");
        }
        ScheduleAction::Remove { name } => {
            store.delete(&name).await?;
            println!("schedule '{name}' removed");
        }
    }
    Ok(())
}
