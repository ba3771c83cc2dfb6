use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use url::Url;

use roost_client::{ReqwestFetcher, default_registry};
use roost_core::job::{JobKind, JobStatus, NewScrapeJob, Priority, ScrapeJob, SearchCriteria};
use roost_core::models::{PropertyType, Source};
use roost_core::traits::{JobStore, PropertyStore};
use roost_core::{MemoryStore, Orchestrator, PipelineConfig};
use roost_db::{Database, DatabaseConfig};

#[derive(Parser)]
#[command(name = "roost", version, about = "Real-estate listing acquisition pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scrape a single listing page
    Scrape {
        /// Listing URL
        #[arg(short, long)]
        url: String,

        /// Source site (inferred from the URL host when omitted)
        #[arg(short, long)]
        source: Option<Source>,

        #[arg(short, long, default_value = "high")]
        priority: Priority,
    },

    /// Search one or more sources by location and filters
    Search {
        /// Sources to search (repeatable; all sources when omitted)
        #[arg(short, long = "source", env = "ROOST_SOURCES", value_delimiter = ',')]
        sources: Vec<Source>,

        #[command(flatten)]
        criteria: CriteriaArgs,

        #[arg(short, long, default_value = "medium")]
        priority: Priority,
    },

    /// Run a batch of listing URLs read from a file
    ///
    /// One job per line: either `<source> <url>` or a bare URL.
    /// Blank lines and lines starting with `#` are skipped.
    Run {
        #[arg(short, long)]
        file: PathBuf,

        #[arg(short, long, default_value = "low")]
        priority: Priority,
    },

    /// Show job and property counts (requires DATABASE_URL)
    Stats {
        /// Number of dead-lettered jobs to list
        #[arg(short, long, default_value_t = 10)]
        limit: usize,
    },
}

#[derive(Args)]
struct CriteriaArgs {
    #[arg(long)]
    city: Option<String>,

    #[arg(long)]
    zip: Option<String>,

    #[arg(long)]
    min_price: Option<u64>,

    #[arg(long)]
    max_price: Option<u64>,

    #[arg(long)]
    min_beds: Option<u32>,

    #[arg(long)]
    min_baths: Option<f32>,

    #[arg(long)]
    min_sqft: Option<u32>,

    /// e.g. "single-family", "condo", "townhouse"
    #[arg(long)]
    property_type: Option<PropertyType>,
}

impl From<CriteriaArgs> for SearchCriteria {
    fn from(args: CriteriaArgs) -> Self {
        SearchCriteria {
            city: args.city,
            zip_code: args.zip,
            min_price: args.min_price,
            max_price: args.max_price,
            min_beds: args.min_beds,
            min_baths: args.min_baths,
            min_sqft: args.min_sqft,
            property_type: args.property_type,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Setup tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("roost=info".parse()?))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Scrape {
            url,
            source,
            priority,
        } => {
            let source = match source {
                Some(source) => source,
                None => infer_source(&url)
                    .with_context(|| format!("Cannot tell the source of {url}; pass --source"))?,
            };
            let request = NewScrapeJob::url(source, url)
                .with_priority(priority)
                .with_kind(JobKind::UserTriggered);
            cmd_submit(vec![request]).await?;
        }
        Commands::Search {
            sources,
            criteria,
            priority,
        } => {
            let criteria = SearchCriteria::from(criteria);
            if !criteria.has_location() {
                bail!("A search needs --city or --zip");
            }
            let sources = if sources.is_empty() {
                Source::ALL.to_vec()
            } else {
                sources
            };
            let requests = sources
                .into_iter()
                .map(|source| {
                    NewScrapeJob::search(source, criteria.clone())
                        .with_priority(priority)
                        .with_kind(JobKind::OnDemand)
                })
                .collect();
            cmd_submit(requests).await?;
        }
        Commands::Run { file, priority } => {
            let requests = read_job_file(&file, priority)?;
            if requests.is_empty() {
                bail!("No jobs found in {}", file.display());
            }
            cmd_submit(requests).await?;
        }
        Commands::Stats { limit } => {
            let db = connect_db().await?;
            cmd_stats(&db, limit).await?;
        }
    }

    Ok(())
}

/// Connect to PostgreSQL using DATABASE_URL and apply migrations.
async fn connect_db() -> Result<Database> {
    let config = DatabaseConfig::from_env()?;
    let db = Database::connect(&config)
        .await
        .context("Failed to connect to database")?;
    db.migrate().await?;
    Ok(db)
}

/// Pick a store, run the jobs to completion and print the outcome.
async fn cmd_submit(requests: Vec<NewScrapeJob>) -> Result<()> {
    let config = PipelineConfig::from_env()?;
    let fetcher =
        ReqwestFetcher::with_timeout(config.request_timeout).context("Failed to create HTTP client")?;
    let registry = default_registry(fetcher);

    if std::env::var("DATABASE_URL").is_ok() {
        let db = connect_db().await?;
        let properties = db.property_repo();
        let orchestrator = Orchestrator::new(registry, properties.clone(), db.job_repo(), config);
        let recovered = orchestrator.recover().await?;
        if recovered > 0 {
            tracing::info!(recovered, "Resuming unfinished jobs from a previous run");
        }
        run_batch(orchestrator, properties, requests).await
    } else {
        tracing::info!("DATABASE_URL not set, results are kept in memory only");
        let store = MemoryStore::new();
        let orchestrator = Orchestrator::new(registry, store.clone(), store.clone(), config);
        run_batch(orchestrator, store, requests).await
    }
}

async fn run_batch<P, J>(
    orchestrator: Orchestrator<P, J>,
    properties: P,
    requests: Vec<NewScrapeJob>,
) -> Result<()>
where
    P: PropertyStore + 'static,
    J: JobStore + 'static,
{
    let cancel_token = CancellationToken::new();
    let mut workers = orchestrator.start(cancel_token.clone());
    let batch = orchestrator.add_batch(requests).await?;
    let batch_id = batch.batch_id();

    let jobs = tokio::select! {
        jobs = batch.wait() => jobs,
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!(%batch_id, "Interrupted, letting in-flight jobs finish");
            orchestrator
                .list_jobs(None, None)
                .into_iter()
                .filter(|job| job.batch_id == Some(batch_id))
                .collect()
        }
    };

    cancel_token.cancel();
    while workers.join_next().await.is_some() {}

    let processed: usize = jobs.iter().map(|j| j.properties_processed as usize).sum();
    let stored = if processed > 0 {
        properties.list(processed).await?
    } else {
        Vec::new()
    };

    let failed = jobs
        .iter()
        .filter(|j| j.status == JobStatus::DeadLettered)
        .count();
    if failed > 0 {
        tracing::warn!(%batch_id, failed, "Some jobs were dead-lettered");
    }

    let summary = serde_json::json!({
        "batch_id": batch_id,
        "jobs": jobs.iter().map(job_summary).collect::<Vec<_>>(),
        "properties": stored,
        "sources": orchestrator.get_stats(),
        "system_health": orchestrator.system_health(),
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);

    Ok(())
}

fn job_summary(job: &ScrapeJob) -> serde_json::Value {
    serde_json::json!({
        "id": job.id,
        "source": job.source,
        "target": job.target.to_string(),
        "status": job.status,
        "attempts": job.attempts,
        "properties_found": job.properties_found,
        "properties_processed": job.properties_processed,
        "partial_errors": job.partial_errors,
        "last_error": job.errors.last().map(|e| format!("{}: {}", e.kind, e.message)),
    })
}

async fn cmd_stats(db: &Database, limit: usize) -> Result<()> {
    let jobs = db.job_repo();

    println!("Jobs:");
    for status in [
        JobStatus::Pending,
        JobStatus::Processing,
        JobStatus::Completed,
        JobStatus::DeadLettered,
        JobStatus::Cancelled,
    ] {
        let count = jobs.count_by_status(status).await?;
        println!("  {:<14} {}", status.as_str(), count);
    }

    let properties = db.property_repo().count().await?;
    println!("\nProperties: {properties}");

    let dead = jobs
        .list_jobs(None, Some(JobStatus::DeadLettered), limit)
        .await?;
    if !dead.is_empty() {
        println!("\nRecent dead letters:");
        for job in &dead {
            let reason = job
                .errors
                .last()
                .map(|e| format!("{}: {}", e.kind, e.message))
                .unwrap_or_default();
            println!(
                "  {} [{}] {} after {} attempts - {}",
                job.id, job.source, job.target, job.attempts, reason
            );
        }
    }

    Ok(())
}

/// Recognize a listing URL by its host.
fn infer_source(url: &str) -> Option<Source> {
    let parsed = Url::parse(url).ok()?;
    let host = parsed.host_str()?.to_lowercase();
    let host = host.strip_prefix("www.").unwrap_or(&host);
    match host {
        "zillow.com" => Some(Source::Zillow),
        "redfin.com" => Some(Source::Redfin),
        "homes.com" => Some(Source::HomesCom),
        _ => None,
    }
}

fn parse_job_line(line: &str, priority: Priority) -> Result<Option<NewScrapeJob>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }

    let mut parts = line.split_whitespace();
    let (source, url) = match (parts.next(), parts.next()) {
        (Some(url), None) => {
            let source = infer_source(url).with_context(|| format!("Unknown listing host: {url}"))?;
            (source, url)
        }
        (Some(source), Some(url)) => {
            let source: Source = source.parse().map_err(anyhow::Error::msg)?;
            (source, url)
        }
        _ => return Ok(None),
    };
    if parts.next().is_some() {
        bail!("Expected `<source> <url>` or a bare URL, got: {line}");
    }

    Ok(Some(
        NewScrapeJob::url(source, url)
            .with_priority(priority)
            .with_kind(JobKind::Scheduled),
    ))
}

fn read_job_file(path: &Path, priority: Priority) -> Result<Vec<NewScrapeJob>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read job file: {}", path.display()))?;

    let mut requests = Vec::new();
    for (index, line) in content.lines().enumerate() {
        let request = parse_job_line(line, priority)
            .with_context(|| format!("{}:{}", path.display(), index + 1))?;
        requests.extend(request);
    }
    Ok(requests)
}
