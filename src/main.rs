//! Malady-Crawl main entry point
//!
//! This is the command-line interface for the Malady-Crawl ingestion engine.

use anyhow::{bail, Context};
use clap::Parser;
use malady_crawl::catalog::sync_catalog;
use malady_crawl::config::{load_config_with_hash, Config, Options};
use malady_crawl::connector::{build_http_client, ConnectorRegistry, JsonApiConnector};
use malady_crawl::crawler::{
    cancel_job, reap_stale_jobs, Orchestrator, OrchestratorSettings, ScrapeOutcome, ScrapeRequest,
};
use malady_crawl::output::{load_statistics, print_statistics};
use malady_crawl::storage::{self, open_storage, SharedStorage, Storage};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Malady-Crawl: incremental ingestion of disease literature
///
/// Malady-Crawl pulls documents about medical conditions from literature
/// databases, trial registries, adverse-event feeds and forums into one
/// normalized store, resuming where each source left off.
#[derive(Parser, Debug)]
#[command(name = "malady-crawl")]
#[command(version = "1.0.0")]
#[command(about = "Incremental disease document ingestion", long_about = None)]
struct Cli {
    /// Path to TOML configuration file
    #[arg(value_name = "CONFIG")]
    config: PathBuf,

    /// Increase logging verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,

    /// Source to crawl, by name (default: every active source)
    #[arg(long = "source", value_name = "NAME")]
    sources: Vec<String>,

    /// Disease to crawl for, by name
    #[arg(long = "disease", value_name = "NAME")]
    diseases: Vec<String>,

    /// Search term (default: the names of the selected diseases)
    #[arg(long = "term", value_name = "TERM")]
    terms: Vec<String>,

    /// Connector option overriding job and source defaults
    #[arg(long = "option", value_name = "KEY=VALUE", value_parser = parse_option)]
    options: Vec<(String, Value)>,

    /// Only fetch items changed since each source's last successful crawl
    #[arg(long)]
    incremental: bool,

    /// Validate config and show what would be crawled without crawling
    #[arg(long, conflicts_with_all = ["stats", "reap_stale", "cancel_job"])]
    dry_run: bool,

    /// Show statistics from the database and exit
    #[arg(long, conflicts_with_all = ["dry_run", "reap_stale", "cancel_job"])]
    stats: bool,

    /// Fail jobs stuck in running longer than `stale-job-minutes` and exit
    #[arg(long, conflicts_with_all = ["dry_run", "stats", "cancel_job"])]
    reap_stale: bool,

    /// Cancel a crawl job and exit
    #[arg(long, value_name = "ID", conflicts_with_all = ["dry_run", "stats", "reap_stale"])]
    cancel_job: Option<i64>,
}

/// Parses `key=value`; the value is read as JSON when it parses, else as text
fn parse_option(raw: &str) -> Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", raw))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty option name in '{}'", raw));
    }
    let value =
        serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup logging based on verbosity
    setup_logging(cli.verbose, cli.quiet);

    // Load and validate configuration
    tracing::info!("Loading configuration from: {}", cli.config.display());
    let (config, config_hash) = match load_config_with_hash(&cli.config) {
        Ok((cfg, hash)) => {
            tracing::info!("Configuration loaded successfully (hash: {})", hash);
            (cfg, hash)
        }
        Err(e) => {
            tracing::error!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    // Handle different modes
    if cli.dry_run {
        handle_dry_run(&config);
        return Ok(());
    }

    let storage = open_storage(Path::new(&config.storage.database_path))
        .with_context(|| format!("opening database {}", config.storage.database_path))?;

    if cli.stats {
        handle_stats(&config, &storage)?;
    } else if cli.reap_stale {
        handle_reap_stale(&config, &storage)?;
    } else if let Some(job_id) = cli.cancel_job {
        handle_cancel(&storage, job_id)?;
    } else {
        handle_crawl(&cli, &config, config_hash, storage).await?;
    }

    Ok(())
}

/// Sets up the logging/tracing subscriber based on verbosity level
fn setup_logging(verbose: u8, quiet: bool) {
    let filter = if quiet {
        // Only show errors
        EnvFilter::new("error")
    } else {
        match verbose {
            0 => EnvFilter::new("malady_crawl=info,warn"),
            1 => EnvFilter::new("malady_crawl=debug,info"),
            2 => EnvFilter::new("malady_crawl=trace,debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .init();
}

/// Handles the --dry-run mode: validates config and shows the catalog
fn handle_dry_run(config: &Config) {
    println!("=== Malady-Crawl Dry Run ===\n");

    println!("Crawler Configuration:");
    println!(
        "  Default rate limit: {}/s",
        config.crawler.default_rate_limit
    );
    println!(
        "  Progress flush every: {} items",
        config.crawler.progress_flush_every
    );
    println!(
        "  Stale job threshold: {} minutes",
        config.crawler.stale_job_minutes
    );

    println!("\nUser Agent: {}", config.user_agent.header_value());
    println!("Database: {}", config.storage.database_path);

    println!("\nDiseases ({}):", config.disease.len());
    for entry in &config.disease {
        if entry.synonyms.is_empty() {
            println!("  - {}", entry.name);
        } else {
            println!("  - {} ({})", entry.name, entry.synonyms.join(", "));
        }
    }

    println!("\nSources ({}):", config.source.len());
    for entry in &config.source {
        println!(
            "  - {} [{}; {:?}; {}/s]",
            entry.name,
            entry.connector,
            entry.association_method,
            entry
                .rate_limit
                .unwrap_or(config.crawler.default_rate_limit)
        );
        for disease in &entry.linked_diseases {
            println!("    * {}", disease);
        }
    }

    println!("\n✓ Configuration is valid");
}

/// Handles the --stats mode: shows statistics from the database
fn handle_stats(config: &Config, storage: &SharedStorage) -> anyhow::Result<()> {
    println!("Database: {}\n", config.storage.database_path);

    let guard = storage::lock(storage)?;
    let stats = load_statistics(&*guard)?;
    print_statistics(&stats);

    Ok(())
}

/// Handles the --reap-stale mode
fn handle_reap_stale(config: &Config, storage: &SharedStorage) -> anyhow::Result<()> {
    let max_age = chrono::Duration::minutes(config.crawler.stale_job_minutes as i64);
    let reaped = reap_stale_jobs(storage, max_age)?;

    println!("Reaped {} stale job(s)", reaped.len());
    for job_id in reaped {
        println!("  - {}", job_id);
    }
    Ok(())
}

/// Handles the --cancel-job mode
fn handle_cancel(storage: &SharedStorage, job_id: i64) -> anyhow::Result<()> {
    if cancel_job(storage, job_id)? {
        println!("✓ Job {} cancelled", job_id);
    } else {
        println!("Job {} had already finished", job_id);
    }
    Ok(())
}

/// Handles the main crawl operation
async fn handle_crawl(
    cli: &Cli,
    config: &Config,
    config_hash: String,
    storage: SharedStorage,
) -> anyhow::Result<()> {
    sync_catalog(&storage, config)?;

    let client = build_http_client(&config.user_agent)?;
    let registry = ConnectorRegistry::new().with(Arc::new(JsonApiConnector::new(client)));

    let (source_ids, disease_ids) = {
        let guard = storage::lock(&storage)?;

        let sources = if cli.sources.is_empty() {
            guard
                .list_sources()?
                .into_iter()
                .filter(|s| s.is_active)
                .collect()
        } else {
            let mut selected = Vec::new();
            for name in &cli.sources {
                match guard.get_source_by_name(name)? {
                    Some(source) => selected.push(source),
                    None => bail!("Unknown source '{}'", name),
                }
            }
            selected
        };

        let diseases = guard.find_diseases_by_names(&cli.diseases)?;
        for name in &cli.diseases {
            if !diseases.iter().any(|d| d.name.eq_ignore_ascii_case(name.trim())) {
                tracing::warn!("Unknown disease '{}' ignored", name);
            }
        }

        (
            sources.into_iter().map(|s| s.id).collect::<Vec<_>>(),
            diseases.into_iter().map(|d| d.id).collect::<Vec<_>>(),
        )
    };

    if source_ids.is_empty() {
        tracing::warn!("No active sources to crawl");
        return Ok(());
    }

    let orchestrator = Orchestrator::new(
        storage,
        Arc::new(registry),
        OrchestratorSettings::from_config(&config.crawler, Some(config_hash)),
    );
    let options: Options = cli.options.iter().cloned().collect();

    tracing::info!(
        "Crawling {} source(s){}",
        source_ids.len(),
        if cli.incremental { " incrementally" } else { "" }
    );

    // One task per source; jobs on different sources run concurrently
    let mut handles = Vec::new();
    for source_id in source_ids {
        let orchestrator = orchestrator.clone();
        let incremental = cli.incremental;
        let request = ScrapeRequest {
            disease_ids: disease_ids.clone(),
            disease_terms: cli.terms.clone(),
            options: options.clone(),
            job_id: None,
        };

        handles.push(tokio::spawn(async move {
            let result = if incremental {
                orchestrator.scrape_incremental(source_id, request).await
            } else {
                orchestrator.scrape(source_id, request).await
            };
            (source_id, result)
        }));
    }

    let mut failures = 0;
    for handle in handles {
        let (source_id, result) = handle.await?;
        match result {
            Ok(outcome) => report(source_id, &outcome),
            Err(e) => {
                failures += 1;
                tracing::error!("Crawl of source {} failed: {}", source_id, e);
            }
        }
    }

    if failures > 0 {
        bail!("{} source crawl(s) failed", failures);
    }
    Ok(())
}

fn report(source_id: i64, outcome: &ScrapeOutcome) {
    match (outcome.job_id, outcome.status) {
        (Some(job_id), Some(status)) => tracing::info!(
            "Source {}: job {} {} (found {}, processed {}, errors {})",
            source_id,
            job_id,
            status,
            outcome.documents_found,
            outcome.documents_processed,
            outcome.errors
        ),
        _ => tracing::info!("Source {}: nothing to do", source_id),
    }
}
