use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use offerwatch_core::NotifiedOffer;
use offerwatch_dedup::{DiffEngine, RunError, WatchConfig};
use offerwatch_sources::{collect_offers, SourceRegistry};
use offerwatch_storage::{CacheStore, FeedName, HttpFetcher};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "offerwatch")]
#[command(about = "Deduplicate scraped offers against per-feed caches")]
struct Cli {
    /// Source registry describing which captures feed which cache.
    #[arg(long, default_value = "sources.yaml")]
    registry: PathBuf,
    /// Overrides OFFERWATCH_CACHE_DIR.
    #[arg(long)]
    cache_dir: Option<PathBuf>,
    /// Tracing filter; falls back to RUST_LOG, then "info".
    #[arg(long)]
    log_level: Option<String>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run every enabled feed once and print the new offers as JSON.
    Run {
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Show entry count and per-source tally of a feed's cache.
    Inspect { feed: String },
    /// Drop entries older than the retention window and persist.
    Evict { feed: String },
}

fn init_tracing(level: Option<&str>) {
    let filter = level
        .and_then(|l| EnvFilter::try_new(l).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_deref());

    let mut config = WatchConfig::from_env();
    if let Some(dir) = cli.cache_dir.clone() {
        config.cache_dir = dir;
    }

    match cli.command.unwrap_or(Commands::Run { output: None }) {
        Commands::Run { output } => run_feeds(&config, &cli.registry, output).await,
        Commands::Inspect { feed } => inspect(&config, &feed).await,
        Commands::Evict { feed } => evict(&config, &feed).await,
    }
}

fn engine_for(config: &WatchConfig) -> Result<DiffEngine> {
    let fetcher = HttpFetcher::new(config.http_client_config()).context("building image fetcher")?;
    Ok(DiffEngine::new(
        config.dedup.clone(),
        CacheStore::new(&config.cache_dir),
        Arc::new(fetcher),
    ))
}

async fn run_feeds(config: &WatchConfig, registry: &Path, output: Option<PathBuf>) -> Result<()> {
    let registry = SourceRegistry::load(registry).await?;
    let feeds = registry.feeds()?;
    let engine = engine_for(config)?;

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    let mut notified: Vec<NotifiedOffer> = Vec::new();
    let mut failed_feeds: Vec<FeedName> = Vec::new();
    let mut cancelled = false;

    for (feed, sources) in feeds {
        let offers = collect_offers(&sources).await;
        tokio::select! {
            outcome = engine.run(offers, &feed) => match outcome {
                Ok(report) => {
                    info!(
                        feed = %feed,
                        run_id = %report.run_id,
                        new = report.new_offers.len(),
                        matched = report.matched(),
                        cache = %report.cache.path.display(),
                        "feed done"
                    );
                    notified.extend(report.notified());
                }
                Err(err @ RunError::Persist { .. }) => {
                    error!(feed = %feed, error = %err, "cache not persisted; new offers still reported");
                    notified.extend(err.new_offers().iter().map(NotifiedOffer::from));
                    failed_feeds.push(feed.clone());
                }
            },
            _ = &mut shutdown => {
                warn!(feed = %feed, "interrupted; run discarded without touching the cache");
                cancelled = true;
                break;
            }
        }
    }

    let json = serde_json::to_string_pretty(&notified).context("encoding new offers")?;
    match output {
        Some(path) => tokio::fs::write(&path, json)
            .await
            .with_context(|| format!("writing {}", path.display()))?,
        None => println!("{json}"),
    }

    if cancelled {
        bail!("interrupted before every feed finished");
    }
    if !failed_feeds.is_empty() {
        let names: Vec<String> = failed_feeds.iter().map(ToString::to_string).collect();
        bail!("cache persistence failed for: {}", names.join(", "));
    }
    Ok(())
}

async fn inspect(config: &WatchConfig, feed: &str) -> Result<()> {
    let feed = FeedName::new(feed).context("invalid feed name")?;
    let store = CacheStore::new(&config.cache_dir);
    let state = store.load(&feed).await;

    let oldest = state.entries().map(|e| e.last_seen).min();
    let newest = state.entries().map(|e| e.last_seen).max();
    let summary = serde_json::json!({
        "feed": feed.as_str(),
        "path": store.path_for(&feed).display().to_string(),
        "entries": state.len(),
        "sources": state.source_tally(),
        "oldest_last_seen": oldest,
        "newest_last_seen": newest,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

async fn evict(config: &WatchConfig, feed: &str) -> Result<()> {
    let feed = FeedName::new(feed).context("invalid feed name")?;
    let engine = engine_for(config)?;
    let evicted = engine
        .evict(&feed, Utc::now())
        .await
        .with_context(|| format!("evicting feed {feed}"))?;
    println!("evicted {evicted} entries from {feed}");
    Ok(())
}
