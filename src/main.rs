mod config;
mod db;
mod errors;
mod formatting;
mod github;
mod models;
mod partition;
mod pipeline;
mod rate_limit;
mod walker;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use config::Config;
use db::Database;
use formatting::{format_repo_link, format_stars};
use github::{GitHubClient, HttpTransport, RetryPolicy};
use partition::{Granularity, WindowPartitioner, DEFAULT_PREDICATE};
use pipeline::{run_ingestion, IngestConfig};
use rate_limit::{parse_reset_at, GovernorConfig, RateLimitGovernor};

#[derive(Parser)]
#[command(name = "star-crawler")]
#[command(about = "Crawl GitHub repository star counts into a local database")]
#[command(after_help = "\x1b[36mExamples:\x1b[0m
  star-crawler crawl                              # 100k repos from 2008 onwards
  star-crawler crawl --start 2015-01-01 --skip 40 # Resume after 40 windows
  star-crawler crawl --granularity week -p language:rust
  star-crawler stats")]
struct Cli {
    /// Database file (default: DATABASE_URL, then the platform data dir)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch repositories window by window and upsert their star counts
    Crawl {
        /// First creation date to cover (inclusive)
        #[arg(long, default_value = "2008-01-01")]
        start: NaiveDate,

        /// Creation date to stop at (exclusive)
        #[arg(long, default_value = "2025-01-01")]
        end: NaiveDate,

        /// Window size: day, week or month
        #[arg(short, long, default_value = "day")]
        granularity: Granularity,

        /// Search qualifier added to every window (repeatable, default: fork:false)
        #[arg(short, long = "predicate")]
        predicates: Vec<String>,

        /// Stop after storing this many records
        #[arg(short, long, default_value = "100000")]
        target: usize,

        /// Records per request (GitHub allows at most 100)
        #[arg(long, default_value = "100", value_parser = clap::value_parser!(u16).range(1..=100))]
        page_size: u16,

        /// Skip first N windows (for resuming)
        #[arg(short, long, default_value = "0")]
        skip: usize,

        /// Attempts per request before a window is abandoned
        #[arg(long, default_value = "5")]
        max_attempts: u32,

        /// Wait for the quota reset once remaining points drop below this
        #[arg(long, default_value = "50")]
        low_water: u64,
    },

    /// Show database statistics
    Stats {
        /// Number of top repositories to list
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Check GitHub GraphQL rate limit
    RateLimit,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("star_crawler=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.db.as_deref())?;

    match cli.command {
        Some(Commands::Crawl {
            start,
            end,
            granularity,
            predicates,
            target,
            page_size,
            skip,
            max_attempts,
            low_water,
        }) => {
            let partitioner = WindowPartitioner::new(start, end)
                .with_granularity(granularity)
                .with_predicates(if predicates.is_empty() {
                    vec![DEFAULT_PREDICATE.to_string()]
                } else {
                    predicates
                });
            let retry = RetryPolicy {
                max_attempts: max_attempts.max(1),
                ..RetryPolicy::default()
            };
            let governor = GovernorConfig {
                low_water,
                ..GovernorConfig::default()
            };
            let ingest = IngestConfig {
                target,
                page_size: page_size as usize,
            };
            crawl(&config, partitioner, skip, retry, governor, ingest).await
        }
        Some(Commands::Stats { limit }) => show_stats(&config, limit),
        Some(Commands::RateLimit) => check_rate_limit(&config).await,
        None => {
            use clap::CommandFactory;
            Cli::command().print_help()?;
            eprintln!();
            std::process::exit(0);
        }
    }
}

fn build_client(config: &Config, governor: GovernorConfig, retry: RetryPolicy) -> Result<GitHubClient> {
    let token = config.require_token()?;
    let transport = HttpTransport::new(token).context("Failed to build HTTP client")?;
    Ok(GitHubClient::new(transport, RateLimitGovernor::new(governor), retry))
}

/// Run the window -> page -> store loop until the target, the range end, or Ctrl-C
async fn crawl(
    config: &Config,
    partitioner: WindowPartitioner,
    skip: usize,
    retry: RetryPolicy,
    governor: GovernorConfig,
    ingest: IngestConfig,
) -> Result<()> {
    let client = build_client(config, governor, retry)?;
    let mut db = Database::open(&config.db_path)?;

    let total_windows = partitioner.count();
    if skip >= total_windows {
        eprintln!(
            "\x1b[33m!\x1b[0m Nothing to do: --skip {} covers all {} windows",
            skip, total_windows
        );
        return Ok(());
    }

    eprintln!(
        "\x1b[36m..\x1b[0m Crawling {} {:?} windows into {} (target {})",
        total_windows - skip,
        partitioner.granularity(),
        db.path().display(),
        ingest.target
    );

    // First Ctrl-C finishes the in-flight page, then stops
    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = stop.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, stopping after the current page");
                stop.store(true, Ordering::Relaxed);
            }
        });
    }

    let started = std::time::Instant::now();
    let report = run_ingestion(
        &client,
        &mut db,
        partitioner.windows().skip(skip),
        &ingest,
        |p| {
            info!(
                window = %p.window,
                page = p.page,
                stored = p.stored_this_page,
                window_total = p.window_total,
                total = p.total,
                target = p.target,
                "Stored page"
            );
        },
        || stop.load(Ordering::Relaxed),
    )
    .await?;

    db.checkpoint()?;

    let elapsed = started.elapsed();
    let rate = report.total as f64 / elapsed.as_secs_f64().max(1.0);
    eprintln!();
    if report.stopped {
        eprintln!("\x1b[33m!\x1b[0m Interrupted");
    } else {
        eprintln!("\x1b[32m✓\x1b[0m Crawl finished");
    }
    eprintln!("  \x1b[90mStored:\x1b[0m           {} / {}", report.total, ingest.target);
    eprintln!("  \x1b[90mPages:\x1b[0m            {}", report.pages);
    eprintln!("  \x1b[90mWindows done:\x1b[0m     {}", report.windows_completed);
    if !report.aborted_windows.is_empty() {
        let indices: Vec<_> = report.aborted_windows.iter().map(|i| i.to_string()).collect();
        eprintln!(
            "  \x1b[90mWindows aborted:\x1b[0m  \x1b[31m{}\x1b[0m (#{})",
            report.aborted_windows.len(),
            indices.join(", #")
        );
    }
    eprintln!(
        "  \x1b[90mElapsed:\x1b[0m          {:.0?} ({:.1} repos/s)",
        Duration::from_secs(elapsed.as_secs()),
        rate
    );

    let resume_at = report.resume_from(skip);
    if resume_at < total_windows {
        eprintln!(
            "\n  \x1b[33mTip:\x1b[0m Resume with: star-crawler crawl --skip {}",
            resume_at
        );
    }

    Ok(())
}

/// Show database statistics
fn show_stats(config: &Config, limit: usize) -> Result<()> {
    let db = Database::open(&config.db_path)?;
    let stats = db.stats()?;

    eprintln!("\x1b[36mDatabase Statistics\x1b[0m\n");
    eprintln!("  \x1b[90mPath:\x1b[0m          {}", db.path().display());
    eprintln!("  \x1b[90mRepositories:\x1b[0m  {}", stats.repos);
    eprintln!("  \x1b[90mOwners:\x1b[0m        {}", stats.owners);
    eprintln!("  \x1b[90mTotal stars:\x1b[0m   {}", format_stars(stats.total_stars));
    eprintln!(
        "  \x1b[90mLast fetch:\x1b[0m    {}",
        stats.last_fetched_at.as_deref().unwrap_or("never")
    );

    if stats.repos == 0 {
        eprintln!("\n  \x1b[33mTip:\x1b[0m Run: star-crawler crawl");
        return Ok(());
    }

    let top = db.top_repos(limit)?;
    if !top.is_empty() {
        eprintln!("\n\x1b[36mTop repositories\x1b[0m\n");
        for repo in top {
            let full_name = format!("{}/{}", repo.owner, repo.name);
            let url = format!("https://github.com/{}", full_name);
            eprintln!(
                "  \x1b[33m★ {:>6}\x1b[0m  {}  \x1b[90mfetched {}\x1b[0m",
                format_stars(repo.stars),
                format_repo_link(&full_name, &url),
                repo.fetched_at.get(..10).unwrap_or(&repo.fetched_at)
            );
        }
    }

    Ok(())
}

/// Check rate limit
async fn check_rate_limit(config: &Config) -> Result<()> {
    let client = build_client(config, GovernorConfig::default(), RetryPolicy::default())?;
    let rate = client.rate_limit().await?;

    let reset_time = rate
        .reset_at
        .as_deref()
        .and_then(parse_reset_at)
        .map(|dt| dt.with_timezone(&chrono::Local).format("%H:%M:%S").to_string())
        .unwrap_or_else(|| "?".to_string());
    let show = |v: Option<u64>| v.map(|n| n.to_string()).unwrap_or_else(|| "?".to_string());

    eprintln!("\x1b[36mGitHub GraphQL Rate Limit\x1b[0m\n");
    eprintln!("  \x1b[90mLimit:\x1b[0m     {}/hour", show(rate.limit));
    eprintln!("  \x1b[90mRemaining:\x1b[0m {}", show(rate.remaining));
    eprintln!("  \x1b[90mQuery cost:\x1b[0m {}", show(rate.cost));
    eprintln!("  \x1b[90mResets at:\x1b[0m {}", reset_time);

    Ok(())
}
