//! Fleet-Crawl main entry point
//!
//! This is the command-line interface for the Fleet-Crawl scheduler.

use clap::Parser;
use fleet_crawl::config::{load_config_with_hash, Config};
use fleet_crawl::credentials::load_credentials;
use fleet_crawl::crawler::{run_crawl, CrawlReport, RunOptions};
use fleet_crawl::storage::{SqliteStorage, StateStore};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

/// Fleet-Crawl: a multi-credential, rate-limited crawl scheduler
///
/// Fleet-Crawl pages through one remote resource with a pool of credentials,
/// keeping each credential inside its rate window and resuming from the last
/// snapshot when interrupted.
#[derive(Parser, Debug)]
#[command(name = "fleet-crawl")]
#[command(version)]
#[command(about = "A multi-credential, rate-limited crawl scheduler", long_about = None)]
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

    /// Start a fresh crawl, ignoring stored state
    #[arg(long)]
    fresh: bool,

    /// Validate config and credentials without crawling
    #[arg(long, conflicts_with = "status")]
    dry_run: bool,

    /// Show the stored state of every target and exit
    #[arg(long, conflicts_with = "dry_run")]
    status: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup logging based on verbosity
    setup_logging(cli.verbose, cli.quiet);

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

    if cli.dry_run {
        handle_dry_run(&config)?;
    } else if cli.status {
        handle_status(&config)?;
    } else {
        let options = RunOptions {
            fresh: cli.fresh,
            config_hash: Some(config_hash),
        };
        handle_crawl(config, options).await?;
    }

    Ok(())
}

/// Sets up the logging/tracing subscriber based on verbosity level
fn setup_logging(verbose: u8, quiet: bool) {
    let filter = if quiet {
        EnvFilter::new("error")
    } else {
        match verbose {
            0 => EnvFilter::new("fleet_crawl=info,warn"),
            1 => EnvFilter::new("fleet_crawl=debug,info"),
            2 => EnvFilter::new("fleet_crawl=trace,debug"),
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

/// Handles the --dry-run mode: validates config and lists credentials
fn handle_dry_run(config: &Config) -> anyhow::Result<()> {
    println!("=== Fleet-Crawl Dry Run ===\n");

    println!("Target:");
    println!("  Key: {}", config.target.key);
    println!("  Endpoint: {}", config.target.endpoint);
    println!("  Page size: {}", config.scheduler.page_size);
    match config.target.max_items {
        Some(max) => println!("  Stop after: {} unique items", max),
        None => println!("  Stop after: no item limit"),
    }

    println!("\nCredential policy:");
    println!(
        "  {} requests per {}s window",
        config.credentials.max_requests_per_window, config.credentials.window_secs
    );
    println!("  Minimum cooldown: {}ms", config.credentials.min_cooldown_ms);
    println!(
        "  Rate limit cooldown: {}s (repeat penalty {}s)",
        config.credentials.rate_limit_cooldown_secs, config.credentials.rate_limit_penalty_secs
    );

    let descriptors = load_credentials(config)?;
    println!("\nCredentials ({}):", descriptors.len());
    for descriptor in &descriptors {
        println!(
            "  - {} (fingerprint {}, route {})",
            descriptor.id,
            descriptor.fingerprint(),
            descriptor.route.as_deref().unwrap_or("direct")
        );
    }

    let workers = match config.scheduler.workers {
        0 => descriptors.len(),
        n => n as usize,
    };

    println!("\nStorage:");
    println!("  Database: {}", config.storage.database_path);

    println!("\n✓ Configuration is valid");
    println!("✓ Would start crawling with {} workers", workers);

    Ok(())
}

/// Handles the --status mode: shows stored scheduler state
fn handle_status(config: &Config) -> anyhow::Result<()> {
    println!("Database: {}\n", config.storage.database_path);

    let storage = SqliteStorage::new(Path::new(&config.storage.database_path))?;
    let targets = storage.list_targets()?;

    if targets.is_empty() {
        println!("No stored crawl state");
        return Ok(());
    }

    for (key, status, unique) in &targets {
        println!("{:<30} {:<12} {:>10} unique", key, status, unique);
    }

    if let Some(state) = storage.load(&config.target.key)? {
        println!("\nConfigured target {}:", state.target_key);
        println!("  Status: {}", state.status);
        if let Some(reason) = state.reason {
            println!("  Reason: {}", reason);
        }
        println!("  Fetched: {}", state.total_fetched);
        println!("  Skipped pages: {}", state.skipped_pages);
        println!("  Cursor offset: {}", state.cursor.numeric_offset);
        let active = state.credentials.values().filter(|c| c.active).count();
        println!(
            "  Credentials: {} active of {}",
            active,
            state.credentials.len()
        );
    }

    Ok(())
}

/// Handles the main crawl operation
async fn handle_crawl(config: Config, options: RunOptions) -> anyhow::Result<()> {
    if options.fresh {
        tracing::info!("Starting fresh crawl (ignoring stored state)");
    } else {
        tracing::info!("Starting crawl (will resume from stored state)");
    }

    match run_crawl(config, options).await {
        Ok(report) => {
            print_report(&report);
            Ok(())
        }
        Err(e) => {
            tracing::error!("Crawl failed: {}", e);
            Err(e.into())
        }
    }
}

fn print_report(report: &CrawlReport) {
    if report.already_completed {
        println!("Target {} was already completed", report.target_key);
        println!("Use --fresh to crawl it again");
        return;
    }

    println!("=== Crawl Report: {} ===", report.target_key);
    println!("Status: {}", report.status);
    if let Some(reason) = report.reason {
        println!("Reason: {}", reason);
    }
    println!("Unique items: {}", report.total_unique);
    println!("Fetched items: {}", report.total_fetched);
    println!("Skipped pages: {}", report.skipped_pages);
}
