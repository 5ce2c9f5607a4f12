//! Crawler module for credential-scheduled pagination
//!
//! This module contains the core crawling logic, including:
//! - Credential selection under rate windows and cooldowns
//! - Cursor derivation and advancement
//! - Page fetching over HTTP
//! - The worker pool, its supervisor and the stop conditions

mod backoff;
mod cursor;
mod fetcher;
mod pool;
mod scheduler;
mod signal;

pub use backoff::Backoff;
pub use cursor::{Advance, CursorTracker, PageProgress};
pub use fetcher::{classify_status, FetchOutcome, HttpPageFetcher, PageFetcher};
pub use pool::{Acquisition, CredentialPool};
pub use scheduler::{CrawlReport, CrawlScheduler, RunOptions};
pub use signal::{StopHandle, StopSignal};

use crate::config::Config;
use crate::credentials::load_credentials;
use crate::storage::SqliteStorage;
use crate::FleetError;
use std::path::Path;
use std::sync::Arc;

/// Runs a complete crawl against the configured target
///
/// This is the main entry point for starting a crawl. It will:
/// 1. Open the SQLite database
/// 2. Read the credential list
/// 3. Load or create the target's scheduler state
/// 4. Crawl until a stop condition is met or Ctrl-C is pressed
/// 5. Write the final snapshot
pub async fn run_crawl(config: Config, options: RunOptions) -> Result<CrawlReport, FleetError> {
    let storage = Arc::new(SqliteStorage::new(Path::new(&config.storage.database_path))?);
    let descriptors = load_credentials(&config)?;
    let fetcher = Arc::new(HttpPageFetcher::new(config.target.clone()));

    let scheduler = CrawlScheduler::new(
        config,
        descriptors,
        fetcher,
        storage.clone(),
        storage,
        options,
    )?;

    let stop = scheduler.stop_handle();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupt received, finishing in-flight fetches");
            stop.cancel();
        }
    });

    let result = scheduler.run().await;
    interrupt.abort();
    result
}
