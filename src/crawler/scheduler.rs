//! Crawl scheduler - worker pool and supervisor for one target
//!
//! A run consists of:
//! - Loading or initializing the `ScheduleState` for the target
//! - A fixed set of worker tasks that acquire a credential, take a cursor,
//!   fetch a page, and apply the outcome
//! - A supervisor that watches progress, writes periodic snapshots and
//!   decides when the crawl stops
//! - A final snapshot carrying the terminal status and its reason
//!
//! Workers share the credential pool, the cursor and the progress counters,
//! each behind its own lock. Only the supervisor writes snapshots.

use crate::config::Config;
use crate::crawler::backoff::Backoff;
use crate::crawler::cursor::{Advance, CursorTracker, PageProgress};
use crate::crawler::fetcher::{FetchOutcome, PageFetcher};
use crate::crawler::pool::{Acquisition, CredentialPool};
use crate::crawler::signal::{StopHandle, StopSignal};
use crate::credentials::CredentialDescriptor;
use crate::state::{CrawlStatus, Cursor, CursorState, FailureKind, ScheduleState, StopReason};
use crate::storage::{PersistenceGateway, Record, StateStore, StorageError};
use crate::FleetError;
use chrono::Utc;
use std::collections::{BTreeSet, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;

/// Summary of a finished run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrawlReport {
    pub target_key: String,
    pub status: CrawlStatus,
    pub reason: Option<StopReason>,
    pub total_fetched: u64,
    pub total_unique: u64,
    pub skipped_pages: u64,

    /// The target was already completed and nothing was fetched
    pub already_completed: bool,
}

impl CrawlReport {
    fn new(state: &ScheduleState, already_completed: bool) -> Self {
        Self {
            target_key: state.target_key.clone(),
            status: state.status,
            reason: state.reason,
            total_fetched: state.total_fetched,
            total_unique: state.total_unique,
            skipped_pages: state.skipped_pages,
            already_completed,
        }
    }
}

/// How a run treats stored state
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Ignore any stored state and start over
    pub fresh: bool,

    /// Hash of the configuration, stored with every snapshot
    pub config_hash: Option<String>,
}

/// Counters shared by every worker
#[derive(Debug, Default)]
struct Progress {
    seen_keys: BTreeSet<String>,
    total_fetched: u64,
    total_unique: u64,
    skipped_pages: u64,
    consecutive_empty: u32,
    items_since_snapshot: u64,
}

/// A cursor a worker still owes a fetch for
struct PendingPage {
    cursor: Cursor,
    attempts: u32,

    /// Credentials that already failed this page transiently
    tried: HashSet<String>,
}

impl PendingPage {
    fn new(cursor: Cursor) -> Self {
        Self {
            cursor,
            attempts: 0,
            tried: HashSet::new(),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State and collaborators shared by the supervisor and the workers
struct Shared {
    config: Config,
    pool: Mutex<CredentialPool>,
    tracker: CursorTracker,
    cursor: Mutex<CursorState>,
    progress: Mutex<Progress>,
    stop: Arc<StopSignal>,
    snapshot_due: Notify,
    fetcher: Arc<dyn PageFetcher>,
    records: Arc<dyn PersistenceGateway>,
}

impl Shared {
    fn target_key(&self) -> &str {
        &self.config.target.key
    }

    /// Picks a credential, preferring one that has not failed the pending page
    fn acquire(&self, pending: Option<&PendingPage>) -> Acquisition {
        let now = Utc::now();
        let mut pool = lock(&self.pool);
        match pending {
            Some(page) if !page.tried.is_empty() => match pool.acquire(&page.tried, now) {
                Acquisition::Blocked(None) => pool.acquire(&HashSet::new(), now),
                other => other,
            },
            _ => pool.acquire(&HashSet::new(), now),
        }
    }

    fn begin_request(&self, credential_id: &str) -> bool {
        lock(&self.pool).begin_request(credential_id, Utc::now())
    }

    fn next_cursor(&self) -> Cursor {
        let mut cursor = lock(&self.cursor);
        self.tracker.next(&mut cursor)
    }

    fn requeue(&self, cursor: Cursor) {
        let mut state = lock(&self.cursor);
        self.tracker.requeue(&mut state, cursor);
    }

    /// Runs one fetch, bounded by the request timeout
    async fn fetch(&self, credential: &CredentialDescriptor, cursor: &Cursor) -> FetchOutcome {
        let timeout = self.config.target.request_timeout();
        let page_size = self.config.scheduler.page_size;
        match tokio::time::timeout(timeout, self.fetcher.fetch(credential, cursor, page_size)).await
        {
            Ok(outcome) => outcome,
            Err(_) => FetchOutcome::TransientError {
                detail: format!("fetch timed out after {:?}", timeout),
            },
        }
    }

    /// Deduplicates and persists a page
    ///
    /// Ids become seen only once their batch is stored, so a failed write
    /// leaves the page fetchable again. Returns the number of new items and
    /// the unique total.
    fn persist(&self, items: &[Record]) -> Result<(usize, u64), StorageError> {
        let mut progress = lock(&self.progress);
        progress.total_fetched += items.len() as u64;
        progress.consecutive_empty = 0;

        let mut batch_ids = HashSet::new();
        let fresh: Vec<Record> = items
            .iter()
            .filter(|record| {
                !progress.seen_keys.contains(&record.id) && batch_ids.insert(record.id.as_str())
            })
            .cloned()
            .collect();

        if !fresh.is_empty() {
            self.records.save_batch(self.target_key(), &fresh)?;
            for record in &fresh {
                progress.seen_keys.insert(record.id.clone());
            }
            progress.total_unique += fresh.len() as u64;
            progress.items_since_snapshot += fresh.len() as u64;
        }

        if progress.items_since_snapshot >= self.config.snapshot.every_items {
            self.snapshot_due.notify_one();
        }

        Ok((fresh.len(), progress.total_unique))
    }

    fn on_page(
        &self,
        credential_id: &str,
        items: &[Record],
        next_token: Option<String>,
    ) -> Result<(), StorageError> {
        lock(&self.pool).record_success(credential_id, Utc::now());

        let (new_unique, total_unique) = self.persist(items)?;

        let advance = {
            let mut cursor = lock(&self.cursor);
            self.tracker.advance(
                &mut cursor,
                PageProgress::Page {
                    next_token,
                    new_unique,
                },
            )
        };

        if advance == Advance::Stalled && self.stop.request(StopReason::CursorStalled) {
            tracing::info!("Manual cursor increments stopped yielding new items");
        }

        if let Some(max_items) = self.config.target.max_items {
            if total_unique >= max_items && self.stop.request(StopReason::TargetReached) {
                tracing::info!("Reached {} unique items", total_unique);
            }
        }

        Ok(())
    }

    /// Applies an empty page
    ///
    /// The request already counted against the credential's window when it
    /// was issued. An empty page is not a credential failure, so the
    /// credential's failure streak is left untouched.
    fn on_empty(&self) {
        {
            let mut cursor = lock(&self.cursor);
            self.tracker.advance(&mut cursor, PageProgress::Empty);
        }

        let empties = {
            let mut progress = lock(&self.progress);
            progress.consecutive_empty += 1;
            progress.consecutive_empty
        };

        if empties >= self.config.stop.empty_threshold
            && self.stop.request(StopReason::ConsecutiveEmpty)
        {
            tracing::info!("{} empty pages in a row", empties);
        }
    }

    fn on_failure(&self, credential_id: &str, kind: FailureKind) {
        let all_inactive = {
            let mut pool = lock(&self.pool);
            pool.record_failure(credential_id, kind, Utc::now()) && pool.all_inactive()
        };

        if all_inactive && self.stop.request(StopReason::AllCredentialsInactive) {
            tracing::warn!("Every credential is disabled");
        }
    }

    /// Copies the live state into a snapshot based on `base`
    fn snapshot(&self, base: &ScheduleState) -> ScheduleState {
        let mut state = base.clone();
        state.credentials = lock(&self.pool).snapshot();
        state.cursor = lock(&self.cursor).clone();

        let progress = lock(&self.progress);
        state.seen_keys = progress.seen_keys.clone();
        state.total_fetched = progress.total_fetched;
        state.total_unique = progress.total_unique;
        state.skipped_pages = progress.skipped_pages;
        state.consecutive_empty = progress.consecutive_empty;
        state.updated_at = Utc::now();
        state
    }
}

/// Worker loop: acquire, fetch, apply, until the stop signal is raised
async fn run_worker(shared: Arc<Shared>, worker: usize) {
    let config = &shared.config;
    let mut backoff = Backoff::new(config.stop.backoff_initial(), config.stop.backoff_max());
    let mut pending: Option<PendingPage> = None;

    tracing::debug!("Worker {} started", worker);

    while !shared.stop.is_stopped() {
        let credential = match shared.acquire(pending.as_ref()) {
            Acquisition::Ready(credential) => {
                backoff.reset();
                credential
            }
            Acquisition::Blocked(Some(wait)) => {
                if shared.stop.sleep(wait.min(backoff.max())).await {
                    break;
                }
                continue;
            }
            Acquisition::Blocked(None) => {
                let delay = backoff.next_delay();
                tracing::debug!(
                    "Worker {} found no active credential, backing off {:?}",
                    worker,
                    delay
                );
                if shared.stop.sleep(delay).await {
                    break;
                }
                continue;
            }
        };

        let mut page = match pending.take() {
            Some(page) => page,
            None => PendingPage::new(shared.next_cursor()),
        };

        if !shared.begin_request(&credential.id) {
            // Another worker used the credential in the meantime
            pending = Some(page);
            tokio::task::yield_now().await;
            continue;
        }

        if shared.stop.is_stopped() {
            pending = Some(page);
            break;
        }

        let outcome = shared.fetch(&credential, &page.cursor).await;
        tracing::debug!(
            "Worker {} fetched {} with {}: {}",
            worker,
            page.cursor,
            credential.id,
            outcome.label()
        );

        match outcome {
            FetchOutcome::Page { items, next_token } if items.is_empty() && next_token.is_none() => {
                shared.on_empty();
            }
            FetchOutcome::Page { items, next_token } => {
                if let Err(e) = shared.on_page(&credential.id, &items, next_token) {
                    tracing::warn!("Failed to persist page at {}: {}", page.cursor, e);
                    pending = Some(PendingPage::new(page.cursor));
                }
            }
            FetchOutcome::Empty => shared.on_empty(),
            FetchOutcome::RateLimited => {
                tracing::info!("Credential {} was rate limited", credential.id);
                shared.on_failure(&credential.id, FailureKind::RateLimited);
                pending = Some(page);
            }
            FetchOutcome::InvalidCredential => {
                shared.on_failure(&credential.id, FailureKind::Fatal);
                pending = Some(page);
            }
            FetchOutcome::FatalError { detail } => {
                tracing::warn!("Credential {} failed at {}: {}", credential.id, page.cursor, detail);
                shared.on_failure(&credential.id, FailureKind::Fatal);
                pending = Some(page);
            }
            FetchOutcome::TransientError { detail } => {
                shared.on_failure(&credential.id, FailureKind::Transient);
                page.attempts += 1;

                if page.attempts >= config.retry.transient_attempts {
                    tracing::warn!(
                        "Skipping {} after {} transient failures (last: {})",
                        page.cursor,
                        page.attempts,
                        detail
                    );
                    lock(&shared.progress).skipped_pages += 1;
                } else {
                    tracing::debug!(
                        "Transient failure {} at {}: {}",
                        page.attempts,
                        page.cursor,
                        detail
                    );
                    page.tried.insert(credential.id.clone());
                    pending = Some(page);
                    if shared.stop.sleep(config.retry.transient_delay()).await {
                        break;
                    }
                }
            }
        }
    }

    if let Some(page) = pending {
        shared.requeue(page.cursor);
    }
    tracing::debug!("Worker {} stopped", worker);
}

/// Unique and fetched counts at the last monitoring tick
#[derive(Debug, Clone, Copy)]
struct Watermark {
    unique: u64,
    fetched: u64,
}

/// Runs a multi-credential crawl against one target
pub struct CrawlScheduler {
    shared: Arc<Shared>,
    store: Arc<dyn StateStore>,

    /// Metadata of the state being continued; live parts are in `shared`
    base: ScheduleState,
    workers: usize,
    already_completed: bool,
}

impl CrawlScheduler {
    /// Creates a scheduler, loading or initializing the target's state
    ///
    /// # Arguments
    ///
    /// * `config` - The crawl configuration
    /// * `descriptors` - Credentials available for this run
    /// * `fetcher` - Issues the paginated requests
    /// * `records` - Receives deduplicated records
    /// * `store` - Snapshots and restores scheduler state
    /// * `options` - Whether to start fresh and the config hash to record
    ///
    /// # Returns
    ///
    /// * `Err(FleetError::NoCredentials)` - The credential list is empty
    /// * `Err(FleetError::Storage)` - The stored state could not be loaded
    pub fn new(
        config: Config,
        descriptors: Vec<CredentialDescriptor>,
        fetcher: Arc<dyn PageFetcher>,
        records: Arc<dyn PersistenceGateway>,
        store: Arc<dyn StateStore>,
        options: RunOptions,
    ) -> Result<Self, FleetError> {
        let key = config.target.key.clone();
        if descriptors.is_empty() {
            return Err(FleetError::NoCredentials { target: key });
        }

        let loaded = if options.fresh {
            tracing::info!("Fresh run requested, ignoring stored state for {}", key);
            None
        } else {
            store.load(&key)?
        };

        let mut state = match loaded {
            Some(mut state) => {
                if let (Some(stored), Some(current)) = (&state.config_hash, &options.config_hash) {
                    if stored != current {
                        tracing::warn!(
                            "Configuration changed since the stored state of {} was written",
                            key
                        );
                    }
                }
                state.merge_credentials(&descriptors);

                match state.status {
                    CrawlStatus::InProgress => tracing::info!(
                        "Resuming {} at offset {} with {} unique items",
                        key,
                        state.cursor.numeric_offset,
                        state.total_unique
                    ),
                    CrawlStatus::Completed => {}
                    CrawlStatus::Stopped | CrawlStatus::Error => {
                        tracing::info!(
                            "Reopening {} (last run ended {}: {})",
                            key,
                            state.status,
                            state.reason.map(|r| r.as_str()).unwrap_or("unknown")
                        );
                        state.reopen();
                    }
                }
                state
            }
            None => {
                tracing::info!("No stored state for {}, starting a new crawl", key);
                ScheduleState::new(&key, &descriptors)
            }
        };

        if options.config_hash.is_some() {
            state.config_hash = options.config_hash;
        }

        let already_completed = state.status == CrawlStatus::Completed;
        let workers = match config.scheduler.workers {
            0 => descriptors.len(),
            n => n as usize,
        };

        let pool = CredentialPool::new(
            config.credentials.clone(),
            descriptors,
            std::mem::take(&mut state.credentials),
        );
        let progress = Progress {
            seen_keys: std::mem::take(&mut state.seen_keys),
            total_fetched: state.total_fetched,
            total_unique: state.total_unique,
            skipped_pages: state.skipped_pages,
            consecutive_empty: state.consecutive_empty,
            items_since_snapshot: 0,
        };
        let cursor = std::mem::take(&mut state.cursor);
        let tracker = CursorTracker::new(config.cursor.clone());

        let shared = Shared {
            config,
            pool: Mutex::new(pool),
            tracker,
            cursor: Mutex::new(cursor),
            progress: Mutex::new(progress),
            stop: Arc::new(StopSignal::new()),
            snapshot_due: Notify::new(),
            fetcher,
            records,
        };

        Ok(Self {
            shared: Arc::new(shared),
            store,
            base: state,
            workers,
            already_completed,
        })
    }

    /// Returns a handle that can cancel the run from another task
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle::new(Arc::clone(&self.shared.stop))
    }

    /// Number of worker tasks the run will spawn
    pub fn worker_count(&self) -> usize {
        self.workers
    }

    /// Runs the crawl until a stop condition is met
    ///
    /// Returns `Err(FleetError::Storage)` only if the final snapshot cannot
    /// be written; every other failure is absorbed into the report.
    pub async fn run(self) -> Result<CrawlReport, FleetError> {
        let key = self.shared.target_key().to_string();

        if self.already_completed {
            tracing::info!("Target {} is already completed, nothing to do", key);
            let state = self.shared.snapshot(&self.base);
            return Ok(CrawlReport::new(&state, true));
        }

        let initial = self.shared.snapshot(&self.base);
        if let Err(e) = self.store.save(&key, &initial) {
            tracing::warn!("Failed to save initial snapshot of {}: {}", key, e);
        }

        tracing::info!(
            "Starting crawl of {} with {} workers and {} credentials",
            key,
            self.workers,
            lock(&self.shared.pool).len()
        );

        let start_time = Instant::now();
        let mut workers = JoinSet::new();
        for worker in 0..self.workers {
            workers.spawn(run_worker(Arc::clone(&self.shared), worker));
        }

        let reason = self.supervise(&mut workers).await;

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                tracing::error!("Worker task failed: {}", e);
            }
        }

        let mut state = self.shared.snapshot(&self.base);
        state.finish(reason);
        self.save_final(&state).await?;

        tracing::info!(
            "Crawl of {} ended {} ({}): {} unique of {} fetched in {:.1}s",
            key,
            state.status,
            reason,
            state.total_unique,
            state.total_fetched,
            start_time.elapsed().as_secs_f64()
        );

        Ok(CrawlReport::new(&state, false))
    }

    /// Watches the crawl until the stop signal is raised
    async fn supervise(&self, workers: &mut JoinSet<()>) -> StopReason {
        let config = &self.shared.config;
        let mut ticker = tokio::time::interval(config.stop.monitor_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        let mut watermark = self.watermark();
        let mut stagnant = 0;
        let mut last_snapshot = Instant::now();

        loop {
            tokio::select! {
                _ = self.shared.stop.wait() => break,
                _ = self.shared.snapshot_due.notified() => {
                    self.periodic_snapshot(&mut last_snapshot);
                }
                Some(joined) = workers.join_next(), if !workers.is_empty() => {
                    if let Err(e) = joined {
                        tracing::error!("Worker task failed: {}", e);
                    }
                    if workers.is_empty() {
                        tracing::error!("Every worker exited before a stop was requested");
                        self.shared.stop.request(StopReason::Cancelled);
                        break;
                    }
                }
                _ = ticker.tick() => {
                    self.monitor(&mut watermark, &mut stagnant);
                    if last_snapshot.elapsed() >= config.snapshot.every() {
                        self.periodic_snapshot(&mut last_snapshot);
                    }
                }
            }
        }

        self.shared.stop.reason().unwrap_or(StopReason::Cancelled)
    }

    fn watermark(&self) -> Watermark {
        let progress = lock(&self.shared.progress);
        Watermark {
            unique: progress.total_unique,
            fetched: progress.total_fetched,
        }
    }

    /// One monitoring tick: health check, stagnation check, progress log
    fn monitor(&self, last: &mut Watermark, stagnant: &mut u32) {
        let active = lock(&self.shared.pool).active_count();
        if active == 0 {
            if self.shared.stop.request(StopReason::AllCredentialsInactive) {
                tracing::warn!("Every credential is disabled");
            }
            return;
        }

        let current = self.watermark();
        if current.unique == last.unique && current.fetched > last.fetched {
            *stagnant += 1;
            tracing::debug!("No new unique items for {} ticks", stagnant);
            if *stagnant >= self.shared.config.stop.stagnation_ticks
                && self.shared.stop.request(StopReason::NoNewUniqueItems)
            {
                tracing::info!(
                    "Fetching continued for {} ticks without new unique items",
                    stagnant
                );
            }
        } else if current.unique > last.unique {
            *stagnant = 0;
        }
        *last = current;

        tracing::info!(
            "Progress: {} unique, {} fetched, {} active credentials",
            current.unique,
            current.fetched,
            active
        );
    }

    /// Writes a snapshot; a failure is logged and retried on a later tick
    fn periodic_snapshot(&self, last_snapshot: &mut Instant) {
        let counted = lock(&self.shared.progress).items_since_snapshot;
        let state = self.shared.snapshot(&self.base);

        match self.store.save(&state.target_key, &state) {
            Ok(()) => {
                *last_snapshot = Instant::now();
                let mut progress = lock(&self.shared.progress);
                progress.items_since_snapshot = progress.items_since_snapshot.saturating_sub(counted);
                tracing::debug!(
                    "Saved snapshot of {} at {} unique items",
                    state.target_key,
                    state.total_unique
                );
            }
            Err(e) => {
                tracing::warn!("Failed to save snapshot of {}: {}", state.target_key, e);
            }
        }
    }

    async fn save_final(&self, state: &ScheduleState) -> Result<(), FleetError> {
        let attempts = self.shared.config.snapshot.final_attempts.max(1);
        let mut attempt = 1;

        loop {
            match self.store.save(&state.target_key, state) {
                Ok(()) => return Ok(()),
                Err(e) if attempt >= attempts => {
                    tracing::error!(
                        "Final snapshot of {} could not be saved after {} attempts: {}",
                        state.target_key,
                        attempts,
                        e
                    );
                    return Err(e.into());
                }
                Err(e) => {
                    tracing::warn!(
                        "Final snapshot attempt {}/{} failed: {}",
                        attempt,
                        attempts,
                        e
                    );
                    tokio::time::sleep(Duration::from_millis(100 * u64::from(attempt))).await;
                    attempt += 1;
                }
            }
        }
    }
}
