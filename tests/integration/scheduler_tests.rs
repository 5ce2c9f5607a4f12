use crate::common::{build_scheduler, descriptors, page, run_to_end, test_config, ScriptedFetcher};
use fleet_crawl::crawler::{CrawlScheduler, FetchOutcome, RunOptions};
use fleet_crawl::state::{CrawlStatus, Cursor, ScheduleState, StopReason};
use fleet_crawl::storage::{MemoryStorage, StateStore};
use fleet_crawl::FleetError;
use fleet_crawl::crawler::StopHandle;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

const ENDPOINT: &str = "http://127.0.0.1:9/list";

#[tokio::test]
async fn test_overlapping_pages_are_stored_once_across_workers() {
    let config = test_config("dedup", ENDPOINT);
    let storage = Arc::new(MemoryStorage::new());

    // Page n carries ids 3n..3n+5, so neighbouring pages overlap.
    let fetcher = ScriptedFetcher::new(|_, _, call| {
        if call < 20 {
            let start = call as u64 * 3;
            page(start..start + 5, None)
        } else {
            FetchOutcome::Empty
        }
    });

    let scheduler = build_scheduler(
        config,
        &["a", "b", "c"],
        &fetcher,
        &storage,
        RunOptions::default(),
    );
    assert_eq!(scheduler.worker_count(), 3);
    let report = run_to_end(scheduler).await;

    let pages = fetcher.calls().len().min(20) as u64;
    let expected: BTreeSet<u64> = (0..pages).flat_map(|n| n * 3..n * 3 + 5).collect();

    assert_eq!(report.status, CrawlStatus::Stopped);
    assert_eq!(report.reason, Some(StopReason::ConsecutiveEmpty));
    assert_eq!(report.total_unique, expected.len() as u64);
    assert_eq!(report.total_fetched, pages * 5);
    assert_eq!(storage.record_count("dedup"), expected.len());

    let saved = storage.last_saved().unwrap();
    assert_eq!(saved.seen_keys.len(), expected.len());
    assert_eq!(saved.status, CrawlStatus::Stopped);
}

#[tokio::test]
async fn test_consecutive_empty_pages_stop_the_crawl() {
    let config = test_config("empty", ENDPOINT);
    let storage = Arc::new(MemoryStorage::new());
    let fetcher = ScriptedFetcher::new(|_, _, _| FetchOutcome::Empty);

    let report = run_to_end(build_scheduler(
        config,
        &["a"],
        &fetcher,
        &storage,
        RunOptions::default(),
    ))
    .await;

    assert_eq!(report.status, CrawlStatus::Stopped);
    assert_eq!(report.reason, Some(StopReason::ConsecutiveEmpty));
    assert_eq!(report.total_unique, 0);
    assert_eq!(fetcher.call_count(), 3);

    let saved = storage.load("empty").unwrap().unwrap();
    assert_eq!(saved.reason, Some(StopReason::ConsecutiveEmpty));
    assert_eq!(saved.consecutive_empty, 3);
    assert_eq!(saved.cursor.iteration_count, 3);
    // Empty pages count against the rate window but are not failures
    let credential = &saved.credentials["a"];
    assert_eq!(credential.requests_this_window, 3);
    assert_eq!(credential.consecutive_failures, 0);
}

#[tokio::test]
async fn test_repeated_items_stop_with_no_new_unique_items() {
    let config = test_config("stagnant", ENDPOINT);
    let storage = Arc::new(MemoryStorage::new());

    let handle: Arc<OnceLock<StopHandle>> = Arc::new(OnceLock::new());
    let late_calls = Arc::new(AtomicU64::new(0));
    let (seen_handle, late) = (Arc::clone(&handle), Arc::clone(&late_calls));

    // The remote keeps sending a token, so the manual stall never triggers.
    let fetcher = ScriptedFetcher::new(move |_, _, _| {
        if seen_handle.get().map_or(false, StopHandle::is_stopped) {
            late.fetch_add(1, Ordering::SeqCst);
        }
        page(1..=5, Some("abc"))
    });

    let scheduler = build_scheduler(
        config,
        &["a", "b", "c"],
        &fetcher,
        &storage,
        RunOptions::default(),
    );
    let workers = scheduler.worker_count() as u64;
    let _ = handle.set(scheduler.stop_handle());
    let report = run_to_end(scheduler).await;

    assert_eq!(report.reason, Some(StopReason::NoNewUniqueItems));
    assert_eq!(report.status, CrawlStatus::Stopped);
    assert_eq!(report.total_unique, 5);
    assert!(report.total_fetched > 5);
    assert_eq!(report.total_fetched, fetcher.call_count() as u64 * 5);
    assert_eq!(storage.record_count("stagnant"), 5);

    // Only fetches already in flight when the stop was raised may land after it
    assert!(late_calls.load(Ordering::SeqCst) <= workers);
    let calls = fetcher.call_count();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(fetcher.call_count(), calls);
}

#[tokio::test]
async fn test_concurrent_workers_never_exceed_window_quota() {
    let mut config = test_config("paced", ENDPOINT);
    config.scheduler.workers = 4;
    config.credentials.max_requests_per_window = 2;
    config.credentials.min_cooldown_ms = 0;
    let storage = Arc::new(MemoryStorage::new());

    let next_id = Arc::new(AtomicU64::new(0));
    let ids = Arc::clone(&next_id);
    let fetcher = ScriptedFetcher::new(move |_, _, _| {
        let start = ids.fetch_add(5, Ordering::SeqCst);
        page(start..start + 5, None)
    });

    let scheduler = build_scheduler(
        config,
        &["a", "b"],
        &fetcher,
        &storage,
        RunOptions::default(),
    );
    assert_eq!(scheduler.worker_count(), 4);
    let handle = scheduler.stop_handle();
    let run = tokio::spawn(scheduler.run());

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(handle.cancel());
    let report = tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .expect("crawl did not stop after cancel")
        .unwrap()
        .unwrap();

    let calls = fetcher.calls();
    for id in ["a", "b"] {
        let used = calls.iter().filter(|(credential, _)| credential == id).count();
        assert_eq!(used, 2, "credential {} issued {} requests", id, used);
    }
    assert_eq!(calls.len(), 4);
    assert_eq!(report.reason, Some(StopReason::Cancelled));
    assert_eq!(report.total_unique, 20);

    let saved = storage.load("paced").unwrap().unwrap();
    assert_eq!(saved.credentials["a"].requests_this_window, 2);
    assert_eq!(saved.credentials["b"].requests_this_window, 2);
}

#[tokio::test]
async fn test_manual_increments_without_growth_stall_the_cursor() {
    let config = test_config("stall", ENDPOINT);
    let storage = Arc::new(MemoryStorage::new());
    let fetcher = ScriptedFetcher::new(|_, _, _| page(1..=5, None));

    let report = run_to_end(build_scheduler(
        config,
        &["a"],
        &fetcher,
        &storage,
        RunOptions::default(),
    ))
    .await;

    assert_eq!(report.reason, Some(StopReason::CursorStalled));
    assert_eq!(report.status, CrawlStatus::Stopped);
    assert_eq!(report.total_unique, 5);
    // One page with new items, then three without
    assert_eq!(fetcher.call_count(), 4);
}

#[tokio::test]
async fn test_rejected_credentials_end_in_error() {
    let config = test_config("rejected", ENDPOINT);
    let storage = Arc::new(MemoryStorage::new());
    let fetcher = ScriptedFetcher::new(|_, _, _| FetchOutcome::InvalidCredential);

    let report = run_to_end(build_scheduler(
        config,
        &["a", "b"],
        &fetcher,
        &storage,
        RunOptions::default(),
    ))
    .await;

    assert_eq!(report.status, CrawlStatus::Error);
    assert_eq!(report.reason, Some(StopReason::AllCredentialsInactive));

    let saved = storage.last_saved().unwrap();
    assert!(saved.credentials.values().all(|c| !c.active));
    assert!(saved
        .credentials
        .values()
        .all(|c| c.disabled_reason.is_some()));
    // The rejected page is handed out again on the next run
    assert!(saved.cursor.requeued.contains(&Cursor::Offset(250)));
}

#[tokio::test]
async fn test_rate_limited_page_is_refetched_on_another_credential() {
    let mut config = test_config("throttled", ENDPOINT);
    config.scheduler.workers = 1;
    config.stop.empty_threshold = 1;
    let storage = Arc::new(MemoryStorage::new());

    let fetcher = ScriptedFetcher::new(|credential, cursor, _| match (credential, cursor) {
        ("a", _) => FetchOutcome::RateLimited,
        (_, Cursor::Offset(250)) => page([1, 2], None),
        _ => FetchOutcome::Empty,
    });

    let report = run_to_end(build_scheduler(
        config,
        &["a", "b"],
        &fetcher,
        &storage,
        RunOptions::default(),
    ))
    .await;

    assert_eq!(report.reason, Some(StopReason::ConsecutiveEmpty));
    assert_eq!(
        fetcher.calls(),
        vec![
            ("a".to_string(), Cursor::Offset(250)),
            ("b".to_string(), Cursor::Offset(250)),
            ("b".to_string(), Cursor::Offset(500)),
        ]
    );
    assert_eq!(storage.record_ids("throttled"), vec!["1", "2"]);

    let saved = storage.last_saved().unwrap();
    let throttled = &saved.credentials["a"];
    assert!(throttled.active);
    assert!(throttled.is_rate_limited);
    assert!(throttled.rate_limit_until.is_some());
}

#[tokio::test]
async fn test_transient_failures_skip_the_page_after_bounded_retries() {
    let mut config = test_config("flaky", ENDPOINT);
    config.retry.transient_attempts = 2;
    config.credentials.failure_threshold = 10;
    config.stop.empty_threshold = 2;
    let storage = Arc::new(MemoryStorage::new());

    let fetcher = ScriptedFetcher::new(|_, cursor, _| match cursor {
        Cursor::Offset(250) => FetchOutcome::TransientError {
            detail: "HTTP 503".to_string(),
        },
        _ => FetchOutcome::Empty,
    });

    let report = run_to_end(build_scheduler(
        config,
        &["a"],
        &fetcher,
        &storage,
        RunOptions::default(),
    ))
    .await;

    assert_eq!(report.skipped_pages, 1);
    assert_eq!(report.reason, Some(StopReason::ConsecutiveEmpty));
    let cursors: Vec<Cursor> = fetcher.calls().into_iter().map(|(_, c)| c).collect();
    assert_eq!(
        cursors,
        vec![
            Cursor::Offset(250),
            Cursor::Offset(250),
            Cursor::Offset(500),
            Cursor::Offset(750),
        ]
    );
}

#[tokio::test]
async fn test_failed_batch_write_refetches_the_page() {
    let mut config = test_config("unstable-store", ENDPOINT);
    config.stop.empty_threshold = 1;
    let storage = Arc::new(MemoryStorage::new());
    storage.fail_next_batches(1);

    let fetcher = ScriptedFetcher::new(|_, cursor, _| match cursor {
        Cursor::Offset(250) => page([1, 2], None),
        _ => FetchOutcome::Empty,
    });

    let report = run_to_end(build_scheduler(
        config,
        &["a"],
        &fetcher,
        &storage,
        RunOptions::default(),
    ))
    .await;

    let fetches_of_first_page = fetcher
        .calls()
        .iter()
        .filter(|(_, cursor)| *cursor == Cursor::Offset(250))
        .count();
    assert_eq!(fetches_of_first_page, 2);
    assert_eq!(storage.record_ids("unstable-store"), vec!["1", "2"]);
    assert_eq!(report.total_unique, 2);
}

#[tokio::test]
async fn test_max_items_completes_the_target() {
    let mut config = test_config("bounded", ENDPOINT);
    config.target.max_items = Some(25);
    let storage = Arc::new(MemoryStorage::new());

    let next_id = Arc::new(AtomicU64::new(0));
    let ids = Arc::clone(&next_id);
    let fetcher = ScriptedFetcher::new(move |_, _, _| {
        let start = ids.fetch_add(10, Ordering::SeqCst);
        page(start..start + 10, None)
    });

    let report = run_to_end(build_scheduler(
        config,
        &["a", "b"],
        &fetcher,
        &storage,
        RunOptions::default(),
    ))
    .await;

    assert_eq!(report.status, CrawlStatus::Completed);
    assert_eq!(report.reason, Some(StopReason::TargetReached));
    assert!(report.total_unique >= 25);
    assert_eq!(storage.record_count("bounded") as u64, report.total_unique);
}

#[tokio::test]
async fn test_cancel_stops_gracefully_and_saves_progress() {
    let config = test_config("cancelled", ENDPOINT);
    let storage = Arc::new(MemoryStorage::new());

    let next_id = Arc::new(AtomicU64::new(0));
    let ids = Arc::clone(&next_id);
    let fetcher = ScriptedFetcher::new(move |_, _, _| {
        let start = ids.fetch_add(5, Ordering::SeqCst);
        page(start..start + 5, None)
    });

    let scheduler = build_scheduler(
        config,
        &["a", "b"],
        &fetcher,
        &storage,
        RunOptions::default(),
    );
    let handle = scheduler.stop_handle();
    let run = tokio::spawn(scheduler.run());

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(handle.cancel());
    assert!(!handle.cancel());

    let report = tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .expect("crawl did not stop after cancel")
        .unwrap()
        .unwrap();

    assert_eq!(report.status, CrawlStatus::Stopped);
    assert_eq!(report.reason, Some(StopReason::Cancelled));
    assert!(report.total_unique > 0);
    assert_eq!(storage.record_count("cancelled") as u64, report.total_unique);

    let saved = storage.load("cancelled").unwrap().unwrap();
    assert_eq!(saved.total_unique, report.total_unique);
    assert_eq!(saved.reason, Some(StopReason::Cancelled));
}

fn stopped_state(ids: &[&str]) -> ScheduleState {
    let mut state = ScheduleState::new("resumed", &descriptors(ids));
    state.status = CrawlStatus::Stopped;
    state.reason = Some(StopReason::ConsecutiveEmpty);
    state.consecutive_empty = 3;
    state.cursor.iteration_count = 3;
    state.cursor.numeric_offset = 750;
    state.seen_keys = ["1", "2"].iter().map(|s| s.to_string()).collect();
    state.total_fetched = 2;
    state.total_unique = 2;
    state
}

#[tokio::test]
async fn test_resume_continues_from_stored_cursor_and_seen_items() {
    let mut config = test_config("resumed", ENDPOINT);
    config.stop.empty_threshold = 1;
    let storage = Arc::new(MemoryStorage::with_state(stopped_state(&["a"])));

    let fetcher = ScriptedFetcher::new(|_, _, call| {
        if call == 0 {
            page([1, 2, 3], None)
        } else {
            FetchOutcome::Empty
        }
    });

    let report = run_to_end(build_scheduler(
        config,
        &["a"],
        &fetcher,
        &storage,
        RunOptions::default(),
    ))
    .await;

    assert_eq!(fetcher.calls()[0].1, Cursor::Offset(775));
    assert_eq!(storage.record_ids("resumed"), vec!["3"]);
    assert_eq!(report.total_unique, 3);
    assert_eq!(report.total_fetched, 5);
    assert_eq!(report.reason, Some(StopReason::ConsecutiveEmpty));
}

#[tokio::test]
async fn test_resume_reactivates_credential_with_new_token() {
    let mut config = test_config("resumed", ENDPOINT);
    config.stop.empty_threshold = 1;

    let mut state = stopped_state(&["a"]);
    let stale = state.credentials.get_mut("a").unwrap();
    stale.fingerprint = "0000000000000000".to_string();
    stale.disable("rejected in a prior run".to_string());
    let storage = Arc::new(MemoryStorage::with_state(state));

    let fetcher = ScriptedFetcher::new(|_, _, _| FetchOutcome::Empty);
    let report = run_to_end(build_scheduler(
        config,
        &["a"],
        &fetcher,
        &storage,
        RunOptions::default(),
    ))
    .await;

    assert_eq!(report.reason, Some(StopReason::ConsecutiveEmpty));
    assert_eq!(fetcher.call_count(), 1);
    assert!(storage.last_saved().unwrap().credentials["a"].active);
}

#[tokio::test]
async fn test_completed_target_is_only_recrawled_when_fresh() {
    let mut completed = stopped_state(&["a"]);
    completed.status = CrawlStatus::Completed;
    completed.reason = Some(StopReason::TargetReached);

    let storage = Arc::new(MemoryStorage::with_state(completed));
    let fetcher = ScriptedFetcher::new(|_, _, _| FetchOutcome::Empty);

    let report = run_to_end(build_scheduler(
        test_config("resumed", ENDPOINT),
        &["a"],
        &fetcher,
        &storage,
        RunOptions::default(),
    ))
    .await;

    assert!(report.already_completed);
    assert_eq!(report.status, CrawlStatus::Completed);
    assert_eq!(report.total_unique, 2);
    assert_eq!(fetcher.call_count(), 0);

    let fresh = RunOptions {
        fresh: true,
        config_hash: Some("hash-2".to_string()),
    };
    let report = run_to_end(build_scheduler(
        test_config("resumed", ENDPOINT),
        &["a"],
        &fetcher,
        &storage,
        fresh,
    ))
    .await;

    assert!(!report.already_completed);
    assert_eq!(report.total_unique, 0);
    assert_eq!(fetcher.calls()[0].1, Cursor::Offset(250));
    assert_eq!(
        storage.last_saved().unwrap().config_hash.as_deref(),
        Some("hash-2")
    );
}

#[tokio::test]
async fn test_snapshot_failures_do_not_abort_the_run() {
    let config = test_config("flaky-store", ENDPOINT);
    let storage = Arc::new(MemoryStorage::new());
    // Initial snapshot and first final attempt
    storage.fail_next_saves(2);

    let fetcher = ScriptedFetcher::new(|_, _, _| FetchOutcome::Empty);
    let report = run_to_end(build_scheduler(
        config,
        &["a"],
        &fetcher,
        &storage,
        RunOptions::default(),
    ))
    .await;

    assert_eq!(report.reason, Some(StopReason::ConsecutiveEmpty));
    let saved = storage.load("flaky-store").unwrap().unwrap();
    assert_eq!(saved.status, CrawlStatus::Stopped);
}

#[tokio::test]
async fn test_unsaved_final_snapshot_is_an_error() {
    let config = test_config("broken-store", ENDPOINT);
    let storage = Arc::new(MemoryStorage::new());
    storage.fail_next_saves(100);

    let fetcher = ScriptedFetcher::new(|_, _, _| FetchOutcome::Empty);
    let scheduler = build_scheduler(config, &["a"], &fetcher, &storage, RunOptions::default());
    let result = tokio::time::timeout(Duration::from_secs(10), scheduler.run())
        .await
        .expect("crawl did not stop in time");

    assert!(matches!(result, Err(FleetError::Storage(_))));
}

#[tokio::test]
async fn test_scheduler_requires_credentials() {
    let storage = Arc::new(MemoryStorage::new());
    let fetcher = ScriptedFetcher::new(|_, _, _| FetchOutcome::Empty);

    let result = CrawlScheduler::new(
        test_config("nobody", ENDPOINT),
        Vec::new(),
        fetcher,
        storage.clone(),
        storage,
        RunOptions::default(),
    );

    assert!(matches!(result, Err(FleetError::NoCredentials { .. })));
}
