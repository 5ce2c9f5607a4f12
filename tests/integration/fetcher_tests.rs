use crate::common::test_config;
use fleet_crawl::crawler::{CrawlScheduler, FetchOutcome, HttpPageFetcher, PageFetcher, RunOptions};
use fleet_crawl::credentials::CredentialDescriptor;
use fleet_crawl::state::{CrawlStatus, Cursor, StopReason};
use fleet_crawl::storage::{SqliteStorage, StateStore};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn fetcher_for(server: &MockServer) -> HttpPageFetcher {
    let config = test_config("followers", &format!("{}/list", server.uri()));
    HttpPageFetcher::new(config.target)
}

async fn outcome_for_status(status: u16) -> FetchOutcome {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/list"))
        .respond_with(ResponseTemplate::new(status))
        .mount(&server)
        .await;

    let fetcher = fetcher_for(&server);
    let credential = CredentialDescriptor::new("a", "tok-a");
    fetcher.fetch(&credential, &Cursor::Offset(250), 10).await
}

#[tokio::test]
async fn test_page_request_carries_token_cursor_and_identity() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/list"))
        .and(header("authorization", "Bearer tok-a"))
        .and(header("user-agent", "agent/1.0"))
        .and(query_param("cursor", "250"))
        .and(query_param("count", "10"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "items": [{"id": 1, "name": "first"}, {"id": "2"}],
            "next_cursor": "900|abcXYZ"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let fetcher = fetcher_for(&server);
    let mut credential = CredentialDescriptor::new("a", "tok-a");
    credential.identity = Some("agent/1.0".to_string());

    match fetcher.fetch(&credential, &Cursor::Offset(250), 10).await {
        FetchOutcome::Page { items, next_token } => {
            let ids: Vec<_> = items.iter().map(|r| r.id.as_str()).collect();
            assert_eq!(ids, vec!["1", "2"]);
            assert_eq!(items[0].payload["name"], "first");
            assert_eq!(next_token.as_deref(), Some("900|abcXYZ"));
        }
        other => panic!("expected a page, got {:?}", other),
    }
}

#[tokio::test]
async fn test_status_codes_map_to_outcomes() {
    assert_eq!(outcome_for_status(429).await, FetchOutcome::RateLimited);
    assert_eq!(outcome_for_status(401).await, FetchOutcome::InvalidCredential);
    assert_eq!(outcome_for_status(403).await, FetchOutcome::InvalidCredential);
    assert!(matches!(
        outcome_for_status(503).await,
        FetchOutcome::TransientError { .. }
    ));
    assert!(matches!(
        outcome_for_status(404).await,
        FetchOutcome::FatalError { .. }
    ));
    assert_eq!(outcome_for_status(204).await, FetchOutcome::Empty);
}

#[tokio::test]
async fn test_undecodable_body_is_transient() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>maintenance</html>"))
        .mount(&server)
        .await;

    let fetcher = fetcher_for(&server);
    let outcome = fetcher
        .fetch(&CredentialDescriptor::new("a", "t"), &Cursor::Offset(0), 10)
        .await;
    assert!(matches!(outcome, FetchOutcome::TransientError { .. }));
}

#[tokio::test]
async fn test_slow_response_times_out_as_transient() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"items": []}))
                .set_delay(Duration::from_secs(3)),
        )
        .mount(&server)
        .await;

    let mut config = test_config("slow", &format!("{}/list", server.uri()));
    config.target.request_timeout_secs = 1;
    let fetcher = HttpPageFetcher::new(config.target);

    let outcome = fetcher
        .fetch(&CredentialDescriptor::new("a", "t"), &Cursor::Offset(0), 10)
        .await;
    assert!(matches!(outcome, FetchOutcome::TransientError { .. }));
}

#[tokio::test]
async fn test_crawl_against_http_endpoint_persists_to_sqlite() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/list"))
        .and(query_param("cursor", "250"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "items": [{"id": 10}, {"id": 11}],
            "next_cursor": "900|abc"
        })))
        .with_priority(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/list"))
        .and(query_param("cursor", "900|abc"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "items": [{"id": 11}, {"id": 12}],
            "next_cursor": 0
        })))
        .with_priority(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/list"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"items": []})))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("crawl.db");
    let storage = Arc::new(SqliteStorage::new(&db_path).unwrap());

    let mut config = test_config("followers", &format!("{}/list", server.uri()));
    config.stop.empty_threshold = 2;
    let fetcher = Arc::new(HttpPageFetcher::new(config.target.clone()));

    let scheduler = CrawlScheduler::new(
        config,
        vec![CredentialDescriptor::new("a", "tok-a")],
        fetcher,
        storage.clone(),
        storage.clone(),
        RunOptions::default(),
    )
    .unwrap();

    let report = tokio::time::timeout(Duration::from_secs(10), scheduler.run())
        .await
        .expect("crawl did not stop in time")
        .unwrap();

    assert_eq!(report.status, CrawlStatus::Stopped);
    assert_eq!(report.reason, Some(StopReason::ConsecutiveEmpty));
    assert_eq!(report.total_unique, 3);
    assert_eq!(report.total_fetched, 4);
    assert_eq!(storage.count_records("followers").unwrap(), 3);
    assert!(storage.get_record("followers", "12").unwrap().is_some());

    let saved = storage.load("followers").unwrap().unwrap();
    assert_eq!(saved.status, CrawlStatus::Stopped);
    assert_eq!(saved.total_unique, 3);
    assert_eq!(saved.cursor.opaque_suffix.as_deref(), Some("abc"));
    assert!(saved.cursor.numeric_offset >= 900);
}
