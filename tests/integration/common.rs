use async_trait::async_trait;
use fleet_crawl::config::{parse_config, Config};
use fleet_crawl::crawler::{CrawlReport, CrawlScheduler, FetchOutcome, PageFetcher, RunOptions};
use fleet_crawl::credentials::CredentialDescriptor;
use fleet_crawl::state::Cursor;
use fleet_crawl::storage::{MemoryStorage, Record};
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Creates a config with short timings suited to tests
pub fn test_config(key: &str, endpoint: &str) -> Config {
    parse_config(&format!(
        r#"
[target]
key = "{key}"
endpoint = "{endpoint}"
request-timeout-secs = 5

[scheduler]
page-size = 10

[credentials]
max-requests-per-window = 100000
min-cooldown-ms = 0
rate-limit-cooldown-secs = 1
rate-limit-penalty-secs = 1

[stop]
empty-threshold = 3
stagnation-ticks = 3
monitor-interval-ms = 20
backoff-initial-ms = 10
backoff-max-secs = 1

[retry]
transient-delay-ms = 5

[storage]
database-path = "unused.db"
"#
    ))
    .expect("test config should parse")
}

pub fn descriptors(ids: &[&str]) -> Vec<CredentialDescriptor> {
    ids.iter()
        .map(|id| CredentialDescriptor::new(*id, format!("token-{}", id)))
        .collect()
}

/// A page whose items carry the given numeric ids
pub fn page(ids: impl IntoIterator<Item = u64>, token: Option<&str>) -> FetchOutcome {
    FetchOutcome::Page {
        items: ids
            .into_iter()
            .map(|id| Record::new(id.to_string(), json!({ "id": id })))
            .collect(),
        next_token: token.map(str::to_string),
    }
}

type Script = dyn Fn(&str, &Cursor, usize) -> FetchOutcome + Send + Sync;

/// Fetcher that answers from a closure and records every call
///
/// The closure receives the credential id, the cursor and the zero-based
/// call number.
pub struct ScriptedFetcher {
    script: Box<Script>,
    calls: Mutex<Vec<(String, Cursor)>>,
}

impl ScriptedFetcher {
    pub fn new(
        script: impl Fn(&str, &Cursor, usize) -> FetchOutcome + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            script: Box::new(script),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> Vec<(String, Cursor)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl PageFetcher for ScriptedFetcher {
    async fn fetch(
        &self,
        credential: &CredentialDescriptor,
        cursor: &Cursor,
        _page_size: u32,
    ) -> FetchOutcome {
        tokio::time::sleep(Duration::from_millis(1)).await;
        let call = {
            let mut calls = self.calls.lock().unwrap();
            calls.push((credential.id.clone(), cursor.clone()));
            calls.len() - 1
        };
        (self.script)(&credential.id, cursor, call)
    }
}

pub fn build_scheduler(
    config: Config,
    ids: &[&str],
    fetcher: &Arc<ScriptedFetcher>,
    storage: &Arc<MemoryStorage>,
    options: RunOptions,
) -> CrawlScheduler {
    CrawlScheduler::new(
        config,
        descriptors(ids),
        fetcher.clone(),
        storage.clone(),
        storage.clone(),
        options,
    )
    .expect("scheduler should start")
}

/// Runs a scheduler, failing the test if it does not stop in time
pub async fn run_to_end(scheduler: CrawlScheduler) -> CrawlReport {
    tokio::time::timeout(Duration::from_secs(10), scheduler.run())
        .await
        .expect("crawl did not stop in time")
        .expect("crawl failed")
}
