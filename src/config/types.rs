use serde::Deserialize;
use std::time::Duration;

/// Main configuration structure for Fleet-Crawl
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub target: TargetConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub credentials: CredentialPolicy,
    #[serde(default)]
    pub cursor: CursorConfig,
    #[serde(default)]
    pub stop: StopConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub snapshot: SnapshotConfig,
    pub storage: StorageConfig,
    #[serde(default, rename = "credential")]
    pub credential_entries: Vec<CredentialEntry>,
}

/// The paginated remote resource being crawled
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TargetConfig {
    /// Key under which scheduler state and records are stored
    pub key: String,

    /// Endpoint that serves one page per request
    pub endpoint: String,

    /// Query parameter carrying the cursor
    #[serde(default = "default_cursor_param")]
    pub cursor_param: String,

    /// Query parameter carrying the page size
    #[serde(default = "default_page_size_param")]
    pub page_size_param: String,

    /// JSON field holding the array of items
    #[serde(default = "default_items_field")]
    pub items_field: String,

    /// JSON field inside each item holding its unique identifier
    #[serde(default = "default_id_field")]
    pub id_field: String,

    /// JSON field holding the continuation token, if the remote sends one
    #[serde(default = "default_next_token_field")]
    pub next_token_field: String,

    /// Per-request timeout (seconds)
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Stop with `Completed` once this many unique items were collected
    #[serde(default)]
    pub max_items: Option<u64>,
}

/// Worker pool sizing and request shape
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct SchedulerConfig {
    /// Number of concurrent workers (0 = one per credential)
    pub workers: u32,

    /// Items requested per page
    pub page_size: u32,
}

/// Per-credential rate and health policy
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct CredentialPolicy {
    /// Length of the rolling request window (seconds)
    pub window_secs: u64,

    /// Maximum requests a credential may issue per window
    pub max_requests_per_window: u32,

    /// Minimum time between two requests on the same credential (milliseconds)
    pub min_cooldown_ms: u64,

    /// Cooldown applied on the first throttling signal (seconds)
    pub rate_limit_cooldown_secs: u64,

    /// Cooldown applied on repeated throttling signals (seconds)
    pub rate_limit_penalty_secs: u64,

    /// Consecutive transient failures before a credential is disabled
    pub failure_threshold: u32,

    /// Optional JSON file listing additional credentials
    #[serde(default)]
    pub file: Option<String>,
}

/// Cursor ramp and fallback increments
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct CursorConfig {
    /// Number of pages that use the large stride
    pub ramp_pages: u64,

    /// Stride used during the ramp
    pub large_stride: u64,

    /// Stride used after the ramp and for manual increments
    pub small_stride: u64,

    /// Manually incremented pages without unique growth before the crawl stops
    pub manual_stall_pages: u32,
}

/// Global stop conditions and blocked-pool backoff
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct StopConfig {
    /// Consecutive empty pages before the crawl stops
    pub empty_threshold: u32,

    /// Monitoring ticks without unique growth before the crawl stops
    pub stagnation_ticks: u32,

    /// Interval between supervisor monitoring ticks (milliseconds)
    pub monitor_interval_ms: u64,

    /// First backoff delay when no credential is active (milliseconds)
    pub backoff_initial_ms: u64,

    /// Upper bound on the blocked-pool backoff (seconds)
    pub backoff_max_secs: u64,
}

/// Bounded retry for transient failures
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct RetryConfig {
    /// Attempts per page before it is skipped
    pub transient_attempts: u32,

    /// Fixed delay between attempts (milliseconds)
    pub transient_delay_ms: u64,
}

/// Snapshot cadence for the scheduler state
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct SnapshotConfig {
    /// Snapshot after this many new unique items
    pub every_items: u64,

    /// Snapshot at least this often (seconds)
    pub every_secs: u64,

    /// Attempts for the final snapshot before the run reports failure
    pub final_attempts: u32,
}

/// Storage configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct StorageConfig {
    /// Path to the SQLite database file
    pub database_path: String,
}

/// One credential listed directly in the config file
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CredentialEntry {
    pub id: String,

    /// Session token given inline
    #[serde(default)]
    pub token: Option<String>,

    /// Environment variable holding the session token
    #[serde(default)]
    pub token_env: Option<String>,

    /// HTTP proxy URL requests on this credential go through
    #[serde(default)]
    pub route: Option<String>,

    /// Client identity sent as the user agent
    #[serde(default)]
    pub identity: Option<String>,
}

fn default_cursor_param() -> String {
    "cursor".to_string()
}

fn default_page_size_param() -> String {
    "count".to_string()
}

fn default_items_field() -> String {
    "items".to_string()
}

fn default_id_field() -> String {
    "id".to_string()
}

fn default_next_token_field() -> String {
    "next_cursor".to_string()
}

fn default_request_timeout_secs() -> u64 {
    30
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            page_size: 50,
        }
    }
}

impl Default for CredentialPolicy {
    fn default() -> Self {
        Self {
            window_secs: 3600,
            max_requests_per_window: 180,
            min_cooldown_ms: 2000,
            rate_limit_cooldown_secs: 60,
            rate_limit_penalty_secs: 300,
            failure_threshold: 3,
            file: None,
        }
    }
}

impl Default for CursorConfig {
    fn default() -> Self {
        Self {
            ramp_pages: 3,
            large_stride: 250,
            small_stride: 25,
            manual_stall_pages: 3,
        }
    }
}

impl Default for StopConfig {
    fn default() -> Self {
        Self {
            empty_threshold: 3,
            stagnation_ticks: 3,
            monitor_interval_ms: 5000,
            backoff_initial_ms: 1000,
            backoff_max_secs: 300,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            transient_attempts: 3,
            transient_delay_ms: 2000,
        }
    }
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            every_items: 500,
            every_secs: 30,
            final_attempts: 3,
        }
    }
}

impl TargetConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl CredentialPolicy {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn min_cooldown(&self) -> Duration {
        Duration::from_millis(self.min_cooldown_ms)
    }

    pub fn rate_limit_cooldown(&self) -> Duration {
        Duration::from_secs(self.rate_limit_cooldown_secs)
    }

    pub fn rate_limit_penalty(&self) -> Duration {
        Duration::from_secs(self.rate_limit_penalty_secs)
    }
}

impl StopConfig {
    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }

    pub fn backoff_initial(&self) -> Duration {
        Duration::from_millis(self.backoff_initial_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_secs(self.backoff_max_secs)
    }
}

impl RetryConfig {
    pub fn transient_delay(&self) -> Duration {
        Duration::from_millis(self.transient_delay_ms)
    }
}

impl SnapshotConfig {
    pub fn every(&self) -> Duration {
        Duration::from_secs(self.every_secs)
    }
}
