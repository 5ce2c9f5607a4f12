//! Fleet-Crawl: a multi-credential, rate-limited crawl scheduler
//!
//! This crate coordinates a pool of credentials against a single paginated
//! remote resource. It decides which credential may issue the next request,
//! how long to wait when none can, how to react to throttling and
//! invalidation signals, and how to persist cursor state so that an
//! interrupted crawl resumes where it left off.

pub mod config;
pub mod crawler;
pub mod credentials;
pub mod state;
pub mod storage;

use thiserror::Error;

/// Main error type for Fleet-Crawl operations
#[derive(Debug, Error)]
pub enum FleetError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Storage error: {0}")]
    Storage(#[from] storage::StorageError),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("No credentials available for target {target}")]
    NoCredentials { target: String },

    #[error("Credential error: {0}")]
    Credential(String),
}

/// Configuration-specific errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid URL in config: {0}")]
    InvalidUrl(String),
}

/// Result type alias for Fleet-Crawl operations
pub type Result<T> = std::result::Result<T, FleetError>;

/// Result type alias for configuration operations
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

// Re-export commonly used types
pub use config::Config;
pub use crawler::{CrawlReport, CrawlScheduler, FetchOutcome, PageFetcher, RunOptions};
pub use credentials::CredentialDescriptor;
pub use state::{CrawlStatus, ScheduleState, StopReason};
