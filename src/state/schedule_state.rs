use crate::credentials::CredentialDescriptor;
use crate::state::{CredentialState, CursorState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Lifecycle of a crawl against one target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrawlStatus {
    InProgress,
    Completed,
    Stopped,
    Error,
}

impl CrawlStatus {
    /// Returns true for every status except `InProgress`
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::InProgress)
    }

    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Stopped => "stopped",
            Self::Error => "error",
        }
    }

    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "in_progress" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            "stopped" => Some(Self::Stopped),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

impl fmt::Display for CrawlStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.to_db_string())
    }
}

/// Why a crawl left `InProgress`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Too many empty pages in a row
    ConsecutiveEmpty,

    /// Unique items stopped growing while fetching continued
    NoNewUniqueItems,

    /// Manual cursor increments kept returning only known items
    CursorStalled,

    /// Every credential was disabled
    AllCredentialsInactive,

    /// The configured item target was reached
    TargetReached,

    /// Stopped from outside the scheduler
    Cancelled,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConsecutiveEmpty => "consecutive_empty",
            Self::NoNewUniqueItems => "no_new_unique_items",
            Self::CursorStalled => "cursor_stalled",
            Self::AllCredentialsInactive => "all_credentials_inactive",
            Self::TargetReached => "target_reached",
            Self::Cancelled => "cancelled",
        }
    }

    /// Status a crawl ends in for this reason
    pub fn status(&self) -> CrawlStatus {
        match self {
            Self::TargetReached => CrawlStatus::Completed,
            Self::AllCredentialsInactive => CrawlStatus::Error,
            _ => CrawlStatus::Stopped,
        }
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The unit persisted to a state store
///
/// Aggregates every credential state, the cursor, the dedup set and the
/// counters for one target key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleState {
    pub target_key: String,
    pub status: CrawlStatus,
    pub reason: Option<StopReason>,

    /// Credential states keyed by credential id
    pub credentials: BTreeMap<String, CredentialState>,

    pub cursor: CursorState,

    /// Ids of every item seen so far
    pub seen_keys: BTreeSet<String>,

    /// Items fetched, duplicates included
    pub total_fetched: u64,

    /// Distinct items persisted
    pub total_unique: u64,

    /// Pages abandoned after exhausting transient retries
    #[serde(default)]
    pub skipped_pages: u64,

    /// Empty pages received in a row
    #[serde(default)]
    pub consecutive_empty: u32,

    /// Hash of the configuration this state was produced with
    pub config_hash: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ScheduleState {
    /// Creates a fresh state for the first run against a target
    pub fn new(target_key: impl Into<String>, descriptors: &[CredentialDescriptor]) -> Self {
        let now = Utc::now();
        Self {
            target_key: target_key.into(),
            status: CrawlStatus::InProgress,
            reason: None,
            credentials: descriptors
                .iter()
                .map(|d| (d.id.clone(), CredentialState::new(&d.id, d.fingerprint())))
                .collect(),
            cursor: CursorState::default(),
            seen_keys: BTreeSet::new(),
            total_fetched: 0,
            total_unique: 0,
            skipped_pages: 0,
            consecutive_empty: 0,
            config_hash: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Merges a loaded state with the current credential list
    ///
    /// States are kept for ids still listed and created for new ids; ids no
    /// longer listed are dropped. A changed token fingerprint is an external
    /// refresh and reactivates a disabled credential.
    pub fn merge_credentials(&mut self, descriptors: &[CredentialDescriptor]) {
        let mut merged = BTreeMap::new();

        for descriptor in descriptors {
            let fingerprint = descriptor.fingerprint();
            let state = match self.credentials.remove(&descriptor.id) {
                Some(mut state) => {
                    if state.fingerprint != fingerprint {
                        tracing::info!(
                            "Credential {} has a new token, reactivating",
                            descriptor.id
                        );
                        state.reactivate(fingerprint);
                    }
                    state
                }
                None => {
                    tracing::debug!("Credential {} is new in this run", descriptor.id);
                    CredentialState::new(&descriptor.id, fingerprint)
                }
            };
            merged.insert(descriptor.id.clone(), state);
        }

        for id in self.credentials.keys() {
            tracing::debug!("Dropping state of unlisted credential {}", id);
        }

        self.credentials = merged;
    }

    /// Reopens a stopped or failed crawl for another run
    pub fn reopen(&mut self) {
        self.status = CrawlStatus::InProgress;
        self.reason = None;
        self.consecutive_empty = 0;
        self.cursor.stalled_manual_pages = 0;
    }

    /// Moves the crawl into a terminal status
    pub fn finish(&mut self, reason: StopReason) {
        self.status = reason.status();
        self.reason = Some(reason);
    }
}
