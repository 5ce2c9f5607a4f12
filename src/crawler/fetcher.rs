//! Page fetching
//!
//! This module defines the boundary between the scheduler and the remote:
//! - The `PageFetcher` trait and its typed `FetchOutcome`
//! - A JSON-over-HTTP implementation built on reqwest
//! - Status code classification

use crate::config::TargetConfig;
use crate::credentials::CredentialDescriptor;
use crate::state::Cursor;
use crate::storage::Record;
use crate::FleetError;
use async_trait::async_trait;
use reqwest::{Client, Proxy, StatusCode};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// Result of one paginated fetch
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    /// A page of items, with the remote's continuation token if it sent one
    Page {
        items: Vec<Record>,
        next_token: Option<String>,
    },

    /// The remote returned no items and no continuation
    Empty,

    /// The remote throttled this credential
    RateLimited,

    /// The remote rejected this credential
    InvalidCredential,

    /// A recoverable failure
    TransientError { detail: String },

    /// An unrecoverable failure for this credential
    FatalError { detail: String },
}

impl FetchOutcome {
    /// Short label used in logs
    pub fn label(&self) -> &'static str {
        match self {
            Self::Page { .. } => "page",
            Self::Empty => "empty",
            Self::RateLimited => "rate_limited",
            Self::InvalidCredential => "invalid_credential",
            Self::TransientError { .. } => "transient_error",
            Self::FatalError { .. } => "fatal_error",
        }
    }
}

/// Issues one paginated request using a credential
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(
        &self,
        credential: &CredentialDescriptor,
        cursor: &Cursor,
        page_size: u32,
    ) -> FetchOutcome;
}

/// Maps a non-success HTTP status to an outcome
///
/// # Status Code Mapping
///
/// - 429 → RateLimited
/// - 401, 403 → InvalidCredential
/// - 408, 5xx → TransientError
/// - anything else → FatalError
pub fn classify_status(status: StatusCode) -> FetchOutcome {
    match status.as_u16() {
        429 => FetchOutcome::RateLimited,
        401 | 403 => FetchOutcome::InvalidCredential,
        408 | 500..=599 => FetchOutcome::TransientError {
            detail: format!("HTTP {}", status.as_u16()),
        },
        code => FetchOutcome::FatalError {
            detail: format!("HTTP {}", code),
        },
    }
}

/// Fetches pages from a JSON endpoint
///
/// Each credential gets its own client so that its route (proxy) and
/// identity (user agent) apply to every request it makes. Requests carry
/// the token as a bearer token and the cursor and page size as query
/// parameters.
pub struct HttpPageFetcher {
    target: TargetConfig,
    clients: Mutex<HashMap<String, Client>>,
}

impl HttpPageFetcher {
    /// Creates a fetcher for the configured target
    pub fn new(target: TargetConfig) -> Self {
        Self {
            target,
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// Builds the HTTP client used by one credential
    pub fn build_client(
        credential: &CredentialDescriptor,
        timeout: Duration,
    ) -> Result<Client, FleetError> {
        let user_agent = credential
            .identity
            .clone()
            .unwrap_or_else(|| format!("fleet-crawl/{}", env!("CARGO_PKG_VERSION")));

        let mut builder = Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .gzip(true)
            .brotli(true);

        if let Some(route) = &credential.route {
            builder = builder.proxy(Proxy::all(route)?);
        }

        Ok(builder.build()?)
    }

    fn client_for(&self, credential: &CredentialDescriptor) -> Result<Client, FleetError> {
        let mut clients = self.clients.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(client) = clients.get(&credential.id) {
            return Ok(client.clone());
        }

        let client = Self::build_client(credential, self.target.request_timeout())?;
        clients.insert(credential.id.clone(), client.clone());
        Ok(client)
    }

    /// Turns a decoded response body into an outcome
    pub fn parse_body(&self, body: &Value) -> FetchOutcome {
        let items = match body.get(&self.target.items_field) {
            Some(Value::Array(items)) => items,
            Some(Value::Null) | None => {
                return self.page_or_empty(Vec::new(), self.next_token(body));
            }
            Some(_) => {
                return FetchOutcome::TransientError {
                    detail: format!("field '{}' is not an array", self.target.items_field),
                }
            }
        };

        let mut records = Vec::with_capacity(items.len());
        for item in items {
            match item.get(&self.target.id_field).and_then(id_string) {
                Some(id) => records.push(Record::new(id, item.clone())),
                None => tracing::debug!(
                    "Dropping item without a usable '{}' field",
                    self.target.id_field
                ),
            }
        }

        self.page_or_empty(records, self.next_token(body))
    }

    fn next_token(&self, body: &Value) -> Option<String> {
        body.get(&self.target.next_token_field)
            .and_then(id_string)
            .filter(|token| !token.is_empty() && token != "0")
    }

    fn page_or_empty(&self, items: Vec<Record>, next_token: Option<String>) -> FetchOutcome {
        if items.is_empty() && next_token.is_none() {
            FetchOutcome::Empty
        } else {
            FetchOutcome::Page { items, next_token }
        }
    }
}

/// Reads an identifier that may be encoded as a string or a number
fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[async_trait]
impl PageFetcher for HttpPageFetcher {
    async fn fetch(
        &self,
        credential: &CredentialDescriptor,
        cursor: &Cursor,
        page_size: u32,
    ) -> FetchOutcome {
        let client = match self.client_for(credential) {
            Ok(client) => client,
            Err(e) => {
                return FetchOutcome::FatalError {
                    detail: format!("cannot build client: {}", e),
                }
            }
        };

        let cursor_param = cursor.as_param();
        let page_size_param = page_size.to_string();
        let response = client
            .get(&self.target.endpoint)
            .bearer_auth(&credential.token)
            .query(&[
                (self.target.cursor_param.as_str(), cursor_param.as_str()),
                (self.target.page_size_param.as_str(), page_size_param.as_str()),
            ])
            .send()
            .await;

        let response = match response {
            Ok(response) => response,
            Err(e) => {
                return FetchOutcome::TransientError {
                    detail: if e.is_timeout() {
                        "request timed out".to_string()
                    } else {
                        format!("network error: {}", e)
                    },
                }
            }
        };

        let status = response.status();
        if !status.is_success() {
            tracing::debug!(
                "Credential {} got HTTP {} at cursor {}",
                credential.id,
                status.as_u16(),
                cursor
            );
            return classify_status(status);
        }

        if status == StatusCode::NO_CONTENT {
            return FetchOutcome::Empty;
        }

        match response.json::<Value>().await {
            Ok(body) => self.parse_body(&body),
            Err(e) => FetchOutcome::TransientError {
                detail: format!("undecodable response: {}", e),
            },
        }
    }
}
