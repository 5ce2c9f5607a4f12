//! Credential descriptors and the sources they are read from
//!
//! A credential is the (session token, network route, client identity) tuple
//! used to authenticate one fetch. Descriptors are immutable; all mutable
//! bookkeeping lives in [`crate::state::CredentialState`].

mod source;

pub use source::{ConfigCredentialSource, CredentialSource, JsonFileCredentialSource};

use crate::config::Config;
use crate::FleetError;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fmt;

/// Immutable description of one credential
#[derive(Clone, Deserialize, PartialEq, Eq)]
pub struct CredentialDescriptor {
    /// Opaque identifier, unique within a crawl
    pub id: String,

    /// Secret or session token
    pub token: String,

    /// Network egress route (HTTP proxy URL)
    #[serde(default)]
    pub route: Option<String>,

    /// Client identity string, sent as the user agent
    #[serde(default)]
    pub identity: Option<String>,
}

impl CredentialDescriptor {
    pub fn new(id: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            token: token.into(),
            route: None,
            identity: None,
        }
    }

    /// Short, non-reversible fingerprint of the token
    ///
    /// Persisted alongside the credential state so that a resumed crawl can
    /// tell when a token was replaced.
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.token.as_bytes());
        hex::encode(&digest[..8])
    }
}

// Tokens never end up in logs.
impl fmt::Debug for CredentialDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialDescriptor")
            .field("id", &self.id)
            .field("token", &"<redacted>")
            .field("route", &self.route)
            .field("identity", &self.identity)
            .finish()
    }
}

/// Reads every credential a config declares
///
/// Inline `[[credential]]` entries come first, followed by the JSON file
/// named by `credentials.file`. An id listed twice is an error.
pub fn load_credentials(config: &Config) -> Result<Vec<CredentialDescriptor>, FleetError> {
    let mut descriptors = ConfigCredentialSource::new(config.credential_entries.clone()).list()?;
    if let Some(file) = &config.credentials.file {
        descriptors.extend(JsonFileCredentialSource::new(file).list()?);
    }

    let mut ids = HashSet::new();
    for descriptor in &descriptors {
        if !ids.insert(descriptor.id.as_str()) {
            return Err(FleetError::Credential(format!(
                "credential id '{}' is listed more than once",
                descriptor.id
            )));
        }
    }

    Ok(descriptors)
}
