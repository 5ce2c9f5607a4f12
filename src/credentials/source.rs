use crate::config::CredentialEntry;
use crate::credentials::CredentialDescriptor;
use crate::FleetError;
use std::path::PathBuf;

/// Supplies the credential list a scheduler is constructed with
///
/// The list is read once, at scheduler construction.
pub trait CredentialSource {
    fn list(&self) -> Result<Vec<CredentialDescriptor>, FleetError>;
}

/// Credentials declared as `[[credential]]` tables in the config file
pub struct ConfigCredentialSource {
    entries: Vec<CredentialEntry>,
}

impl ConfigCredentialSource {
    pub fn new(entries: Vec<CredentialEntry>) -> Self {
        Self { entries }
    }
}

impl CredentialSource for ConfigCredentialSource {
    fn list(&self) -> Result<Vec<CredentialDescriptor>, FleetError> {
        self.entries
            .iter()
            .map(|entry| {
                let token = match (&entry.token, &entry.token_env) {
                    (Some(token), _) => token.clone(),
                    (None, Some(var)) => std::env::var(var).map_err(|_| {
                        FleetError::Credential(format!(
                            "environment variable {} for credential '{}' is not set",
                            var, entry.id
                        ))
                    })?,
                    (None, None) => {
                        return Err(FleetError::Credential(format!(
                            "credential '{}' has no token",
                            entry.id
                        )))
                    }
                };

                Ok(CredentialDescriptor {
                    id: entry.id.clone(),
                    token,
                    route: entry.route.clone(),
                    identity: entry.identity.clone(),
                })
            })
            .collect()
    }
}

/// Credentials stored as a JSON array of descriptor objects
pub struct JsonFileCredentialSource {
    path: PathBuf,
}

impl JsonFileCredentialSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl CredentialSource for JsonFileCredentialSource {
    fn list(&self) -> Result<Vec<CredentialDescriptor>, FleetError> {
        let content = std::fs::read_to_string(&self.path)?;
        let descriptors: Vec<CredentialDescriptor> = serde_json::from_str(&content)?;
        tracing::debug!(
            "Loaded {} credentials from {}",
            descriptors.len(),
            self.path.display()
        );
        Ok(descriptors)
    }
}
