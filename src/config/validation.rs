use crate::config::types::{
    Config, CredentialEntry, CredentialPolicy, CursorConfig, RetryConfig, SchedulerConfig,
    SnapshotConfig, StopConfig, TargetConfig,
};
use crate::ConfigError;
use std::collections::HashSet;
use url::Url;

/// Validates the entire configuration
pub fn validate(config: &Config) -> Result<(), ConfigError> {
    validate_target_config(&config.target)?;
    validate_scheduler_config(&config.scheduler)?;
    validate_credential_policy(&config.credentials)?;
    validate_cursor_config(&config.cursor)?;
    validate_stop_config(&config.stop)?;
    validate_retry_config(&config.retry)?;
    validate_snapshot_config(&config.snapshot)?;

    if config.storage.database_path.is_empty() {
        return Err(ConfigError::Validation(
            "database_path cannot be empty".to_string(),
        ));
    }

    validate_credential_entries(&config.credential_entries)?;
    Ok(())
}

fn validate_target_config(config: &TargetConfig) -> Result<(), ConfigError> {
    if config.key.trim().is_empty() {
        return Err(ConfigError::Validation(
            "target key cannot be empty".to_string(),
        ));
    }

    let url = Url::parse(&config.endpoint)
        .map_err(|e| ConfigError::InvalidUrl(format!("Invalid endpoint: {}", e)))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ConfigError::InvalidUrl(format!(
            "Endpoint '{}' must use http or https",
            config.endpoint
        )));
    }

    for (name, value) in [
        ("cursor_param", &config.cursor_param),
        ("page_size_param", &config.page_size_param),
        ("items_field", &config.items_field),
        ("id_field", &config.id_field),
        ("next_token_field", &config.next_token_field),
    ] {
        if value.is_empty() {
            return Err(ConfigError::Validation(format!("{} cannot be empty", name)));
        }
    }

    if config.request_timeout_secs == 0 {
        return Err(ConfigError::Validation(
            "request_timeout_secs must be >= 1".to_string(),
        ));
    }

    if config.max_items == Some(0) {
        return Err(ConfigError::Validation(
            "max_items must be >= 1 when set".to_string(),
        ));
    }

    Ok(())
}

fn validate_scheduler_config(config: &SchedulerConfig) -> Result<(), ConfigError> {
    if config.workers > 256 {
        return Err(ConfigError::Validation(format!(
            "workers must be between 0 and 256, got {}",
            config.workers
        )));
    }

    if config.page_size < 1 {
        return Err(ConfigError::Validation(format!(
            "page_size must be >= 1, got {}",
            config.page_size
        )));
    }

    Ok(())
}

fn validate_credential_policy(config: &CredentialPolicy) -> Result<(), ConfigError> {
    if config.window_secs == 0 {
        return Err(ConfigError::Validation(
            "window_secs must be >= 1".to_string(),
        ));
    }

    if config.max_requests_per_window < 1 {
        return Err(ConfigError::Validation(format!(
            "max_requests_per_window must be >= 1, got {}",
            config.max_requests_per_window
        )));
    }

    if config.rate_limit_penalty_secs < config.rate_limit_cooldown_secs {
        return Err(ConfigError::Validation(format!(
            "rate_limit_penalty_secs ({}) must be >= rate_limit_cooldown_secs ({})",
            config.rate_limit_penalty_secs, config.rate_limit_cooldown_secs
        )));
    }

    if config.failure_threshold < 1 {
        return Err(ConfigError::Validation(
            "failure_threshold must be >= 1".to_string(),
        ));
    }

    Ok(())
}

fn validate_cursor_config(config: &CursorConfig) -> Result<(), ConfigError> {
    if config.large_stride == 0 || config.small_stride == 0 {
        return Err(ConfigError::Validation(format!(
            "cursor strides must be >= 1, got large={} small={}",
            config.large_stride, config.small_stride
        )));
    }

    if config.manual_stall_pages < 1 {
        return Err(ConfigError::Validation(
            "manual_stall_pages must be >= 1".to_string(),
        ));
    }

    Ok(())
}

fn validate_stop_config(config: &StopConfig) -> Result<(), ConfigError> {
    if config.empty_threshold < 1 || config.stagnation_ticks < 1 {
        return Err(ConfigError::Validation(format!(
            "empty_threshold and stagnation_ticks must be >= 1, got {} and {}",
            config.empty_threshold, config.stagnation_ticks
        )));
    }

    if config.monitor_interval_ms < 10 {
        return Err(ConfigError::Validation(format!(
            "monitor_interval_ms must be >= 10ms, got {}ms",
            config.monitor_interval_ms
        )));
    }

    if config.backoff_initial_ms == 0 || config.backoff_max_secs == 0 {
        return Err(ConfigError::Validation(
            "backoff delays must be non-zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_retry_config(config: &RetryConfig) -> Result<(), ConfigError> {
    if config.transient_attempts < 1 {
        return Err(ConfigError::Validation(
            "transient_attempts must be >= 1".to_string(),
        ));
    }

    Ok(())
}

fn validate_snapshot_config(config: &SnapshotConfig) -> Result<(), ConfigError> {
    if config.every_items == 0 || config.every_secs == 0 {
        return Err(ConfigError::Validation(
            "snapshot cadence must be non-zero".to_string(),
        ));
    }

    if config.final_attempts < 1 {
        return Err(ConfigError::Validation(
            "final_attempts must be >= 1".to_string(),
        ));
    }

    Ok(())
}

fn validate_credential_entries(entries: &[CredentialEntry]) -> Result<(), ConfigError> {
    let mut ids = HashSet::new();

    for entry in entries {
        if entry.id.trim().is_empty() {
            return Err(ConfigError::Validation(
                "credential id cannot be empty".to_string(),
            ));
        }

        if !ids.insert(entry.id.as_str()) {
            return Err(ConfigError::Validation(format!(
                "duplicate credential id '{}'",
                entry.id
            )));
        }

        match (&entry.token, &entry.token_env) {
            (Some(_), Some(_)) => {
                return Err(ConfigError::Validation(format!(
                    "credential '{}' sets both token and token_env",
                    entry.id
                )));
            }
            (None, None) => {
                return Err(ConfigError::Validation(format!(
                    "credential '{}' needs a token or token_env",
                    entry.id
                )));
            }
            _ => {}
        }

        if let Some(route) = &entry.route {
            Url::parse(route).map_err(|e| {
                ConfigError::InvalidUrl(format!(
                    "Invalid route for credential '{}': {}",
                    entry.id, e
                ))
            })?;
        }
    }

    Ok(())
}
