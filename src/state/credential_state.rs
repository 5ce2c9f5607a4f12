use crate::config::CredentialPolicy;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Why a request on a credential failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The remote signalled throttling
    RateLimited,

    /// A recoverable error (timeout, 5xx, undecodable response)
    Transient,

    /// The credential was revoked, challenged or otherwise rejected
    Fatal,
}

/// Tracks the rate and health of one credential
///
/// This structure carries everything needed to decide whether the credential
/// may issue a request right now, and how long until it may if not. It only
/// refers to its descriptor by id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CredentialState {
    /// Id of the descriptor this state belongs to
    pub id: String,

    /// Fingerprint of the token this state was built for
    pub fingerprint: String,

    /// False once the credential has been permanently disabled
    pub active: bool,

    /// Why the credential was disabled
    pub disabled_reason: Option<String>,

    /// Requests issued in the current window
    pub requests_this_window: u32,

    /// Start of the current window
    pub window_start: Option<DateTime<Utc>>,

    /// Last time a request was issued on this credential
    pub last_request_at: Option<DateTime<Utc>>,

    /// Transient failures since the last success
    pub consecutive_failures: u32,

    /// Whether the remote throttled this credential
    pub is_rate_limited: bool,

    /// When the current throttling cooldown ends
    pub rate_limit_until: Option<DateTime<Utc>>,

    /// Throttling signals since the last success
    pub rate_limit_strikes: u32,
}

pub(crate) fn chrono_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::milliseconds(duration.as_millis().min(i64::MAX as u128) as i64)
}

fn remaining(until: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (until - now).to_std().unwrap_or(Duration::ZERO)
}

impl CredentialState {
    /// Creates a fresh, active state for a credential
    pub fn new(id: impl Into<String>, fingerprint: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            fingerprint: fingerprint.into(),
            active: true,
            disabled_reason: None,
            requests_this_window: 0,
            window_start: None,
            last_request_at: None,
            consecutive_failures: 0,
            is_rate_limited: false,
            rate_limit_until: None,
            rate_limit_strikes: 0,
        }
    }

    fn window_expired(&self, policy: &CredentialPolicy, now: DateTime<Utc>) -> bool {
        match self.window_start {
            Some(start) => now - start >= chrono_duration(policy.window()),
            None => true,
        }
    }

    fn rate_limited_at(&self, now: DateTime<Utc>) -> bool {
        self.is_rate_limited && self.rate_limit_until.map_or(true, |until| now < until)
    }

    /// Requests counted against the window as of `now`
    fn effective_window_count(&self, policy: &CredentialPolicy, now: DateTime<Utc>) -> u32 {
        if self.window_expired(policy, now) {
            0
        } else {
            self.requests_this_window
        }
    }

    /// Checks if the credential may issue a request at `now`
    ///
    /// A credential is usable when it is active, not throttled, below its
    /// window quota, and its minimum cooldown since the last request elapsed.
    pub fn can_acquire(&self, policy: &CredentialPolicy, now: DateTime<Utc>) -> bool {
        if !self.active || self.rate_limited_at(now) {
            return false;
        }

        if self.effective_window_count(policy, now) >= policy.max_requests_per_window {
            return false;
        }

        if let Some(last) = self.last_request_at {
            if now - last < chrono_duration(policy.min_cooldown()) {
                return false;
            }
        }

        true
    }

    /// Time until the credential becomes usable
    ///
    /// Returns `None` for a disabled credential, `Some(Duration::ZERO)` when
    /// it can be used now.
    pub fn wait_time(&self, policy: &CredentialPolicy, now: DateTime<Utc>) -> Option<Duration> {
        if !self.active {
            return None;
        }

        let mut wait = Duration::ZERO;

        if self.rate_limited_at(now) {
            // A throttled credential with no end time waits a full penalty.
            let until_wait = match self.rate_limit_until {
                Some(until) => remaining(until, now),
                None => policy.rate_limit_penalty(),
            };
            wait = wait.max(until_wait);
        }

        if self.effective_window_count(policy, now) >= policy.max_requests_per_window {
            if let Some(start) = self.window_start {
                wait = wait.max(remaining(start + chrono_duration(policy.window()), now));
            }
        }

        if let Some(last) = self.last_request_at {
            wait = wait.max(remaining(last + chrono_duration(policy.min_cooldown()), now));
        }

        Some(wait)
    }

    /// Clears an expired throttling flag and rolls an elapsed window
    pub fn refresh(&mut self, policy: &CredentialPolicy, now: DateTime<Utc>) {
        if self.is_rate_limited && !self.rate_limited_at(now) {
            self.is_rate_limited = false;
            self.rate_limit_until = None;
        }

        if self.window_start.is_some() && self.window_expired(policy, now) {
            self.window_start = None;
            self.requests_this_window = 0;
        }
    }

    /// Records that a request is being issued, counting it against the window
    pub fn record_request(&mut self, policy: &CredentialPolicy, now: DateTime<Utc>) {
        self.refresh(policy, now);
        if self.window_start.is_none() {
            self.window_start = Some(now);
        }
        self.requests_this_window += 1;
        self.last_request_at = Some(now);
    }

    /// Records that a request completed successfully at `now`
    ///
    /// The request itself was already counted by [`Self::record_request`]
    /// when it was issued.
    pub fn record_success(&mut self, now: DateTime<Utc>) {
        self.last_request_at = Some(now);
        self.consecutive_failures = 0;
        self.is_rate_limited = false;
        self.rate_limit_until = None;
        self.rate_limit_strikes = 0;
    }

    /// Records a failed request
    ///
    /// Throttling sets a cooldown that escalates from the configured cooldown
    /// to the penalty on repeated strikes and never shortens an existing one.
    /// Transient failures disable the credential past the threshold; fatal
    /// failures disable it unconditionally.
    pub fn record_failure(
        &mut self,
        kind: FailureKind,
        policy: &CredentialPolicy,
        now: DateTime<Utc>,
    ) {
        self.last_request_at = Some(now);

        match kind {
            FailureKind::RateLimited => {
                self.rate_limit_strikes += 1;
                let cooldown = if self.rate_limit_strikes > 1 {
                    policy.rate_limit_penalty().max(policy.rate_limit_cooldown())
                } else {
                    policy.rate_limit_cooldown()
                };
                let until = now + chrono_duration(cooldown);
                self.is_rate_limited = true;
                self.rate_limit_until = Some(match self.rate_limit_until {
                    Some(existing) if existing > until => existing,
                    _ => until,
                });
            }
            FailureKind::Transient => {
                self.consecutive_failures += 1;
                if self.consecutive_failures >= policy.failure_threshold {
                    self.disable(format!(
                        "{} consecutive transient failures",
                        self.consecutive_failures
                    ));
                }
            }
            FailureKind::Fatal => {
                self.disable("rejected by remote".to_string());
            }
        }
    }

    /// Permanently disables this credential
    pub fn disable(&mut self, reason: String) {
        self.active = false;
        self.disabled_reason = Some(reason);
    }

    /// Reactivates a disabled credential after an explicit external refresh
    pub fn reactivate(&mut self, fingerprint: impl Into<String>) {
        self.fingerprint = fingerprint.into();
        self.active = true;
        self.disabled_reason = None;
        self.consecutive_failures = 0;
        self.is_rate_limited = false;
        self.rate_limit_until = None;
        self.rate_limit_strikes = 0;
    }
}
