//! Credential pool with earliest-available selection
//!
//! The pool owns every `CredentialState` and picks the credential that can
//! be used soonest. Selection is a min-heap on wait time with ties broken by
//! the lowest id. Acquiring does not reserve a credential; the caller must
//! re-check with [`CredentialPool::begin_request`] right before issuing a
//! request.

use crate::config::CredentialPolicy;
use crate::credentials::CredentialDescriptor;
use crate::state::{CredentialState, FailureKind};
use chrono::{DateTime, Utc};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

/// Result of asking the pool for a credential
#[derive(Debug, Clone)]
pub enum Acquisition {
    /// This credential can be used now
    Ready(Arc<CredentialDescriptor>),

    /// Nothing is usable yet
    ///
    /// `Some(wait)` is the time until the earliest credential becomes
    /// usable. `None` means no active credential exists at all.
    Blocked(Option<Duration>),
}

/// Selects the next usable credential
pub struct CredentialPool {
    policy: CredentialPolicy,
    descriptors: HashMap<String, Arc<CredentialDescriptor>>,
    states: BTreeMap<String, CredentialState>,
}

impl CredentialPool {
    /// Creates a pool from descriptors and their (possibly restored) states
    ///
    /// Descriptors without a state get a fresh one; states without a
    /// descriptor are ignored.
    pub fn new(
        policy: CredentialPolicy,
        descriptors: Vec<CredentialDescriptor>,
        mut states: BTreeMap<String, CredentialState>,
    ) -> Self {
        let mut by_id = HashMap::new();
        let mut kept = BTreeMap::new();

        for descriptor in descriptors {
            let state = states
                .remove(&descriptor.id)
                .unwrap_or_else(|| CredentialState::new(&descriptor.id, descriptor.fingerprint()));
            kept.insert(descriptor.id.clone(), state);
            by_id.insert(descriptor.id.clone(), Arc::new(descriptor));
        }

        Self {
            policy,
            descriptors: by_id,
            states: kept,
        }
    }

    /// Picks the credential with the smallest wait time
    ///
    /// Disabled and excluded credentials are never considered.
    pub fn acquire(&mut self, excluding: &HashSet<String>, now: DateTime<Utc>) -> Acquisition {
        let mut heap = BinaryHeap::new();

        for (id, state) in self.states.iter_mut() {
            if !state.active || excluding.contains(id) {
                continue;
            }
            state.refresh(&self.policy, now);
            if let Some(wait) = state.wait_time(&self.policy, now) {
                heap.push(Reverse((wait, id.clone())));
            }
        }

        match heap.pop() {
            None => Acquisition::Blocked(None),
            Some(Reverse((wait, id))) if wait.is_zero() => match self.descriptors.get(&id) {
                Some(descriptor) => Acquisition::Ready(Arc::clone(descriptor)),
                None => Acquisition::Blocked(None),
            },
            Some(Reverse((wait, id))) => {
                tracing::trace!("Earliest credential {} is ready in {:?}", id, wait);
                Acquisition::Blocked(Some(wait))
            }
        }
    }

    /// Re-checks a credential right before a request
    ///
    /// Returns false when another worker used the credential in the
    /// meantime. A true result counts the request against the window and
    /// stamps its time, so concurrent callers see the quota already taken.
    pub fn begin_request(&mut self, id: &str, now: DateTime<Utc>) -> bool {
        let policy = &self.policy;
        match self.states.get_mut(id) {
            Some(state) => {
                state.refresh(policy, now);
                if state.can_acquire(policy, now) {
                    state.record_request(policy, now);
                    true
                } else {
                    false
                }
            }
            None => false,
        }
    }

    /// Records a successful fetch on a credential
    pub fn record_success(&mut self, id: &str, now: DateTime<Utc>) {
        if let Some(state) = self.states.get_mut(id) {
            state.record_success(now);
        }
    }

    /// Records a failed fetch on a credential
    ///
    /// Returns true when this failure disabled the credential.
    pub fn record_failure(&mut self, id: &str, kind: FailureKind, now: DateTime<Utc>) -> bool {
        let policy = &self.policy;
        match self.states.get_mut(id) {
            Some(state) => {
                let was_active = state.active;
                state.record_failure(kind, policy, now);
                if was_active && !state.active {
                    tracing::warn!(
                        "Credential {} disabled: {}",
                        id,
                        state.disabled_reason.as_deref().unwrap_or("unknown")
                    );
                    return true;
                }
                false
            }
            None => false,
        }
    }

    /// Returns true when no credential is active
    pub fn all_inactive(&self) -> bool {
        self.states.values().all(|state| !state.active)
    }

    pub fn active_count(&self) -> usize {
        self.states.values().filter(|state| state.active).count()
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn state(&self, id: &str) -> Option<&CredentialState> {
        self.states.get(id)
    }

    /// Copies every credential state for a snapshot
    pub fn snapshot(&self) -> BTreeMap<String, CredentialState> {
        self.states.clone()
    }
}
