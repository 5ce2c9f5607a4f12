//! In-process storage backend
//!
//! Keeps records and snapshots in memory and remembers every snapshot it was
//! asked to save. Failures can be injected to exercise the scheduler's
//! handling of an unavailable store.

use crate::state::ScheduleState;
use crate::storage::traits::{PersistenceGateway, StateStore, StorageError, StorageResult};
use crate::storage::Record;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Default)]
pub struct MemoryStorage {
    records: Mutex<BTreeMap<(String, String), Record>>,
    states: Mutex<HashMap<String, ScheduleState>>,
    history: Mutex<Vec<ScheduleState>>,
    batch_writes: AtomicU32,
    failing_batches: AtomicU32,
    failing_saves: AtomicU32,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Consumes one injected failure, if any are left
fn take_failure(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a snapshot as if a previous run had saved it
    pub fn with_state(state: ScheduleState) -> Self {
        let storage = Self::default();
        lock(&storage.states).insert(state.target_key.clone(), state);
        storage
    }

    /// Makes the next `n` batch writes fail
    pub fn fail_next_batches(&self, n: u32) {
        self.failing_batches.store(n, Ordering::SeqCst);
    }

    /// Makes the next `n` snapshot writes fail
    pub fn fail_next_saves(&self, n: u32) {
        self.failing_saves.store(n, Ordering::SeqCst);
    }

    pub fn record_count(&self, target_key: &str) -> usize {
        lock(&self.records)
            .keys()
            .filter(|(target, _)| target == target_key)
            .count()
    }

    pub fn record_ids(&self, target_key: &str) -> Vec<String> {
        lock(&self.records)
            .keys()
            .filter(|(target, _)| target == target_key)
            .map(|(_, id)| id.clone())
            .collect()
    }

    /// Number of successful `save_batch` calls
    pub fn batch_writes(&self) -> u32 {
        self.batch_writes.load(Ordering::SeqCst)
    }

    /// Every snapshot successfully saved, oldest first
    pub fn saved_states(&self) -> Vec<ScheduleState> {
        lock(&self.history).clone()
    }

    pub fn last_saved(&self) -> Option<ScheduleState> {
        lock(&self.history).last().cloned()
    }
}

impl PersistenceGateway for MemoryStorage {
    fn save_batch(&self, target_key: &str, records: &[Record]) -> StorageResult<()> {
        if take_failure(&self.failing_batches) {
            return Err(StorageError::Backend("injected batch failure".to_string()));
        }

        let mut stored = lock(&self.records);
        for record in records {
            stored.insert((target_key.to_string(), record.id.clone()), record.clone());
        }
        self.batch_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl StateStore for MemoryStorage {
    fn load(&self, target_key: &str) -> StorageResult<Option<ScheduleState>> {
        Ok(lock(&self.states).get(target_key).cloned())
    }

    fn save(&self, target_key: &str, state: &ScheduleState) -> StorageResult<()> {
        if take_failure(&self.failing_saves) {
            return Err(StorageError::Backend("injected save failure".to_string()));
        }

        lock(&self.states).insert(target_key.to_string(), state.clone());
        lock(&self.history).push(state.clone());
        Ok(())
    }
}
