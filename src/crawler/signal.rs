//! Shared stop flag
//!
//! One flag is shared by the supervisor and every worker. The first stop
//! request wins and decides the terminal status; later requests are ignored.
//! Sleeps taken through the signal end early once it is raised.

use crate::state::StopReason;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Debug, Default)]
pub struct StopSignal {
    stopped: AtomicBool,
    reason: Mutex<Option<StopReason>>,
    notify: Notify,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raises the flag with a reason
    ///
    /// Returns false if the signal was already raised.
    pub fn request(&self, reason: StopReason) -> bool {
        {
            let mut current = self.reason.lock().unwrap_or_else(PoisonError::into_inner);
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
        }
        self.stopped.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
        true
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// The reason of the winning stop request
    pub fn reason(&self) -> Option<StopReason> {
        *self.reason.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sleeps for `duration` or until the signal is raised
    ///
    /// Returns true if the signal is raised when the sleep ends.
    pub async fn sleep(&self, duration: Duration) -> bool {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if self.is_stopped() {
            return true;
        }

        tokio::select! {
            _ = &mut notified => true,
            _ = tokio::time::sleep(duration) => self.is_stopped(),
        }
    }

    /// Waits until the signal is raised
    pub async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_stopped() {
                return;
            }
            notified.await;
        }
    }
}

/// Handle used to cancel a running crawl from outside
#[derive(Debug, Clone)]
pub struct StopHandle {
    signal: std::sync::Arc<StopSignal>,
}

impl StopHandle {
    pub(crate) fn new(signal: std::sync::Arc<StopSignal>) -> Self {
        Self { signal }
    }

    /// Requests a graceful stop; in-flight fetches finish first
    pub fn cancel(&self) -> bool {
        self.signal.request(StopReason::Cancelled)
    }

    pub fn is_stopped(&self) -> bool {
        self.signal.is_stopped()
    }
}
