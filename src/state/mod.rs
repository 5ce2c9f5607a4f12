//! State module for tracking crawl progress
//!
//! # Components
//!
//! - `CredentialState`: per-credential rate window, cooldown and health
//! - `CursorState`: pagination position and ramp progress
//! - `ScheduleState`: the aggregate persisted between runs

mod credential_state;
mod cursor_state;
mod schedule_state;

// Re-export main types
pub use credential_state::{CredentialState, FailureKind};
pub use cursor_state::{Cursor, CursorState};
pub use schedule_state::{CrawlStatus, ScheduleState, StopReason};

pub(crate) use cursor_state::split_token;
