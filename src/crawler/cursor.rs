//! Cursor arithmetic and advancement rules
//!
//! Cursors come from two places. The remote may return a continuation token,
//! which always wins and is issued verbatim. When it does not, the tracker
//! derives a numeric offset: the first `ramp_pages` cursors step by the large
//! stride, later ones by the small stride, rounded up to a small-stride
//! multiple. A token of the form `"<count>|<suffix>"` keeps its suffix across
//! derived cursors.

use crate::config::CursorConfig;
use crate::state::{split_token, Cursor, CursorState};

/// What a completed fetch tells the tracker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageProgress {
    /// A non-empty page, with the remote's continuation token if it sent one
    Page {
        next_token: Option<String>,
        new_unique: usize,
    },

    /// The remote returned nothing
    Empty,
}

/// Result of applying a fetch outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advance {
    /// Keep crawling
    Continue,

    /// Manual increments stopped producing new items
    Stalled,
}

/// Computes and advances cursors for one target
#[derive(Debug, Clone)]
pub struct CursorTracker {
    config: CursorConfig,
}

impl CursorTracker {
    pub fn new(config: CursorConfig) -> Self {
        Self { config }
    }

    /// Returns the cursor the next fetch should use, and marks it issued
    ///
    /// Requeued cursors go first, then a pending remote token, then a
    /// derived offset.
    pub fn next(&self, state: &mut CursorState) -> Cursor {
        if !state.requeued.is_empty() {
            let cursor = state.requeued.remove(0);
            state.current_cursor = Some(cursor.clone());
            return cursor;
        }

        let cursor = match state.next_token.take() {
            Some(token) => {
                if let Some(offset) = Cursor::Token(token.clone()).numeric_offset() {
                    state.numeric_offset = state.numeric_offset.max(offset);
                }
                Cursor::Token(token)
            }
            None => {
                let offset = self.derived_offset(state);
                state.numeric_offset = state.numeric_offset.max(offset);
                match &state.opaque_suffix {
                    Some(suffix) => Cursor::Token(format!("{}|{}", offset, suffix)),
                    None => Cursor::Offset(offset),
                }
            }
        };

        state.iteration_count += 1;
        state.current_cursor = Some(cursor.clone());
        cursor
    }

    /// Locally derived offset for the next page
    fn derived_offset(&self, state: &CursorState) -> u64 {
        let small = self.config.small_stride;
        if state.iteration_count < self.config.ramp_pages {
            (state.iteration_count + 1) * self.config.large_stride
        } else {
            // Next multiple of the small stride strictly above the offset.
            (state.numeric_offset / small + 1) * small
        }
    }

    /// Applies the outcome of a fetch
    ///
    /// A continuation token replaces whatever the tracker would have derived.
    /// A non-empty page without a token is a manual increment; too many of
    /// those in a row without new unique items reports `Stalled`.
    pub fn advance(&self, state: &mut CursorState, progress: PageProgress) -> Advance {
        match progress {
            PageProgress::Page {
                next_token: Some(token),
                ..
            } => {
                state.opaque_suffix = split_token(&token).map(|(_, suffix)| suffix.to_string());
                state.next_token = Some(token);
                state.stalled_manual_pages = 0;
                Advance::Continue
            }
            PageProgress::Page {
                next_token: None,
                new_unique,
            } => {
                if new_unique > 0 {
                    state.stalled_manual_pages = 0;
                    return Advance::Continue;
                }

                state.stalled_manual_pages += 1;
                tracing::debug!(
                    "Manual increment without new items ({} in a row)",
                    state.stalled_manual_pages
                );
                if state.stalled_manual_pages >= self.config.manual_stall_pages {
                    Advance::Stalled
                } else {
                    Advance::Continue
                }
            }
            PageProgress::Empty => Advance::Continue,
        }
    }

    /// Hands a cursor back so it is issued again before anything else
    pub fn requeue(&self, state: &mut CursorState, cursor: Cursor) {
        state.requeued.push(cursor);
    }
}
