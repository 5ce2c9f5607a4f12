use serde::{Deserialize, Serialize};
use std::fmt;

/// Position in the paginated remote resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Cursor {
    /// Numeric offset derived locally
    Offset(u64),

    /// Continuation token as received from the remote, or a locally tracked
    /// count joined with a preserved opaque suffix (`"<count>|<suffix>"`)
    Token(String),
}

impl Cursor {
    /// Numeric position this cursor encodes, if any
    ///
    /// Tokens of the form `"<count>|<suffix>"` expose their count prefix.
    pub fn numeric_offset(&self) -> Option<u64> {
        match self {
            Self::Offset(offset) => Some(*offset),
            Self::Token(token) => split_token(token).and_then(|(count, _)| count.parse().ok()),
        }
    }

    /// String form sent to the remote
    pub fn as_param(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Offset(offset) => write!(f, "{}", offset),
            Self::Token(token) => f.write_str(token),
        }
    }
}

/// Splits a `"<count>|<suffix>"` token into its two halves
pub(crate) fn split_token(token: &str) -> Option<(&str, &str)> {
    let (count, suffix) = token.split_once('|')?;
    if count.is_empty() || !count.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some((count, suffix))
}

/// Pagination progress for one target
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorState {
    /// Last cursor handed out
    pub current_cursor: Option<Cursor>,

    /// Highest numeric offset handed out or reported by the remote
    pub numeric_offset: u64,

    /// Pages handed out so far; governs the stride ramp
    pub iteration_count: u64,

    /// Continuation token from the remote, issued verbatim next
    pub next_token: Option<String>,

    /// Opaque suffix of the last `"<count>|<suffix>"` token
    pub opaque_suffix: Option<String>,

    /// Cursors whose fetch did not complete and must be issued again
    #[serde(default)]
    pub requeued: Vec<Cursor>,

    /// Consecutive pages advanced by manual increment with no unique growth
    pub stalled_manual_pages: u32,
}
