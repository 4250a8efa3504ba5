//! Milter protocol adapter
//!
//! [`Filter`] implements the per-callback logic in terms of plain Rust
//! types and typed session ids. [`make_callbacks`] binds it to indymilter.

mod callbacks;
mod filter;

pub use callbacks::make_callbacks;
pub use filter::Filter;

use crate::headers::HeaderMutation;

/// Protocol-level answer to one callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Continue,
    /// 451 4.7.0 with the given text
    TempFail(String),
    /// 550 5.7.1 with the given text
    Reject(String),
}

/// Answer to the end-of-message callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EomOutcome {
    pub reply: Reply,
    /// Header changes to apply before replying; empty unless accepted
    pub mutations: Vec<HeaderMutation>,
}

impl From<Reply> for EomOutcome {
    fn from(reply: Reply) -> Self {
        Self {
            reply,
            mutations: Vec::new(),
        }
    }
}

/// Reply text shown to the client, tagged with the MTA queue id
pub(crate) fn reply_text(message: &str, queue_id: &str) -> String {
    if queue_id.is_empty() {
        message.to_string()
    } else {
        format!("{} (queue id {})", message, queue_id)
    }
}
