//! Per-callback failure taxonomy

use crate::session::{SessionState, Stage};
use thiserror::Error;

/// Failure of one milter callback.
///
/// Never crosses the callback boundary: the filter turns every variant into
/// a protocol reply.
#[derive(Debug, Error)]
pub enum MilterError {
    #[error("no session established for {0}")]
    NoSession(Stage),

    #[error("expected exactly one sender address, got {0}")]
    SenderCount(usize),

    #[error("no message in progress for {0}")]
    NoMessage(Stage),

    #[error("{stage} not allowed in state {state}")]
    OutOfOrder { stage: Stage, state: SessionState },

    #[error("session is in failed state")]
    SessionFailed,

    #[error("message already has a verdict")]
    MessageFinalized,

    #[error("panic in callback: {0}")]
    Panic(String),
}

impl MilterError {
    /// Whether this is a violation of the protocol's callback contract
    /// rather than an internal failure
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            MilterError::NoSession(_)
                | MilterError::SenderCount(_)
                | MilterError::NoMessage(_)
                | MilterError::OutOfOrder { .. }
        )
    }

    /// Whether the session cannot continue after this error
    pub fn is_fatal(&self) -> bool {
        matches!(self, MilterError::SenderCount(_))
    }
}

pub type MilterResult<T> = std::result::Result<T, MilterError>;
