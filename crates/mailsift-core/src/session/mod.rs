//! Session and message bookkeeping

mod message;
mod registry;
#[allow(clippy::module_inception)]
mod session;

pub use message::{Header, Message};
pub use registry::{SessionHandle, SessionRegistry};
pub use session::{ConnectionInfo, MilterSession, SaslInfo, TlsInfo};

use std::fmt;

/// Milter callback stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Connect,
    Helo,
    EnvFrom,
    EnvRcpt,
    Header,
    Eoh,
    Body,
    Eom,
    Abort,
    Close,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Connect => "connect",
            Stage::Helo => "helo",
            Stage::EnvFrom => "envfrom",
            Stage::EnvRcpt => "envrcpt",
            Stage::Header => "header",
            Stage::Eoh => "eoh",
            Stage::Body => "body",
            Stage::Eom => "eom",
            Stage::Abort => "abort",
            Stage::Close => "close",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Protocol position of a session.
///
/// `Greeted` is also the state between messages on a connection that sends
/// more than one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    Greeted,
    MailFrom,
    Recipients,
    Headers,
    Body,
    Failed,
}

impl SessionState {
    /// State after `stage`, or `None` if `stage` may not happen now
    pub fn next(self, stage: Stage) -> Option<SessionState> {
        use SessionState::*;

        match (self, stage) {
            (Failed, _) => None,
            (Connected | Greeted, Stage::Helo) => Some(Greeted),
            // Some MTAs skip HELO for local submissions
            (Connected | Greeted, Stage::EnvFrom) => Some(MailFrom),
            (MailFrom | Recipients, Stage::EnvRcpt) => Some(Recipients),
            (Recipients | Headers, Stage::Header) => Some(Headers),
            (Recipients | Headers, Stage::Eoh) => Some(Body),
            (Body, Stage::Body) => Some(Body),
            (Recipients | Headers | Body, Stage::Eom) => Some(Greeted),
            (Connected, Stage::Abort) => Some(Connected),
            (_, Stage::Abort) => Some(Greeted),
            _ => None,
        }
    }

    /// Whether a message transaction is open
    pub fn in_message(self) -> bool {
        matches!(
            self,
            SessionState::MailFrom
                | SessionState::Recipients
                | SessionState::Headers
                | SessionState::Body
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Connected => "connected",
            SessionState::Greeted => "greeted",
            SessionState::MailFrom => "mail-from",
            SessionState::Recipients => "recipients",
            SessionState::Headers => "headers",
            SessionState::Body => "body",
            SessionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_transaction_order() {
        let mut state = SessionState::Connected;
        for stage in [
            Stage::Helo,
            Stage::EnvFrom,
            Stage::EnvRcpt,
            Stage::EnvRcpt,
            Stage::Header,
            Stage::Header,
            Stage::Eoh,
            Stage::Body,
            Stage::Body,
            Stage::Eom,
            Stage::EnvFrom,
            Stage::EnvRcpt,
            Stage::Eoh,
            Stage::Eom,
        ] {
            state = state
                .next(stage)
                .unwrap_or_else(|| panic!("{} rejected in {}", stage, state));
        }
        assert_eq!(state, SessionState::Greeted);
    }

    #[test]
    fn test_out_of_order_stages() {
        assert_eq!(SessionState::Connected.next(Stage::EnvRcpt), None);
        assert_eq!(SessionState::MailFrom.next(Stage::Header), None);
        assert_eq!(SessionState::MailFrom.next(Stage::Eom), None);
        assert_eq!(SessionState::Body.next(Stage::Header), None);
        assert_eq!(SessionState::Recipients.next(Stage::Helo), None);
    }

    #[test]
    fn test_failed_is_terminal() {
        for stage in [Stage::Helo, Stage::EnvFrom, Stage::Eom, Stage::Abort] {
            assert_eq!(SessionState::Failed.next(stage), None);
        }
    }

    #[test]
    fn test_abort_returns_to_greeted() {
        assert_eq!(
            SessionState::Body.next(Stage::Abort),
            Some(SessionState::Greeted)
        );
        assert_eq!(
            SessionState::Connected.next(Stage::Abort),
            Some(SessionState::Connected)
        );
    }
}
