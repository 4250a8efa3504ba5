//! Common types for mailsift

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identifier of one milter connection.
///
/// Backed by a UUIDv7 so identifiers are unique and sort by creation time,
/// which keeps stored session records clustered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Allocate a fresh identifier
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Wrap an existing UUID
    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Email address
///
/// The null reverse-path `<>` is represented with empty local part and
/// domain.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EmailAddress {
    pub local: String,
    pub domain: String,
}

impl EmailAddress {
    /// Create a new email address
    pub fn new(local: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            local: local.into(),
            domain: domain.into(),
        }
    }

    /// Parse an email address from a string
    pub fn parse(s: &str) -> Option<Self> {
        let parts: Vec<&str> = s.rsplitn(2, '@').collect();
        if parts.len() == 2 && !parts[0].is_empty() && !parts[1].is_empty() {
            Some(Self::new(parts[1], parts[0]))
        } else {
            None
        }
    }

    /// Build an address from a raw SMTP `MAIL FROM`/`RCPT TO` argument.
    ///
    /// Angle brackets and surrounding whitespace are stripped. Arguments
    /// without a domain keep the whole value as local part.
    pub fn from_smtp_arg(arg: &str) -> Self {
        let trimmed = arg
            .trim()
            .trim_start_matches('<')
            .trim_end_matches('>')
            .trim();

        Self::parse(trimmed).unwrap_or_else(|| Self::new(trimmed, ""))
    }

    /// Whether this is the null reverse-path
    pub fn is_null(&self) -> bool {
        self.local.is_empty() && self.domain.is_empty()
    }
}

impl fmt::Display for EmailAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.domain.is_empty() {
            write!(f, "{}", self.local)
        } else {
            write!(f, "{}@{}", self.local, self.domain)
        }
    }
}

impl std::str::FromStr for EmailAddress {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| crate::Error::Protocol(format!("Invalid email address: {s}")))
    }
}

/// Disposition suggested by a module or decided for a message.
///
/// `Error` only exists inside the pipeline; it always escalates to
/// `TempFail` before anything reaches the MTA.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Permit,
    TempFail,
    Reject,
    Error,
}

impl Action {
    pub const ALL: [Action; 4] = [Action::Permit, Action::TempFail, Action::Reject, Action::Error];

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Permit => "permit",
            Action::TempFail => "tempfail",
            Action::Reject => "reject",
            Action::Error => "error",
        }
    }

    /// Position of this action in a four-way bucket array
    pub fn index(&self) -> usize {
        match self {
            Action::Permit => 0,
            Action::TempFail => 1,
            Action::Reject => 2,
            Action::Error => 3,
        }
    }
}

impl Default for Action {
    fn default() -> Self {
        Action::Permit
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_email_address_parse() {
        let addr = EmailAddress::parse("user@example.com").unwrap();
        assert_eq!(addr.local, "user");
        assert_eq!(addr.domain, "example.com");
        assert!(EmailAddress::parse("nodomain").is_none());
        assert!(EmailAddress::parse("@example.com").is_none());
    }

    #[test]
    fn test_from_smtp_arg() {
        let addr = EmailAddress::from_smtp_arg(" <Alice@Example.org> ");
        assert_eq!(addr.to_string(), "Alice@Example.org");

        let null = EmailAddress::from_smtp_arg("<>");
        assert!(null.is_null());

        let bare = EmailAddress::from_smtp_arg("<postmaster>");
        assert_eq!(bare.local, "postmaster");
        assert_eq!(bare.domain, "");
    }

    #[test]
    fn test_session_ids_are_v7() {
        let a = SessionId::new();
        let b = SessionId::new();
        assert_ne!(a, b);
        assert_eq!(a.as_uuid().get_version_num(), 7);
    }

    #[test]
    fn test_action_serde() {
        let json = serde_json::to_string(&Action::TempFail).unwrap();
        assert_eq!(json, "\"tempfail\"");
        assert_eq!(Action::Reject.index(), 2);
    }
}
