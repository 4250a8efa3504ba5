//! Persisted record types

use chrono::{DateTime, Utc};
use mailsift_common::{Action, EmailAddress, SessionId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;
use uuid::Uuid;

/// Audit record of one connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: SessionId,
    pub client_ip: Option<IpAddr>,
    pub client_port: Option<u16>,
    pub reverse_dns: Option<String>,
    pub helo: Option<String>,
    pub sasl_username: Option<String>,
    pub sasl_method: Option<String>,
    pub cert_issuer: Option<String>,
    pub cert_subject: Option<String>,
    pub cipher: Option<String>,
    pub cipher_bits: Option<String>,
    pub tls_version: Option<String>,
    pub allow_listed: bool,
    pub connected_at: DateTime<Utc>,
    pub disconnected_at: Option<DateTime<Utc>>,
    /// Set when the pruner evicted the session instead of a Close
    pub pruned: bool,
    pub message_ids: Vec<Uuid>,
}

/// Audit record of one finalized message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: Uuid,
    pub session_id: SessionId,
    pub queue_id: String,
    pub sender: Option<EmailAddress>,
    pub recipients: Vec<EmailAddress>,
    pub headers: Vec<HeaderRecord>,
    pub body_size: usize,
    pub received_at: DateTime<Utc>,
    pub action: Action,
    pub verdict_message: String,
    pub reject_score: f64,
    pub reject_threshold: f64,
    pub tempfail_score: f64,
    pub tempfail_threshold: f64,
    pub checks: Vec<CheckRecord>,
}

/// One header line as seen or produced by the filter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeaderRecord {
    pub key: String,
    pub value: String,
    pub index: usize,
    pub deleted: bool,
}

/// One module's opinion on a message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckRecord {
    pub module: String,
    pub action: Action,
    pub message: String,
    pub score: f64,
    pub weighted_score: f64,
    #[serde(default)]
    pub determinants: BTreeMap<String, serde_json::Value>,
    pub duration_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_record_serialization() {
        let record = CheckRecord {
            module: "rules".to_string(),
            action: Action::Reject,
            message: "Spam detected".to_string(),
            score: 12.0,
            weighted_score: 12.0,
            determinants: BTreeMap::from([(
                "matched".to_string(),
                serde_json::json!(["SUBJECT_MONEY"]),
            )]),
            duration_ms: 3,
        };

        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"action\":\"reject\""));
        assert!(json.contains("SUBJECT_MONEY"));
    }
}
