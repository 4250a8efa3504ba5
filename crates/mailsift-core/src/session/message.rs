//! One mail transaction

use crate::error::{MilterError, MilterResult};
use crate::verdict::Verdict;
use chrono::{DateTime, Utc};
use mailsift_common::{EmailAddress, SessionId};
use mailsift_storage::{HeaderRecord, MessageRecord};
use uuid::Uuid;

/// A header line with its 1-based position among headers of the same name
#[derive(Debug, Clone, PartialEq)]
pub struct Header {
    pub key: String,
    pub value: String,
    pub index: usize,
    pub deleted: bool,
}

/// Envelope, headers and body of one transaction.
///
/// The owning session is referenced by id only. All mutators fail with
/// [`MilterError::MessageFinalized`] once a verdict has been recorded.
#[derive(Debug, Clone)]
pub struct Message {
    id: Uuid,
    session_id: SessionId,
    queue_id: String,
    sender: EmailAddress,
    recipients: Vec<EmailAddress>,
    headers: Vec<Header>,
    body: Vec<u8>,
    received_at: DateTime<Utc>,
    synthesized_message_id: Option<String>,
    verdict: Option<Verdict>,
}

impl Message {
    pub fn new(session_id: SessionId, sender: EmailAddress) -> Self {
        Self {
            id: Uuid::now_v7(),
            session_id,
            queue_id: String::new(),
            sender,
            recipients: Vec::new(),
            headers: Vec::new(),
            body: Vec::new(),
            received_at: Utc::now(),
            synthesized_message_id: None,
            verdict: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Queue id assigned by the MTA; empty until end of headers
    pub fn queue_id(&self) -> &str {
        &self.queue_id
    }

    pub fn sender(&self) -> &EmailAddress {
        &self.sender
    }

    pub fn recipients(&self) -> &[EmailAddress] {
        &self.recipients
    }

    /// All headers, including ones marked deleted
    pub fn headers(&self) -> &[Header] {
        &self.headers
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }

    pub fn verdict(&self) -> Option<&Verdict> {
        self.verdict.as_ref()
    }

    pub fn is_finalized(&self) -> bool {
        self.verdict.is_some()
    }

    /// Message-Id added by the filter because the message carried none
    pub fn synthesized_message_id(&self) -> Option<&str> {
        self.synthesized_message_id.as_deref()
    }

    /// First live value of a header, case-insensitive
    pub fn header(&self, key: &str) -> Option<&str> {
        self.live_headers(key).next().map(|h| h.value.as_str())
    }

    fn live_headers<'s: 'k, 'k>(&'s self, key: &'k str) -> impl Iterator<Item = &'s Header> + 'k {
        self.headers
            .iter()
            .filter(move |h| !h.deleted && h.key.eq_ignore_ascii_case(key))
    }

    fn ensure_open(&self) -> MilterResult<()> {
        if self.is_finalized() {
            Err(MilterError::MessageFinalized)
        } else {
            Ok(())
        }
    }

    pub fn set_queue_id(&mut self, queue_id: impl Into<String>) -> MilterResult<()> {
        self.ensure_open()?;
        self.queue_id = queue_id.into();
        Ok(())
    }

    pub fn add_recipient(&mut self, recipient: EmailAddress) -> MilterResult<()> {
        self.ensure_open()?;
        self.recipients.push(recipient);
        Ok(())
    }

    /// Append a header and return its per-key index
    pub fn add_header(&mut self, key: impl Into<String>, value: impl Into<String>) -> MilterResult<usize> {
        self.ensure_open()?;
        let key = key.into();
        let index = self.live_headers(&key).count() + 1;
        self.headers.push(Header {
            key,
            value: value.into(),
            index,
            deleted: false,
        });
        Ok(index)
    }

    /// Mark the `index`-th occurrence of `key` deleted.
    ///
    /// Later occurrences of the same key move down by one so indices keep
    /// matching what the MTA sees. Returns false if no such occurrence.
    pub fn delete_header(&mut self, key: &str, index: usize) -> MilterResult<bool> {
        self.ensure_open()?;

        let Some(pos) = self
            .headers
            .iter()
            .position(|h| !h.deleted && h.index == index && h.key.eq_ignore_ascii_case(key))
        else {
            return Ok(false);
        };

        self.headers[pos].deleted = true;
        for header in self.headers[pos + 1..]
            .iter_mut()
            .filter(|h| !h.deleted && h.key.eq_ignore_ascii_case(key))
        {
            header.index -= 1;
        }

        Ok(true)
    }

    pub fn append_body(&mut self, chunk: &[u8]) -> MilterResult<()> {
        self.ensure_open()?;
        self.body.extend_from_slice(chunk);
        Ok(())
    }

    /// Add a Message-Id header if the message has none.
    ///
    /// The value is derived from the queue id (or the internal id when the
    /// MTA has not assigned one) and the hostname, so repeated calls yield
    /// the same value.
    pub fn ensure_message_id(&mut self, hostname: &str) -> MilterResult<Option<String>> {
        if self.header("Message-Id").is_some() {
            return Ok(self.synthesized_message_id.clone());
        }
        self.ensure_open()?;

        let local = if self.queue_id.is_empty() {
            self.id.simple().to_string()
        } else {
            self.queue_id.clone()
        };
        let value = format!("<{}@{}>", local, hostname);

        self.add_header("Message-Id", value.clone())?;
        self.synthesized_message_id = Some(value.clone());
        Ok(Some(value))
    }

    /// Record the verdict; the message is read-only afterwards
    pub fn finalize(&mut self, verdict: Verdict) -> MilterResult<()> {
        self.ensure_open()?;
        self.verdict = Some(verdict);
        Ok(())
    }

    /// Raw RFC 5322 rendering of the headers and body
    pub fn to_raw(&self) -> Vec<u8> {
        let mut raw = Vec::with_capacity(self.body.len() + 64 * self.headers.len());
        for header in self.headers.iter().filter(|h| !h.deleted) {
            raw.extend_from_slice(header.key.as_bytes());
            raw.extend_from_slice(b": ");
            raw.extend_from_slice(header.value.as_bytes());
            raw.extend_from_slice(b"\r\n");
        }
        raw.extend_from_slice(b"\r\n");
        raw.extend_from_slice(&self.body);
        raw
    }

    pub fn to_record(&self) -> MessageRecord {
        let headers = self
            .headers
            .iter()
            .map(|h| HeaderRecord {
                key: h.key.clone(),
                value: h.value.clone(),
                index: h.index,
                deleted: h.deleted,
            })
            .collect();

        let mut record = MessageRecord {
            id: self.id,
            session_id: self.session_id,
            queue_id: self.queue_id.clone(),
            sender: Some(self.sender.clone()),
            recipients: self.recipients.clone(),
            headers,
            body_size: self.body.len(),
            received_at: self.received_at,
            action: Default::default(),
            verdict_message: String::new(),
            reject_score: 0.0,
            reject_threshold: 0.0,
            tempfail_score: 0.0,
            tempfail_threshold: 0.0,
            checks: Vec::new(),
        };

        if let Some(verdict) = &self.verdict {
            record.action = verdict.action;
            record.verdict_message = verdict.message.clone();
            record.reject_score = verdict.reject_score;
            record.reject_threshold = verdict.reject_threshold;
            record.tempfail_score = verdict.tempfail_score;
            record.tempfail_threshold = verdict.tempfail_threshold;
            record.checks = verdict.results.iter().map(|r| r.to_record()).collect();
        }

        record
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mailsift_common::Action;
    use pretty_assertions::assert_eq;

    fn message() -> Message {
        Message::new(SessionId::new(), EmailAddress::new("from", "example.org"))
    }

    #[test]
    fn test_header_indices_per_key() {
        let mut msg = message();
        assert_eq!(msg.add_header("Received", "a").unwrap(), 1);
        assert_eq!(msg.add_header("Subject", "hi").unwrap(), 1);
        assert_eq!(msg.add_header("received", "b").unwrap(), 2);
        assert_eq!(msg.add_header("Received", "c").unwrap(), 3);
    }

    #[test]
    fn test_delete_header_shifts_later_indices() {
        let mut msg = message();
        msg.add_header("X-Spam", "one").unwrap();
        msg.add_header("Subject", "hi").unwrap();
        msg.add_header("X-Spam", "two").unwrap();
        msg.add_header("X-Spam", "three").unwrap();

        assert!(msg.delete_header("x-spam", 1).unwrap());

        let live: Vec<(&str, usize)> = msg
            .headers()
            .iter()
            .filter(|h| !h.deleted && h.key == "X-Spam")
            .map(|h| (h.value.as_str(), h.index))
            .collect();
        assert_eq!(live, vec![("two", 1), ("three", 2)]);

        assert!(!msg.delete_header("X-Spam", 3).unwrap());
        assert_eq!(msg.add_header("X-Spam", "four").unwrap(), 3);
    }

    #[test]
    fn test_body_appends_incrementally() {
        let mut msg = message();
        msg.append_body(b"Hello, ").unwrap();
        msg.append_body(b"world").unwrap();
        assert_eq!(msg.body(), b"Hello, world");
    }

    #[test]
    fn test_ensure_message_id_uses_queue_id() {
        let mut msg = message();
        msg.set_queue_id("4ABCD1234").unwrap();

        let id = msg.ensure_message_id("mx.example.com").unwrap();
        assert_eq!(id.as_deref(), Some("<4ABCD1234@mx.example.com>"));
        assert_eq!(msg.header("message-id"), Some("<4ABCD1234@mx.example.com>"));

        let again = msg.ensure_message_id("mx.example.com").unwrap();
        assert_eq!(again, id);
        assert_eq!(msg.headers().len(), 1);
    }

    #[test]
    fn test_existing_message_id_is_kept() {
        let mut msg = message();
        msg.add_header("Message-ID", "<orig@example.org>").unwrap();
        assert_eq!(msg.ensure_message_id("mx.example.com").unwrap(), None);
    }

    #[test]
    fn test_finalized_message_is_read_only() {
        let mut msg = message();
        msg.finalize(Verdict::permit(5.0, 5.0)).unwrap();

        assert!(matches!(
            msg.add_recipient(EmailAddress::new("to", "example.org")),
            Err(MilterError::MessageFinalized)
        ));
        assert!(matches!(msg.append_body(b"x"), Err(MilterError::MessageFinalized)));
        assert!(matches!(
            msg.finalize(Verdict::permit(5.0, 5.0)),
            Err(MilterError::MessageFinalized)
        ));
        assert_eq!(msg.to_record().action, Action::Permit);
    }

    #[test]
    fn test_to_raw_skips_deleted_headers() {
        let mut msg = message();
        msg.add_header("Subject", "hi").unwrap();
        msg.add_header("X-Old", "gone").unwrap();
        msg.delete_header("X-Old", 1).unwrap();
        msg.append_body(b"body").unwrap();

        assert_eq!(msg.to_raw(), b"Subject: hi\r\n\r\nbody".to_vec());
    }
}
