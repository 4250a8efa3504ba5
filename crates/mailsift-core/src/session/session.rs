//! Per-connection state

use super::{Message, SessionState, Stage};
use crate::error::{MilterError, MilterResult};
use chrono::{DateTime, Utc};
use mailsift_common::{Config, EmailAddress, SessionId};
use mailsift_storage::SessionRecord;
use std::net::IpAddr;
use std::sync::Arc;

/// TLS facts, available from HELO on
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TlsInfo {
    pub version: Option<String>,
    pub cipher: Option<String>,
    pub cipher_bits: Option<String>,
    pub cert_subject: Option<String>,
    pub cert_issuer: Option<String>,
}

/// SASL facts, available once the first message starts
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SaslInfo {
    pub username: Option<String>,
    pub method: Option<String>,
}

/// Network identity of the connected client
#[derive(Debug, Clone, Default)]
pub struct ConnectionInfo {
    pub client_ip: Option<IpAddr>,
    pub client_port: Option<u16>,
    pub reverse_dns: Option<String>,
    pub helo: Option<String>,
    pub tls: TlsInfo,
    pub sasl: SaslInfo,
    pub allow_listed: bool,
}

/// One milter connection and the messages sent over it
pub struct MilterSession {
    id: SessionId,
    info: ConnectionInfo,
    config: Arc<Config>,
    connected_at: DateTime<Utc>,
    state: SessionState,
    messages: Vec<Arc<Message>>,
}

impl MilterSession {
    /// Create a session in `Connected` state with a configuration snapshot
    pub fn new(
        id: SessionId,
        config: Arc<Config>,
        client_ip: Option<IpAddr>,
        client_port: Option<u16>,
        reverse_dns: Option<String>,
    ) -> Self {
        let allow_listed = client_ip
            .map(|ip| config.milter.is_allow_listed(ip))
            .unwrap_or(false);

        Self {
            id,
            info: ConnectionInfo {
                client_ip,
                client_port,
                reverse_dns,
                allow_listed,
                ..Default::default()
            },
            config,
            connected_at: Utc::now(),
            state: SessionState::Connected,
            messages: Vec::new(),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    /// Replace the configuration snapshot for the rest of this session
    pub fn override_config(&mut self, config: Arc<Config>) {
        self.config = config;
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_allow_listed(&self) -> bool {
        self.info.allow_listed
    }

    pub fn messages(&self) -> &[Arc<Message>] {
        &self.messages
    }

    /// Move to the state following `stage`
    pub fn advance(&mut self, stage: Stage) -> MilterResult<()> {
        if self.state == SessionState::Failed {
            return Err(MilterError::SessionFailed);
        }

        match self.state.next(stage) {
            Some(next) => {
                self.state = next;
                Ok(())
            }
            None => Err(MilterError::OutOfOrder {
                stage,
                state: self.state,
            }),
        }
    }

    /// Put the session into the terminal failed state
    pub fn fail(&mut self) {
        self.state = SessionState::Failed;
    }

    /// Record HELO and TLS facts
    pub fn helo(&mut self, helo: String, tls: TlsInfo) -> MilterResult<()> {
        self.advance(Stage::Helo)?;
        self.info.helo = Some(helo);
        self.info.tls = tls;
        Ok(())
    }

    /// Record SASL facts the first time they are seen
    pub fn record_sasl(&mut self, sasl: SaslInfo) {
        if self.info.sasl.username.is_none() && sasl.username.is_some() {
            self.info.sasl = sasl;
        }
    }

    /// Open a new message transaction
    pub fn begin_message(&mut self, sender: EmailAddress) -> MilterResult<&mut Message> {
        self.advance(Stage::EnvFrom)?;
        self.messages.push(Arc::new(Message::new(self.id, sender)));
        self.current_message_mut(Stage::EnvFrom)
    }

    /// The open message, if any
    pub fn current_message(&self) -> Option<&Arc<Message>> {
        self.messages.last().filter(|m| !m.is_finalized())
    }

    /// Mutable access to the open message.
    ///
    /// Clones the message only if a check task still holds a reference.
    pub fn current_message_mut(&mut self, stage: Stage) -> MilterResult<&mut Message> {
        match self.messages.last_mut() {
            Some(message) if !message.is_finalized() => Ok(Arc::make_mut(message)),
            _ => Err(MilterError::NoMessage(stage)),
        }
    }

    /// Abandon the open message, returning it
    pub fn abort_message(&mut self) -> Option<Arc<Message>> {
        if self.state != SessionState::Failed {
            self.state = self.state.next(Stage::Abort).unwrap_or(self.state);
        }

        if self.current_message().is_some() {
            self.messages.pop()
        } else {
            None
        }
    }

    pub fn to_record(&self, disconnected_at: DateTime<Utc>, pruned: bool) -> SessionRecord {
        SessionRecord {
            id: self.id,
            client_ip: self.info.client_ip,
            client_port: self.info.client_port,
            reverse_dns: self.info.reverse_dns.clone(),
            helo: self.info.helo.clone(),
            sasl_username: self.info.sasl.username.clone(),
            sasl_method: self.info.sasl.method.clone(),
            cert_issuer: self.info.tls.cert_issuer.clone(),
            cert_subject: self.info.tls.cert_subject.clone(),
            cipher: self.info.tls.cipher.clone(),
            cipher_bits: self.info.tls.cipher_bits.clone(),
            tls_version: self.info.tls.version.clone(),
            allow_listed: self.info.allow_listed,
            connected_at: self.connected_at,
            disconnected_at: Some(disconnected_at),
            pruned,
            message_ids: self.messages.iter().map(|m| m.id()).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verdict::Verdict;
    use pretty_assertions::assert_eq;

    fn session(ip: &str, config: Config) -> MilterSession {
        MilterSession::new(
            SessionId::new(),
            Arc::new(config),
            Some(ip.parse().unwrap()),
            Some(40000),
            None,
        )
    }

    #[test]
    fn test_allow_list_computed_at_connect() {
        let mut config = Config::default();
        config.milter.allow_list = vec!["10.0.0.0/8".parse().unwrap()];

        assert!(session("10.1.2.3", config.clone()).is_allow_listed());
        assert!(!session("192.0.2.1", config).is_allow_listed());
    }

    #[test]
    fn test_helo_only_before_mail() {
        let mut s = session("192.0.2.1", Config::default());
        s.helo("client.example.org".into(), TlsInfo::default()).unwrap();
        s.begin_message(EmailAddress::new("a", "example.org")).unwrap();

        let err = s.helo("other".into(), TlsInfo::default()).unwrap_err();
        assert!(matches!(err, MilterError::OutOfOrder { stage: Stage::Helo, .. }));
        assert_eq!(s.info().helo.as_deref(), Some("client.example.org"));
    }

    #[test]
    fn test_failed_session_rejects_everything() {
        let mut s = session("192.0.2.1", Config::default());
        s.fail();
        assert!(matches!(
            s.advance(Stage::Helo),
            Err(MilterError::SessionFailed)
        ));
        assert!(matches!(
            s.begin_message(EmailAddress::new("a", "example.org")),
            Err(MilterError::SessionFailed)
        ));
    }

    #[test]
    fn test_abort_drops_open_message() {
        let mut s = session("192.0.2.1", Config::default());
        s.helo("client".into(), TlsInfo::default()).unwrap();
        s.begin_message(EmailAddress::new("a", "example.org")).unwrap();

        assert!(s.abort_message().is_some());
        assert!(s.messages().is_empty());
        assert_eq!(s.state(), SessionState::Greeted);
        assert!(matches!(
            s.current_message_mut(Stage::Body),
            Err(MilterError::NoMessage(Stage::Body))
        ));
    }

    #[test]
    fn test_finalized_message_is_not_current() {
        let mut s = session("192.0.2.1", Config::default());
        s.begin_message(EmailAddress::new("a", "example.org")).unwrap();

        let message = s.current_message_mut(Stage::Eom).unwrap();
        message.finalize(Verdict::permit(5.0, 5.0)).unwrap();

        assert!(s.current_message().is_none());
        assert!(s.abort_message().is_none());
        assert_eq!(s.messages().len(), 1);
    }

    #[test]
    fn test_to_record() {
        let mut s = session("192.0.2.1", Config::default());
        s.helo(
            "client".into(),
            TlsInfo {
                version: Some("TLSv1.3".into()),
                cipher_bits: Some("256".into()),
                ..Default::default()
            },
        )
        .unwrap();
        s.record_sasl(SaslInfo {
            username: Some("alice".into()),
            method: Some("PLAIN".into()),
        });
        let message_id = s
            .begin_message(EmailAddress::new("a", "example.org"))
            .unwrap()
            .id();

        let record = s.to_record(Utc::now(), true);
        assert_eq!(record.id, s.id());
        assert_eq!(record.helo.as_deref(), Some("client"));
        assert_eq!(record.tls_version.as_deref(), Some("TLSv1.3"));
        assert_eq!(record.cipher_bits.as_deref(), Some("256"));
        assert_eq!(record.sasl_username.as_deref(), Some("alice"));
        assert_eq!(record.message_ids, vec![message_id]);
        assert!(record.pruned);
    }
}
