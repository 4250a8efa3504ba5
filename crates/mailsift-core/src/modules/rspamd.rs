//! rspamd checker
//!
//! Submits the message to rspamd's HTTP API.
//! See: https://rspamd.com/doc/architecture/protocol.html

use super::{CheckContext, MessageCheckResult, Module};
use anyhow::anyhow;
use async_trait::async_trait;
use mailsift_common::config::RspamdModuleConfig;
use mailsift_common::{Action, Error, Result};
use reqwest::Client;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Raw rspamd API response
#[derive(Debug, Deserialize)]
struct RspamdApiResponse {
    #[serde(default)]
    score: f64,
    #[serde(default = "default_required_score")]
    required_score: f64,
    #[serde(default)]
    action: String,
    #[serde(default)]
    is_skipped: bool,
    #[serde(default)]
    symbols: BTreeMap<String, RspamdApiSymbol>,
    #[serde(default)]
    message_id: Option<String>,
}

fn default_required_score() -> f64 {
    5.0
}

#[derive(Debug, Deserialize)]
struct RspamdApiSymbol {
    #[serde(default)]
    score: f64,
}

/// rspamd HTTP checker
pub struct RspamdModule {
    config: RspamdModuleConfig,
    client: Client,
}

impl RspamdModule {
    pub fn new(config: RspamdModuleConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| Error::Module(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { config, client })
    }

    async fn check(&self, ctx: &CheckContext) -> anyhow::Result<MessageCheckResult> {
        let url = format!("{}/checkv2", self.config.url.trim_end_matches('/'));
        let message = &ctx.message;

        debug!(queue_id = message.queue_id(), "Checking message with rspamd at {}", url);

        let mut request = self
            .client
            .post(&url)
            .body(message.to_raw())
            .header("From", message.sender().to_string());

        for rcpt in message.recipients() {
            request = request.header("Rcpt", rcpt.to_string());
        }
        if !message.queue_id().is_empty() {
            request = request.header("Queue-Id", message.queue_id());
        }
        if let Some(ip) = ctx.connection.client_ip {
            request = request.header("IP", ip.to_string());
        }
        if let Some(ref helo) = ctx.connection.helo {
            request = request.header("Helo", helo.as_str());
        }
        if let Some(ref hostname) = ctx.connection.reverse_dns {
            request = request.header("Hostname", hostname.as_str());
        }
        if let Some(ref user) = ctx.connection.sasl.username {
            request = request.header("User", user.as_str());
        }
        if let Some(ref password) = self.config.password {
            request = request.header("Password", password.as_str());
        }

        let response = request.send().await.map_err(|e| {
            warn!("rspamd request failed: {}", e);
            anyhow!("rspamd request failed: {}", e)
        })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("rspamd returned error status {}: {}", status, body));
        }

        let api: RspamdApiResponse = response
            .json()
            .await
            .map_err(|e| anyhow!("Failed to parse rspamd response: {}", e))?;

        Ok(Self::to_result(api))
    }

    fn to_result(api: RspamdApiResponse) -> MessageCheckResult {
        if api.is_skipped {
            return MessageCheckResult::permit().with_determinant("skipped", true);
        }

        let action = match api.action.as_str() {
            "reject" => Action::Reject,
            "soft reject" | "greylist" => Action::TempFail,
            _ => Action::Permit,
        };

        let message = match action {
            Action::Reject => "Message rejected as spam",
            Action::TempFail => "Try again later",
            _ => "",
        };

        let symbols: serde_json::Map<String, serde_json::Value> = api
            .symbols
            .into_iter()
            .map(|(name, sym)| (name, serde_json::Value::from(sym.score)))
            .collect();

        let mut result = MessageCheckResult::new(action, api.score)
            .with_message(message)
            .with_determinant("action", api.action)
            .with_determinant("required_score", api.required_score)
            .with_determinant("symbols", serde_json::Value::Object(symbols));
        if let Some(id) = api.message_id {
            result = result.with_determinant("message_id", id);
        }
        result
    }
}

#[async_trait]
impl Module for RspamdModule {
    fn name(&self) -> &str {
        "rspamd"
    }

    fn enabled(&self) -> bool {
        self.config.enabled
    }

    async fn message_check(
        &self,
        ctx: &CheckContext,
        cancel: &CancellationToken,
    ) -> anyhow::Result<Option<MessageCheckResult>> {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("rspamd check cancelled");
                Ok(None)
            }
            result = self.check(ctx) => result.map(Some),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{ConnectionInfo, Message};
    use mailsift_common::{EmailAddress, SessionId};
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn context() -> CheckContext {
        let mut message = Message::new(SessionId::new(), EmailAddress::new("from", "example.org"));
        message
            .add_recipient(EmailAddress::new("to", "example.com"))
            .unwrap();
        message.add_header("Subject", "hello").unwrap();
        message.append_body(b"hi there").unwrap();

        CheckContext {
            connection: Arc::new(ConnectionInfo {
                client_ip: Some("192.0.2.1".parse().unwrap()),
                helo: Some("client.example.org".to_string()),
                ..Default::default()
            }),
            message: Arc::new(message),
        }
    }

    fn module(url: String) -> RspamdModule {
        RspamdModule::new(RspamdModuleConfig {
            enabled: true,
            url,
            timeout_ms: 2000,
            password: None,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_reject_action() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/checkv2"))
            .and(header("IP", "192.0.2.1"))
            .and(header("Rcpt", "to@example.com"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "score": 16.5,
                "required_score": 15.0,
                "action": "reject",
                "symbols": {
                    "BAYES_SPAM": {"name": "BAYES_SPAM", "score": 5.1},
                    "DBL_SPAM": {"name": "DBL_SPAM", "score": 6.5}
                }
            })))
            .mount(&server)
            .await;

        let result = module(server.uri())
            .message_check(&context(), &CancellationToken::new())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(result.action, Action::Reject);
        assert_eq!(result.score, 16.5);
        assert_eq!(result.message, "Message rejected as spam");
        assert_eq!(result.determinants["symbols"]["DBL_SPAM"], 6.5);
    }

    #[tokio::test]
    async fn test_soft_reject_is_tempfail() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/checkv2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "score": 7.0,
                "action": "soft reject"
            })))
            .mount(&server)
            .await;

        let result = module(server.uri())
            .message_check(&context(), &CancellationToken::new())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.action, Action::TempFail);
    }

    #[tokio::test]
    async fn test_add_header_is_permit_with_score() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/checkv2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "score": 6.2,
                "action": "add header"
            })))
            .mount(&server)
            .await;

        let result = module(server.uri())
            .message_check(&context(), &CancellationToken::new())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.action, Action::Permit);
        assert_eq!(result.score, 6.2);
    }

    #[tokio::test]
    async fn test_server_error_is_err() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/checkv2"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let result = module(server.uri())
            .message_check(&context(), &CancellationToken::new())
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_cancelled_check_abstains() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/checkv2"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"score": 1.0, "action": "no action"}))
                    .set_delay(Duration::from_secs(5)),
            )
            .mount(&server)
            .await;

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let result = module(server.uri())
            .message_check(&context(), &cancel)
            .await
            .unwrap();
        assert!(result.is_none());
    }
}
