//! Checker modules
//!
//! Every checker implements [`Module`]. Methods a checker does not need keep
//! their default no-op behavior.

mod quotas;
mod recipients;
mod registry;
mod result;
mod rspamd;
mod rules;

#[cfg(test)]
pub(crate) mod test_support;

pub use quotas::QuotasModule;
pub use recipients::RecipientsModule;
pub use registry::ModuleRegistry;
pub use result::{MessageCheckResult, PostVerdictCallback};
pub use rspamd::RspamdModule;
pub use rules::RulesModule;

use crate::session::{ConnectionInfo, Message};
use async_trait::async_trait;
use futures::future::BoxFuture;
use mailsift_common::{Action, EmailAddress};
use mailsift_storage::SessionRecord;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// What a message check sees
#[derive(Debug, Clone)]
pub struct CheckContext {
    pub connection: Arc<ConnectionInfo>,
    pub message: Arc<Message>,
}

/// Outcome of a recipient check
#[derive(Debug, Clone, PartialEq)]
pub struct RecipientVerdict {
    pub action: Action,
    pub message: String,
}

impl RecipientVerdict {
    pub fn permit() -> Self {
        Self {
            action: Action::Permit,
            message: String::new(),
        }
    }

    pub fn reject(message: impl Into<String>) -> Self {
        Self {
            action: Action::Reject,
            message: message.into(),
        }
    }

    pub fn tempfail(message: impl Into<String>) -> Self {
        Self {
            action: Action::TempFail,
            message: message.into(),
        }
    }
}

pub type IpcHandler =
    Arc<dyn Fn(serde_json::Value) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

pub type RpcHandler = Arc<
    dyn Fn(serde_json::Value) -> BoxFuture<'static, anyhow::Result<serde_json::Value>>
        + Send
        + Sync,
>;

/// Named one-way inbound channel
#[derive(Clone)]
pub struct IpcChannel {
    pub name: String,
    pub handler: IpcHandler,
}

/// Named request/response inbound channel
#[derive(Clone)]
pub struct RpcChannel {
    pub name: String,
    pub handler: RpcHandler,
}

/// Checker module capability set
#[async_trait]
pub trait Module: Send + Sync {
    /// Unique module name, used in results, metrics and group config
    fn name(&self) -> &str;

    /// Whether the module takes part in this run
    fn enabled(&self) -> bool {
        true
    }

    async fn init(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Opinion on a complete message. `None` abstains.
    ///
    /// Long-running work should stop once `cancel` fires.
    async fn message_check(
        &self,
        _ctx: &CheckContext,
        _cancel: &CancellationToken,
    ) -> anyhow::Result<Option<MessageCheckResult>> {
        Ok(None)
    }

    /// Cheap per-recipient gate run at RCPT TO
    async fn recipient_check(
        &self,
        _connection: &ConnectionInfo,
        _recipient: &EmailAddress,
    ) -> anyhow::Result<RecipientVerdict> {
        Ok(RecipientVerdict::permit())
    }

    async fn session_disconnect(&self, _session: &SessionRecord) {}

    fn ipc(&self) -> Vec<IpcChannel> {
        Vec::new()
    }

    fn rpc(&self) -> Vec<RpcChannel> {
        Vec::new()
    }
}
