//! Fake modules for tests

use super::{CheckContext, MessageCheckResult, Module, RecipientVerdict};
use crate::session::ConnectionInfo;
use anyhow::anyhow;
use async_trait::async_trait;
use mailsift_common::{Action, EmailAddress};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Returns a fixed result, optionally after a delay
pub struct StaticModule {
    name: String,
    result: Option<MessageCheckResult>,
    delay: Duration,
    pub calls: AtomicUsize,
}

impl StaticModule {
    pub fn new(name: &str, action: Action, score: f64, message: &str) -> Self {
        Self {
            name: name.to_string(),
            result: Some(MessageCheckResult::new(action, score).with_message(message)),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn permit(name: &str) -> Self {
        Self::new(name, Action::Permit, 0.0, "")
    }

    /// Module that returns no result
    pub fn abstain(name: &str) -> Self {
        Self {
            result: None,
            ..Self::permit(name)
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_result(mut self, result: MessageCheckResult) -> Self {
        self.result = Some(result);
        self
    }
}

#[async_trait]
impl Module for StaticModule {
    fn name(&self) -> &str {
        &self.name
    }

    async fn message_check(
        &self,
        _ctx: &CheckContext,
        _cancel: &CancellationToken,
    ) -> anyhow::Result<Option<MessageCheckResult>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(self.result.clone())
    }
}

/// Panics inside both of its checks
pub struct PanickingModule(pub &'static str);

#[async_trait]
impl Module for PanickingModule {
    fn name(&self) -> &str {
        self.0
    }

    async fn message_check(
        &self,
        _ctx: &CheckContext,
        _cancel: &CancellationToken,
    ) -> anyhow::Result<Option<MessageCheckResult>> {
        panic!("checker bug");
    }

    async fn recipient_check(
        &self,
        _connection: &ConnectionInfo,
        _recipient: &EmailAddress,
    ) -> anyhow::Result<RecipientVerdict> {
        panic!("recipient checker bug");
    }
}

/// Returns an error from its check
pub struct ErroringModule(pub &'static str);

#[async_trait]
impl Module for ErroringModule {
    fn name(&self) -> &str {
        self.0
    }

    async fn message_check(
        &self,
        _ctx: &CheckContext,
        _cancel: &CancellationToken,
    ) -> anyhow::Result<Option<MessageCheckResult>> {
        Err(anyhow!("backend unavailable"))
    }
}

/// Waits until cancelled and remembers that it was
pub struct CancellableModule {
    pub name: &'static str,
    pub cancelled: Arc<AtomicBool>,
}

impl CancellableModule {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }
}

#[async_trait]
impl Module for CancellableModule {
    fn name(&self) -> &str {
        self.name
    }

    async fn message_check(
        &self,
        _ctx: &CheckContext,
        cancel: &CancellationToken,
    ) -> anyhow::Result<Option<MessageCheckResult>> {
        tokio::select! {
            _ = cancel.cancelled() => {
                self.cancelled.store(true, Ordering::SeqCst);
                Ok(None)
            }
            _ = tokio::time::sleep(Duration::from_secs(3600)) => {
                Ok(Some(MessageCheckResult::new(Action::Reject, 100.0).with_message("too late")))
            }
        }
    }
}

/// Recipient check that always fails
pub struct FailingRecipients;

#[async_trait]
impl Module for FailingRecipients {
    fn name(&self) -> &str {
        "failing"
    }

    async fn recipient_check(
        &self,
        _connection: &ConnectionInfo,
        _recipient: &EmailAddress,
    ) -> anyhow::Result<RecipientVerdict> {
        Err(anyhow!("directory unavailable"))
    }
}
