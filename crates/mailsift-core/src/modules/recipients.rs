//! Recipient acceptance gate

use super::{Module, RecipientVerdict};
use crate::session::ConnectionInfo;
use async_trait::async_trait;
use mailsift_common::config::RecipientsModuleConfig;
use mailsift_common::EmailAddress;
use std::collections::HashSet;

/// Rejects recipients on a deny list or outside the accepted domains
pub struct RecipientsModule {
    config: RecipientsModuleConfig,
    domains: HashSet<String>,
    denied: HashSet<String>,
}

impl RecipientsModule {
    pub fn new(config: RecipientsModuleConfig) -> Self {
        let domains = config
            .accepted_domains
            .iter()
            .map(|d| d.trim().trim_end_matches('.').to_lowercase())
            .collect();
        let denied = config.reject.iter().map(|a| a.trim().to_lowercase()).collect();

        Self {
            config,
            domains,
            denied,
        }
    }

    fn reject(&self) -> RecipientVerdict {
        RecipientVerdict::reject(format!("5.1.1 {}", self.config.message))
    }
}

#[async_trait]
impl Module for RecipientsModule {
    fn name(&self) -> &str {
        "recipients"
    }

    fn enabled(&self) -> bool {
        self.config.enabled
    }

    async fn recipient_check(
        &self,
        _connection: &ConnectionInfo,
        recipient: &EmailAddress,
    ) -> anyhow::Result<RecipientVerdict> {
        if self.denied.contains(&recipient.to_string().to_lowercase()) {
            return Ok(self.reject());
        }

        if !self.domains.is_empty() && !self.domains.contains(&recipient.domain.to_lowercase()) {
            return Ok(self.reject());
        }

        Ok(RecipientVerdict::permit())
    }
}
