//! Sender quotas - limits messages per sender in a sliding window

use super::{CheckContext, IpcChannel, MessageCheckResult, Module};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use mailsift_common::config::QuotasModuleConfig;
use mailsift_common::Action;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

type Counters = Arc<RwLock<HashMap<String, VecDeque<DateTime<Utc>>>>>;

/// Per-sender message quota.
///
/// Messages are only counted once their final verdict is Permit.
pub struct QuotasModule {
    config: QuotasModuleConfig,
    counters: Counters,
}

impl QuotasModule {
    pub fn new(config: QuotasModuleConfig) -> Self {
        Self {
            config,
            counters: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    fn window(&self) -> Duration {
        Duration::seconds(self.config.window_secs.min(i64::MAX as u64) as i64)
    }

    /// Messages counted for `sender` within the window ending at `now`
    pub async fn count(&self, sender: &str, now: DateTime<Utc>) -> usize {
        let since = now - self.window();
        self.counters
            .read()
            .await
            .get(sender)
            .map(|events| events.iter().filter(|t| **t > since).count())
            .unwrap_or(0)
    }

    async fn record(counters: &Counters, sender: String, now: DateTime<Utc>, window: Duration) {
        let mut counters = counters.write().await;
        let swept = Self::cleanup_old_counters(&mut counters, now - window);
        if swept > 0 {
            debug!(swept, "Dropped idle sender quota counters");
        }
        counters.entry(sender).or_default().push_back(now);
    }

    /// Drop events at or before `cutoff` and forget senders left with none
    fn cleanup_old_counters(
        counters: &mut HashMap<String, VecDeque<DateTime<Utc>>>,
        cutoff: DateTime<Utc>,
    ) -> usize {
        let before = counters.len();
        counters.retain(|_, events| {
            while events.front().map_or(false, |t| *t <= cutoff) {
                events.pop_front();
            }
            !events.is_empty()
        });
        before - counters.len()
    }

    /// Forget counters for one sender, or for everyone
    pub async fn reset(&self, sender: Option<&str>) {
        Self::reset_counters(&self.counters, sender).await;
    }

    async fn reset_counters(counters: &Counters, sender: Option<&str>) {
        let mut counters = counters.write().await;
        match sender {
            Some(sender) => {
                counters.remove(&sender.to_lowercase());
            }
            None => counters.clear(),
        }
    }
}

#[async_trait]
impl Module for QuotasModule {
    fn name(&self) -> &str {
        "quotas"
    }

    fn enabled(&self) -> bool {
        self.config.enabled
    }

    async fn message_check(
        &self,
        ctx: &CheckContext,
        _cancel: &CancellationToken,
    ) -> anyhow::Result<Option<MessageCheckResult>> {
        let sender = ctx.message.sender();
        if sender.is_null() {
            return Ok(None);
        }

        let key = sender.to_string().to_lowercase();
        let count = self.count(&key, Utc::now()).await;

        if count >= self.config.max_messages as usize {
            debug!(sender = %key, count, "Sender quota exceeded");
            return Ok(Some(
                MessageCheckResult::new(Action::TempFail, self.config.score)
                    .with_message(self.config.message.clone())
                    .with_determinant("count", count)
                    .with_determinant("limit", self.config.max_messages),
            ));
        }

        let counters = self.counters.clone();
        let window = self.window();
        let result = MessageCheckResult::permit()
            .with_determinant("count", count)
            .with_determinant("limit", self.config.max_messages)
            .on_verdict(move |action| {
                let counters = counters.clone();
                let key = key.clone();
                async move {
                    if action == Action::Permit {
                        Self::record(&counters, key, Utc::now(), window).await;
                    }
                    Ok(())
                }
            });

        Ok(Some(result))
    }

    fn ipc(&self) -> Vec<IpcChannel> {
        let counters = self.counters.clone();
        vec![IpcChannel {
            name: "quotas.reset".to_string(),
            handler: Arc::new(move |payload| {
                let counters = counters.clone();
                Box::pin(async move {
                    let sender = payload.get("sender").and_then(|s| s.as_str()).map(str::to_owned);
                    info!(sender = ?sender, "Resetting sender quotas");
                    Self::reset_counters(&counters, sender.as_deref()).await;
                    Ok(())
                })
            }),
        }]
    }
}
