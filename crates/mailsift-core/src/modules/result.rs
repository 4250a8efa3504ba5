//! Module check results

use futures::future::BoxFuture;
use mailsift_common::Action;
use mailsift_storage::CheckRecord;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Side effect run once the final action of a message is known
pub type PostVerdictCallback =
    Arc<dyn Fn(Action) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// One module's opinion on one message
#[derive(Clone)]
pub struct MessageCheckResult {
    /// Reporting module; overwritten with the registered name by the aggregator
    pub module: String,
    /// Suggested action
    pub action: Action,
    /// Reply text surfaced to the client if this result decides the verdict
    pub message: String,
    /// Raw score
    pub score: f64,
    /// Score after group weighting
    pub weighted_score: f64,
    /// Audit details
    pub determinants: BTreeMap<String, serde_json::Value>,
    pub duration: Duration,
    pub callbacks: Vec<PostVerdictCallback>,
}

impl MessageCheckResult {
    pub fn new(action: Action, score: f64) -> Self {
        Self {
            module: String::new(),
            action,
            message: String::new(),
            score,
            weighted_score: score,
            determinants: BTreeMap::new(),
            duration: Duration::ZERO,
            callbacks: Vec::new(),
        }
    }

    pub fn permit() -> Self {
        Self::new(Action::Permit, 0.0)
    }

    /// Synthetic result for a check that failed, panicked or timed out
    pub fn error(module: impl Into<String>, reason: impl Into<String>, penalty: f64) -> Self {
        let mut result = Self::new(Action::Error, penalty);
        result.module = module.into();
        result
            .determinants
            .insert("error".to_string(), serde_json::Value::String(reason.into()));
        result
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn with_determinant(
        mut self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.determinants.insert(key.into(), value.into());
        self
    }

    /// Register a side effect to run with the final action
    pub fn on_verdict<F, Fut>(mut self, callback: F) -> Self
    where
        F: Fn(Action) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.callbacks
            .push(Arc::new(move |action| Box::pin(callback(action))));
        self
    }

    /// A zero score never rejects or defers, whatever the module suggested.
    ///
    /// Synthetic error results keep their action so a zero error penalty
    /// still escalates to TempFail.
    pub fn normalize(&mut self) {
        if self.score == 0.0 && matches!(self.action, Action::Reject | Action::TempFail) {
            self.action = Action::Permit;
        }
        self.weighted_score = self.score;
    }

    pub fn to_record(&self) -> CheckRecord {
        CheckRecord {
            module: self.module.clone(),
            action: self.action,
            message: self.message.clone(),
            score: self.score,
            weighted_score: self.weighted_score,
            determinants: self.determinants.clone(),
            duration_ms: self.duration.as_millis() as u64,
        }
    }
}

impl fmt::Debug for MessageCheckResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageCheckResult")
            .field("module", &self.module)
            .field("action", &self.action)
            .field("message", &self.message)
            .field("score", &self.score)
            .field("weighted_score", &self.weighted_score)
            .field("determinants", &self.determinants)
            .field("duration", &self.duration)
            .field("callbacks", &self.callbacks.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_zero_score_normalizes_to_permit() {
        let mut result = MessageCheckResult::new(Action::Reject, 0.0).with_message("spam");
        result.normalize();
        assert_eq!(result.action, Action::Permit);

        let mut result = MessageCheckResult::new(Action::Reject, 0.5);
        result.normalize();
        assert_eq!(result.action, Action::Reject);
    }

    #[test]
    fn test_error_result() {
        let result = MessageCheckResult::error("rspamd", "connection refused", 25.0);
        assert_eq!(result.action, Action::Error);
        assert_eq!(result.score, 25.0);
        assert_eq!(result.module, "rspamd");

        let record = result.to_record();
        assert_eq!(record.determinants["error"], "connection refused");
    }

    #[tokio::test]
    async fn test_on_verdict_callback_receives_action() {
        let seen = Arc::new(std::sync::Mutex::new(None));
        let sink = seen.clone();
        let result = MessageCheckResult::permit().on_verdict(move |action| {
            let sink = sink.clone();
            async move {
                *sink.lock().unwrap() = Some(action);
                Ok(())
            }
        });

        (result.callbacks[0])(Action::Reject).await.unwrap();
        assert_eq!(*seen.lock().unwrap(), Some(Action::Reject));
    }
}
