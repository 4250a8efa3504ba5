//! Module Registry
//!
//! Holds the checker modules built at startup and routes lifecycle,
//! recipient, disconnect and IPC/RPC calls to them.

use super::{
    IpcHandler, Module, QuotasModule, RecipientVerdict, RecipientsModule, RpcHandler,
    RspamdModule, RulesModule,
};
use crate::session::ConnectionInfo;
use mailsift_common::{Action, Config, EmailAddress, Error, Result};
use mailsift_storage::SessionRecord;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Module Registry
pub struct ModuleRegistry {
    modules: Vec<Arc<dyn Module>>,
    ipc: HashMap<String, IpcHandler>,
    rpc: HashMap<String, RpcHandler>,
}

impl ModuleRegistry {
    /// Create a registry; module names and channel names must be unique
    pub fn new(modules: Vec<Arc<dyn Module>>) -> Result<Self> {
        let mut names = HashSet::new();
        let mut ipc = HashMap::new();
        let mut rpc = HashMap::new();

        for module in &modules {
            if !names.insert(module.name().to_string()) {
                return Err(Error::Config(format!(
                    "Duplicate module name: {}",
                    module.name()
                )));
            }

            for channel in module.ipc() {
                if ipc.insert(channel.name.clone(), channel.handler).is_some() {
                    return Err(Error::Config(format!(
                        "Duplicate IPC channel: {}",
                        channel.name
                    )));
                }
            }

            for channel in module.rpc() {
                if rpc.insert(channel.name.clone(), channel.handler).is_some() {
                    return Err(Error::Config(format!(
                        "Duplicate RPC channel: {}",
                        channel.name
                    )));
                }
            }
        }

        Ok(Self { modules, ipc, rpc })
    }

    /// Build the built-in modules from configuration
    pub fn from_config(config: &Config) -> Result<Self> {
        let modules: Vec<Arc<dyn Module>> = vec![
            Arc::new(RspamdModule::new(config.modules.rspamd.clone())?),
            Arc::new(RulesModule::new(config.modules.rules.clone())?),
            Arc::new(RecipientsModule::new(config.modules.recipients.clone())),
            Arc::new(QuotasModule::new(config.modules.quotas.clone())),
        ];

        Self::new(modules)
    }

    /// Initialize every enabled module
    pub async fn init_all(&self) -> Result<()> {
        for module in self.enabled() {
            module
                .init()
                .await
                .map_err(|e| Error::Module(format!("{}: {}", module.name(), e)))?;
            info!(module = module.name(), "Module initialized");
        }
        Ok(())
    }

    /// Stop every enabled module, logging failures
    pub async fn stop_all(&self) {
        for module in self.enabled() {
            if let Err(e) = module.stop().await {
                error!(module = module.name(), "Failed to stop module: {}", e);
            }
        }
    }

    /// Modules taking part in this run
    pub fn enabled(&self) -> Vec<Arc<dyn Module>> {
        self.modules
            .iter()
            .filter(|m| m.enabled())
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Ask every enabled module whether to accept a recipient.
    ///
    /// The first Reject wins immediately. Otherwise the first TempFail is
    /// returned; a failed check counts as TempFail.
    pub async fn recipient_check(
        &self,
        connection: &ConnectionInfo,
        recipient: &EmailAddress,
    ) -> RecipientVerdict {
        let mut deferred: Option<RecipientVerdict> = None;

        for module in self.enabled() {
            let verdict = match module.recipient_check(connection, recipient).await {
                Ok(verdict) => verdict,
                Err(e) => {
                    warn!(module = module.name(), recipient = %recipient, "Recipient check failed: {}", e);
                    RecipientVerdict::tempfail("Temporary failure checking recipient")
                }
            };

            match verdict.action {
                Action::Reject => {
                    debug!(module = module.name(), recipient = %recipient, "Recipient rejected");
                    return verdict;
                }
                Action::TempFail | Action::Error => {
                    if deferred.is_none() {
                        deferred = Some(RecipientVerdict::tempfail(verdict.message));
                    }
                }
                Action::Permit => {}
            }
        }

        deferred.unwrap_or_else(RecipientVerdict::permit)
    }

    /// Tell every enabled module a session ended
    pub async fn session_disconnect(&self, session: &SessionRecord) {
        for module in self.enabled() {
            module.session_disconnect(session).await;
        }
    }

    pub fn ipc_channels(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.ipc.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn rpc_channels(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.rpc.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Deliver a payload to a named IPC channel
    pub async fn dispatch_ipc(&self, channel: &str, payload: serde_json::Value) -> Result<()> {
        let handler = self
            .ipc
            .get(channel)
            .ok_or_else(|| Error::Module(format!("Unknown IPC channel: {}", channel)))?;

        handler(payload)
            .await
            .map_err(|e| Error::Module(format!("IPC {} failed: {}", channel, e)))
    }

    /// Call a named RPC channel
    pub async fn call_rpc(
        &self,
        channel: &str,
        payload: serde_json::Value,
    ) -> Result<serde_json::Value> {
        let handler = self
            .rpc
            .get(channel)
            .ok_or_else(|| Error::Module(format!("Unknown RPC channel: {}", channel)))?;

        handler(payload)
            .await
            .map_err(|e| Error::Module(format!("RPC {} failed: {}", channel, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::test_support::{FailingRecipients, StaticModule};
    use crate::modules::{IpcChannel, RpcChannel};
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Gate {
        name: &'static str,
        verdict: RecipientVerdict,
        calls: AtomicUsize,
    }

    impl Gate {
        fn new(name: &'static str, verdict: RecipientVerdict) -> Arc<Self> {
            Arc::new(Self {
                name,
                verdict,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Module for Gate {
        fn name(&self) -> &str {
            self.name
        }

        async fn recipient_check(
            &self,
            _connection: &ConnectionInfo,
            _recipient: &EmailAddress,
        ) -> anyhow::Result<RecipientVerdict> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.verdict.clone())
        }
    }

    struct Channels;

    #[async_trait]
    impl Module for Channels {
        fn name(&self) -> &str {
            "channels"
        }

        fn ipc(&self) -> Vec<IpcChannel> {
            vec![IpcChannel {
                name: "channels.ping".to_string(),
                handler: Arc::new(|_| Box::pin(async { Ok(()) })),
            }]
        }

        fn rpc(&self) -> Vec<RpcChannel> {
            vec![RpcChannel {
                name: "channels.echo".to_string(),
                handler: Arc::new(|payload| Box::pin(async move { Ok(payload) })),
            }]
        }
    }

    fn rcpt() -> EmailAddress {
        EmailAddress::new("user", "example.org")
    }

    #[test]
    fn test_duplicate_module_names_rejected() {
        let result = ModuleRegistry::new(vec![
            Arc::new(StaticModule::permit("dup")),
            Arc::new(StaticModule::permit("dup")),
        ]);
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_duplicate_channels_rejected() {
        struct Other;

        #[async_trait]
        impl Module for Other {
            fn name(&self) -> &str {
                "other"
            }

            fn ipc(&self) -> Vec<IpcChannel> {
                Channels.ipc()
            }
        }

        let result = ModuleRegistry::new(vec![Arc::new(Channels), Arc::new(Other)]);
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_from_config_builds_builtins() {
        let registry = ModuleRegistry::from_config(&Config::default()).unwrap();
        assert_eq!(registry.len(), 4);
        assert_eq!(registry.ipc_channels(), vec!["quotas.reset"]);

        let enabled: Vec<String> = registry
            .enabled()
            .iter()
            .map(|m| m.name().to_string())
            .collect();
        assert_eq!(enabled, vec!["rules".to_string()]);
    }

    #[tokio::test]
    async fn test_recipient_reject_short_circuits() {
        let reject = Gate::new("a", RecipientVerdict::reject("no such user"));
        let later = Gate::new("b", RecipientVerdict::permit());
        let registry = ModuleRegistry::new(vec![reject.clone(), later.clone()]).unwrap();

        let verdict = registry
            .recipient_check(&ConnectionInfo::default(), &rcpt())
            .await;
        assert_eq!(verdict, RecipientVerdict::reject("no such user"));
        assert_eq!(later.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_recipient_reject_beats_earlier_tempfail() {
        let registry = ModuleRegistry::new(vec![
            Gate::new("a", RecipientVerdict::tempfail("busy")),
            Gate::new("b", RecipientVerdict::reject("no such user")),
        ])
        .unwrap();

        let verdict = registry
            .recipient_check(&ConnectionInfo::default(), &rcpt())
            .await;
        assert_eq!(verdict.action, Action::Reject);
    }

    #[tokio::test]
    async fn test_recipient_error_folds_to_tempfail() {
        let registry = ModuleRegistry::new(vec![
            Arc::new(FailingRecipients) as Arc<dyn Module>,
            Gate::new("b", RecipientVerdict::permit()),
        ])
        .unwrap();

        let verdict = registry
            .recipient_check(&ConnectionInfo::default(), &rcpt())
            .await;
        assert_eq!(verdict.action, Action::TempFail);
    }

    #[tokio::test]
    async fn test_all_permit() {
        let registry = ModuleRegistry::new(vec![
            Gate::new("a", RecipientVerdict::permit()),
            Gate::new("b", RecipientVerdict::permit()),
        ])
        .unwrap();

        let verdict = registry
            .recipient_check(&ConnectionInfo::default(), &rcpt())
            .await;
        assert_eq!(verdict, RecipientVerdict::permit());
    }

    #[tokio::test]
    async fn test_ipc_and_rpc_dispatch() {
        let registry = ModuleRegistry::new(vec![Arc::new(Channels)]).unwrap();

        registry
            .dispatch_ipc("channels.ping", serde_json::json!({}))
            .await
            .unwrap();
        let reply = registry
            .call_rpc("channels.echo", serde_json::json!({"n": 1}))
            .await
            .unwrap();
        assert_eq!(reply, serde_json::json!({"n": 1}));

        assert!(registry
            .dispatch_ipc("missing", serde_json::Value::Null)
            .await
            .is_err());
    }
}
