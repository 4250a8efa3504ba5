//! Live session registry

use super::{MilterSession, Stage};
use crate::error::{MilterError, MilterResult};
use crate::metrics::Metrics;
use crate::modules::ModuleRegistry;
use chrono::{DateTime, Utc};
use mailsift_common::{Config, SessionId};
use mailsift_storage::StoreQueue;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Shared handle to one session.
///
/// Callbacks for one connection arrive one at a time, but Abort and Close
/// can race with a slow Eom, so every access goes through the lock.
pub type SessionHandle = Arc<Mutex<MilterSession>>;

struct Entry {
    connected_at: DateTime<Utc>,
    handle: SessionHandle,
}

/// Maps session ids to live sessions
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionId, Entry>>,
    max_age: chrono::Duration,
    modules: Arc<ModuleRegistry>,
    store: Arc<StoreQueue>,
    metrics: Arc<Metrics>,
}

impl SessionRegistry {
    pub fn new(
        max_age: Duration,
        modules: Arc<ModuleRegistry>,
        store: Arc<StoreQueue>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let max_age = chrono::Duration::from_std(max_age)
            .unwrap_or_else(|_| chrono::Duration::minutes(15));

        Self {
            sessions: RwLock::new(HashMap::new()),
            max_age,
            modules,
            store,
            metrics,
        }
    }

    /// Allocate and store a new session
    pub async fn create(
        &self,
        config: Arc<Config>,
        client_ip: Option<IpAddr>,
        client_port: Option<u16>,
        reverse_dns: Option<String>,
    ) -> (SessionId, SessionHandle) {
        let mut sessions = self.sessions.write().await;

        let mut id = SessionId::new();
        while sessions.contains_key(&id) {
            id = SessionId::new();
        }

        let session = MilterSession::new(id, config, client_ip, client_port, reverse_dns);
        let entry = Entry {
            connected_at: session.connected_at(),
            handle: Arc::new(Mutex::new(session)),
        };
        let handle = entry.handle.clone();
        sessions.insert(id, entry);

        debug!(session = %id, live = sessions.len(), "Session created");
        (id, handle)
    }

    /// Look up a session that must exist
    pub async fn get(&self, id: SessionId, stage: Stage) -> MilterResult<SessionHandle> {
        self.find(id).await.ok_or(MilterError::NoSession(stage))
    }

    /// Look up a session that may already be gone
    pub async fn find(&self, id: SessionId) -> Option<SessionHandle> {
        self.sessions
            .read()
            .await
            .get(&id)
            .map(|entry| entry.handle.clone())
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Remove a closed session, persist it and notify modules
    pub async fn delete(&self, id: SessionId) -> bool {
        let entry = self.sessions.write().await.remove(&id);
        match entry {
            Some(entry) => {
                self.finish(entry.handle, false).await;
                true
            }
            None => false,
        }
    }

    /// Evict sessions connected for longer than the maximum age as of `now`
    pub async fn prune_at(&self, now: DateTime<Utc>) -> usize {
        let expired: Vec<(SessionId, Entry)> = {
            let mut sessions = self.sessions.write().await;
            let ids: Vec<SessionId> = sessions
                .iter()
                .filter(|(_, entry)| now - entry.connected_at > self.max_age)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| sessions.remove(&id).map(|entry| (id, entry)))
                .collect()
        };

        let count = expired.len();
        for (id, entry) in expired {
            warn!(session = %id, connected_at = %entry.connected_at, "Pruning abandoned session");
            self.metrics.sessions_pruned.inc();
            self.finish(entry.handle, true).await;
        }

        count
    }

    pub async fn prune(&self) -> usize {
        self.prune_at(Utc::now()).await
    }

    async fn finish(&self, handle: SessionHandle, pruned: bool) {
        let record = {
            let session = handle.lock().await;
            session.to_record(Utc::now(), pruned)
        };

        self.modules.session_disconnect(&record).await;
        self.store.enqueue_session(record);
    }

    /// Run [`prune`](Self::prune) every `interval` until `shutdown` fires
    pub fn spawn_pruner(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let registry = self.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let pruned = registry.prune().await;
                        if pruned > 0 {
                            info!(pruned, "Prune sweep evicted sessions");
                        }
                    }
                }
            }

            debug!("Session pruner stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mailsift_storage::MemoryStore;

    fn registry(store: Arc<MemoryStore>) -> SessionRegistry {
        SessionRegistry::new(
            Duration::from_secs(15 * 60),
            Arc::new(ModuleRegistry::new(vec![]).unwrap()),
            Arc::new(StoreQueue::spawn(store, 16)),
            Arc::new(Metrics::new().unwrap()),
        )
    }

    async fn create(registry: &SessionRegistry) -> SessionId {
        registry
            .create(Arc::new(Config::default()), None, None, None)
            .await
            .0
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let registry = registry(Arc::new(MemoryStore::new()));
        let a = create(&registry).await;
        let b = create(&registry).await;

        assert_ne!(a, b);
        assert_eq!(registry.len().await, 2);

        let handle = registry.get(a, Stage::Helo).await.unwrap();
        assert_eq!(handle.lock().await.id(), a);
    }

    #[tokio::test]
    async fn test_get_unknown_is_strict_find_is_lenient() {
        let registry = registry(Arc::new(MemoryStore::new()));
        let id = SessionId::new();

        assert!(matches!(
            registry.get(id, Stage::Helo).await,
            Err(MilterError::NoSession(Stage::Helo))
        ));
        assert!(registry.find(id).await.is_none());
    }

    #[tokio::test]
    async fn test_delete_persists_session() {
        let store = Arc::new(MemoryStore::new());
        let registry = registry(store.clone());
        let id = create(&registry).await;

        assert!(registry.delete(id).await);
        assert!(!registry.delete(id).await);
        assert!(registry.find(id).await.is_none());

        registry.store.shutdown().await;
        let sessions = store.sessions();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].id, id);
        assert!(sessions[0].disconnected_at.is_some());
        assert!(!sessions[0].pruned);
    }

    #[tokio::test]
    async fn test_prune_evicts_abandoned_session() {
        let store = Arc::new(MemoryStore::new());
        let registry = registry(store.clone());
        let id = create(&registry).await;

        // Nothing is old enough yet
        assert_eq!(registry.prune().await, 0);

        let later = Utc::now() + chrono::Duration::minutes(16);
        assert_eq!(registry.prune_at(later).await, 1);
        assert!(registry.find(id).await.is_none());
        assert!(registry.get(id, Stage::Eom).await.is_err());
        assert_eq!(registry.metrics.sessions_pruned.get(), 1);

        registry.store.shutdown().await;
        assert!(store.sessions()[0].pruned);
    }

    #[tokio::test]
    async fn test_prune_keeps_young_sessions() {
        let registry = registry(Arc::new(MemoryStore::new()));
        let id = create(&registry).await;

        let later = Utc::now() + chrono::Duration::minutes(14);
        assert_eq!(registry.prune_at(later).await, 0);
        assert!(registry.find(id).await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pruner_stops_on_shutdown() {
        let registry = Arc::new(registry(Arc::new(MemoryStore::new())));
        let shutdown = CancellationToken::new();
        let pruner = registry.spawn_pruner(Duration::from_secs(60), shutdown.clone());

        tokio::time::sleep(Duration::from_secs(120)).await;
        shutdown.cancel();
        pruner.await.unwrap();
    }
}
