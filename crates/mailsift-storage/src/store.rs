//! Record store abstraction

use crate::models::{MessageRecord, SessionRecord};
use async_trait::async_trait;
use mailsift_common::config::StorageConfig;
use mailsift_common::{Error, Result};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::info;

/// Record store trait
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persist a finalized message
    async fn save_message(&self, record: &MessageRecord) -> Result<()>;

    /// Persist a closed session
    async fn save_session(&self, record: &SessionRecord) -> Result<()>;

    /// Flush buffered data
    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// Line-delimited JSON file store
///
/// Each record becomes one line of the form
/// `{"kind":"message","record":{...}}`.
pub struct JsonLinesStore {
    path: PathBuf,
    file: tokio::sync::Mutex<Option<tokio::fs::File>>,
}

#[derive(Serialize)]
struct Line<'a, T> {
    kind: &'static str,
    record: &'a T,
}

impl JsonLinesStore {
    /// Create a store appending to `path`, creating parent directories
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    Error::Storage(format!("Failed to create storage directory: {}", e))
                })?;
            }
        }

        info!(path = %path.display(), "Initialized JSON-lines record store");

        Ok(Self {
            path,
            file: tokio::sync::Mutex::new(None),
        })
    }

    async fn append<T: Serialize>(&self, kind: &'static str, record: &T) -> Result<()> {
        let mut line = serde_json::to_vec(&Line { kind, record })
            .map_err(|e| Error::Storage(format!("Failed to encode record: {}", e)))?;
        line.push(b'\n');

        let mut file = self.file.lock().await;
        if file.is_none() {
            let opened = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await
                .map_err(|e| Error::Storage(format!("Failed to open {}: {}", self.path.display(), e)))?;
            *file = Some(opened);
        }

        if let Some(f) = file.as_mut() {
            f.write_all(&line)
                .await
                .map_err(|e| Error::Storage(format!("Failed to write record: {}", e)))?;
        }

        Ok(())
    }
}

#[async_trait]
impl MessageStore for JsonLinesStore {
    async fn save_message(&self, record: &MessageRecord) -> Result<()> {
        self.append("message", record).await
    }

    async fn save_session(&self, record: &SessionRecord) -> Result<()> {
        self.append("session", record).await
    }

    async fn flush(&self) -> Result<()> {
        if let Some(f) = self.file.lock().await.as_mut() {
            f.flush()
                .await
                .map_err(|e| Error::Storage(format!("Failed to flush records: {}", e)))?;
        }
        Ok(())
    }
}

/// In-memory store, used by tests and diagnostics
#[derive(Default)]
pub struct MemoryStore {
    messages: Mutex<Vec<MessageRecord>>,
    sessions: Mutex<Vec<SessionRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<MessageRecord> {
        self.messages.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn sessions(&self) -> Vec<SessionRecord> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn save_message(&self, record: &MessageRecord) -> Result<()> {
        self.messages
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(record.clone());
        Ok(())
    }

    async fn save_session(&self, record: &SessionRecord) -> Result<()> {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(record.clone());
        Ok(())
    }
}

/// Store that discards everything
pub struct NullStore;

#[async_trait]
impl MessageStore for NullStore {
    async fn save_message(&self, _record: &MessageRecord) -> Result<()> {
        Ok(())
    }

    async fn save_session(&self, _record: &SessionRecord) -> Result<()> {
        Ok(())
    }
}

/// Build the store selected by configuration
pub fn create_store(config: &StorageConfig) -> Result<Arc<dyn MessageStore>> {
    if config.enabled {
        Ok(Arc::new(JsonLinesStore::new(&config.path)?))
    } else {
        info!("Record storage disabled");
        Ok(Arc::new(NullStore))
    }
}
