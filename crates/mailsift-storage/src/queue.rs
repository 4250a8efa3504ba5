//! Fire-and-forget record queue

use crate::models::{MessageRecord, SessionRecord};
use crate::store::MessageStore;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

enum Record {
    Message(Box<MessageRecord>),
    Session(Box<SessionRecord>),
}

/// Bounded queue in front of a [`MessageStore`].
///
/// Enqueueing never waits: when the queue is full the record is dropped and
/// a warning is logged.
pub struct StoreQueue {
    sender: Mutex<Option<mpsc::Sender<Record>>>,
    writer: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl StoreQueue {
    /// Spawn the background writer. Must be called inside a tokio runtime.
    pub fn spawn(store: Arc<dyn MessageStore>, capacity: usize) -> Self {
        let (sender, mut receiver) = mpsc::channel::<Record>(capacity.max(1));

        let writer = tokio::spawn(async move {
            while let Some(record) = receiver.recv().await {
                let result = match &record {
                    Record::Message(m) => store.save_message(m).await,
                    Record::Session(s) => store.save_session(s).await,
                };
                if let Err(e) = result {
                    error!("Failed to persist record: {}", e);
                }
            }

            if let Err(e) = store.flush().await {
                error!("Failed to flush record store: {}", e);
            }
            debug!("Record writer stopped");
        });

        Self {
            sender: Mutex::new(Some(sender)),
            writer: tokio::sync::Mutex::new(Some(writer)),
        }
    }

    /// Queue a finalized message
    pub fn enqueue_message(&self, record: MessageRecord) {
        self.enqueue(Record::Message(Box::new(record)));
    }

    /// Queue a closed session
    pub fn enqueue_session(&self, record: SessionRecord) {
        self.enqueue(Record::Session(Box::new(record)));
    }

    fn enqueue(&self, record: Record) {
        let sender = self.sender.lock().unwrap_or_else(|e| e.into_inner());
        let Some(sender) = sender.as_ref() else {
            warn!("Record queue already shut down, dropping record");
            return;
        };

        match sender.try_send(record) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => warn!("Record queue full, dropping record"),
            Err(TrySendError::Closed(_)) => warn!("Record writer gone, dropping record"),
        }
    }

    /// Close the queue and wait until every pending record is written
    pub async fn shutdown(&self) {
        self.sender
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();

        if let Some(writer) = self.writer.lock().await.take() {
            if let Err(e) = writer.await {
                error!("Record writer task failed: {}", e);
            }
        }
    }
}
