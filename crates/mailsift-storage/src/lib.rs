//! mailsift Storage - persistence hook for finalized records
//!
//! The filter hands finalized sessions and messages to a [`StoreQueue`],
//! which writes them through a [`MessageStore`] on a background task so
//! the milter reply path never waits on storage.

pub mod models;
pub mod queue;
pub mod store;

pub use models::{CheckRecord, HeaderRecord, MessageRecord, SessionRecord};
pub use queue::StoreQueue;
pub use store::{create_store, JsonLinesStore, MemoryStore, MessageStore, NullStore};
