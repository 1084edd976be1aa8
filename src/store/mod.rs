//! # Ordered Message Store
//!
//! Every room keeps its transcript history as an ordered list of JSON entries
//! under `room:{room_id}:messages`. The list supports exactly four operations
//! (append, read all, replace at index, delete all), which map one-to-one onto
//! Redis `RPUSH`, `LRANGE 0 -1`, `LSET` and `DEL`.
//!
//! On top of the raw list this module provides *upsert by message id*:
//! read everything, find the entry whose `id` matches, replace it in place,
//! or append when it is not there yet.
//!
//! ## Backends:
//! - **MemoryMessageStore**: process-local, the default
//! - **RedisMessageStore**: shared external list store
//!
//! ## Key Rust Concepts:
//! - **#[async_trait]**: async methods behind `dyn MessageStore`
//! - **Arc<dyn Trait>**: the backend is picked at startup and shared by every room

pub mod memory;
pub mod redis_store;

use crate::config::{StoreBackend, StoreConfig};
use crate::error::StoreError;
use crate::message::RelayMessage;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

pub use memory::MemoryMessageStore;
pub use redis_store::RedisMessageStore;

/// Ordered per-room list of serialized messages.
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn append(&self, room_id: &str, entry: String) -> Result<(), StoreError>;

    async fn read_all(&self, room_id: &str) -> Result<Vec<String>, StoreError>;

    async fn replace_at(&self, room_id: &str, index: usize, entry: String) -> Result<(), StoreError>;

    async fn delete_all(&self, room_id: &str) -> Result<(), StoreError>;
}

/// Key of a room's history list.
pub fn messages_key(room_id: &str) -> String {
    format!("room:{}:messages", room_id)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Appended,
    Replaced(usize),
}

/// Position of the entry with `id`. Entries that fail to decode are skipped.
pub fn locate(entries: &[String], id: &str) -> Option<usize> {
    entries.iter().position(|raw| {
        serde_json::from_str::<RelayMessage>(raw)
            .map(|msg| msg.id == id)
            .unwrap_or(false)
    })
}

/// Replace the stored entry with the same id, or append a new one.
///
/// Not atomic on its own: callers that may race on one room hold the room's
/// store-write lock around this call.
pub async fn upsert_message(
    store: &dyn MessageStore,
    room_id: &str,
    message: &RelayMessage,
) -> Result<UpsertOutcome, StoreError> {
    let payload = message.to_json()?;
    let entries = store.read_all(room_id).await?;

    match locate(&entries, &message.id) {
        Some(index) => {
            store.replace_at(room_id, index, payload).await?;
            Ok(UpsertOutcome::Replaced(index))
        }
        None => {
            store.append(room_id, payload).await?;
            Ok(UpsertOutcome::Appended)
        }
    }
}

/// Decoded history with each entry's list index. Undecodable entries are
/// logged and left out, but keep their slot in the numbering.
pub async fn read_messages(
    store: &dyn MessageStore,
    room_id: &str,
) -> Result<Vec<(usize, RelayMessage)>, StoreError> {
    let entries = store.read_all(room_id).await?;
    let mut messages = Vec::with_capacity(entries.len());

    for (index, raw) in entries.iter().enumerate() {
        match serde_json::from_str::<RelayMessage>(raw) {
            Ok(msg) => messages.push((index, msg)),
            Err(e) => warn!(room_id = %room_id, index, "skipping undecodable stored message: {}", e),
        }
    }

    Ok(messages)
}

/// Build the store selected by configuration.
pub async fn connect(config: &StoreConfig) -> anyhow::Result<Arc<dyn MessageStore>> {
    match config.backend {
        StoreBackend::Memory => {
            info!("Using in-memory message store");
            Ok(Arc::new(MemoryMessageStore::new()))
        }
        StoreBackend::Redis => {
            info!("Connecting message store to {}", config.redis_url);
            let store = RedisMessageStore::connect(&config.redis_url).await?;
            Ok(Arc::new(store))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(id: &str, text: &str) -> RelayMessage {
        RelayMessage {
            id: id.to_string(),
            translation: text.to_string(),
            language: "en".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_messages_key() {
        assert_eq!(messages_key("r1"), "room:r1:messages");
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent() {
        let store = MemoryMessageStore::new();
        let msg = message("m1", "Hello.");

        assert_eq!(upsert_message(&store, "r1", &msg).await.unwrap(), UpsertOutcome::Appended);
        assert_eq!(upsert_message(&store, "r1", &msg).await.unwrap(), UpsertOutcome::Replaced(0));

        let entries = store.read_all("r1").await.unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn test_upsert_replaces_in_place() {
        let store = MemoryMessageStore::new();
        upsert_message(&store, "r1", &message("a", "first")).await.unwrap();
        upsert_message(&store, "r1", &message("b", "second")).await.unwrap();
        upsert_message(&store, "r1", &message("a", "first, edited")).await.unwrap();

        let messages = read_messages(&store, "r1").await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].1.translation, "first, edited");
        assert_eq!(messages[1].1.id, "b");
    }

    #[tokio::test]
    async fn test_locate_skips_garbage() {
        let store = MemoryMessageStore::new();
        store.append("r1", "not json".to_string()).await.unwrap();
        upsert_message(&store, "r1", &message("a", "x")).await.unwrap();

        let entries = store.read_all("r1").await.unwrap();
        assert_eq!(locate(&entries, "a"), Some(1));

        let messages = read_messages(&store, "r1").await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].0, 1);
    }
}
