use super::{messages_key, MessageStore};
use crate::error::StoreError;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;

/// Process-local list store with the same semantics as the Redis backend.
#[derive(Debug, Default)]
pub struct MemoryMessageStore {
    lists: RwLock<HashMap<String, Vec<String>>>,
}

impl MemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn append(&self, room_id: &str, entry: String) -> Result<(), StoreError> {
        self.lists
            .write()
            .entry(messages_key(room_id))
            .or_default()
            .push(entry);
        Ok(())
    }

    async fn read_all(&self, room_id: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .lists
            .read()
            .get(&messages_key(room_id))
            .cloned()
            .unwrap_or_default())
    }

    async fn replace_at(&self, room_id: &str, index: usize, entry: String) -> Result<(), StoreError> {
        let key = messages_key(room_id);
        let mut lists = self.lists.write();
        match lists.get_mut(&key).and_then(|list| list.get_mut(index)) {
            Some(slot) => {
                *slot = entry;
                Ok(())
            }
            None => Err(StoreError::OutOfRange { key, index }),
        }
    }

    async fn delete_all(&self, room_id: &str) -> Result<(), StoreError> {
        self.lists.write().remove(&messages_key(room_id));
        Ok(())
    }
}
