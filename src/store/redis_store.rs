use super::{messages_key, MessageStore};
use crate::error::StoreError;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

/// Message store backed by Redis lists.
///
/// `ConnectionManager` reconnects on its own and is cheap to clone, so every
/// call works on a clone instead of locking a shared connection.
#[derive(Clone)]
pub struct RedisMessageStore {
    conn: ConnectionManager,
}

impl RedisMessageStore {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl MessageStore for RedisMessageStore {
    async fn append(&self, room_id: &str, entry: String) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.rpush::<_, _, ()>(messages_key(room_id), entry).await?;
        Ok(())
    }

    async fn read_all(&self, room_id: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.clone();
        let entries: Vec<String> = conn.lrange(messages_key(room_id), 0, -1).await?;
        Ok(entries)
    }

    async fn replace_at(&self, room_id: &str, index: usize, entry: String) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.lset::<_, _, ()>(messages_key(room_id), index as isize, entry)
            .await?;
        Ok(())
    }

    async fn delete_all(&self, room_id: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(messages_key(room_id)).await?;
        Ok(())
    }
}
