//! # WebSocket Session Gate
//!
//! Joining a room requires a logged-in browser session. Sessions are issued
//! elsewhere; the relay only checks that the session id carried in the
//! session cookie is still known to the shared session store.
//!
//! With `auth.enabled = false` every upgrade is let through.

use crate::config::AuthConfig;
use crate::error::AuthError;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::sync::Arc;
use tracing::{debug, info};

#[async_trait]
pub trait SessionGate: Send + Sync {
    /// `session_id` is the cookie value, if the request carried one.
    async fn check(&self, session_id: Option<&str>) -> Result<(), AuthError>;
}

pub struct OpenGate;

#[async_trait]
impl SessionGate for OpenGate {
    async fn check(&self, _session_id: Option<&str>) -> Result<(), AuthError> {
        Ok(())
    }
}

/// Accepts a session when `{prefix}:{id}` exists in Redis.
pub struct RedisSessionGate {
    conn: ConnectionManager,
    prefix: String,
}

impl RedisSessionGate {
    pub async fn connect(url: &str, prefix: &str) -> Result<Self, AuthError> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self {
            conn,
            prefix: prefix.to_string(),
        })
    }
}

pub fn session_key(prefix: &str, session_id: &str) -> String {
    format!("{}:{}", prefix, session_id)
}

#[async_trait]
impl SessionGate for RedisSessionGate {
    async fn check(&self, session_id: Option<&str>) -> Result<(), AuthError> {
        let session_id = session_id
            .filter(|id| !id.is_empty())
            .ok_or(AuthError::MissingCookie)?;

        let mut conn = self.conn.clone();
        let exists: bool = conn.exists(session_key(&self.prefix, session_id)).await?;
        if exists {
            Ok(())
        } else {
            debug!("rejected unknown session");
            Err(AuthError::UnknownSession)
        }
    }
}

pub async fn build_gate(config: &AuthConfig) -> anyhow::Result<Arc<dyn SessionGate>> {
    if !config.enabled {
        info!("WebSocket session gate disabled");
        return Ok(Arc::new(OpenGate));
    }
    info!("Checking WebSocket sessions against {}", config.redis_url);
    let gate = RedisSessionGate::connect(&config.redis_url, &config.session_key_prefix).await?;
    Ok(Arc::new(gate))
}
