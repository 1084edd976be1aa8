//! # Reverse Translation
//!
//! Once a message is final, it is translated back into the other language of
//! the room so both speakers can check what the other side received. The
//! result is written into the stored message (`reverseTranslation`, plus a
//! speaker tag in `user`) and the updated message is broadcast again.
//!
//! ## Pipeline, per completed message:
//! 1. Take the room's reverse-queue lock; runs of one room never overlap
//! 2. Read the history and keep the latest `context_window` entries; a message
//!    with no text ends the run here
//! 3. Tag the speaker: a message in the room's source language is `B:` and is
//!    translated to the target language; anything else is `A:` and goes the
//!    other way
//! 4. Build a context string from the window, one line per entry
//! 5. Try the backend with growing timeouts; a truncated response triggers one
//!    extra attempt without context
//! 6. Under the store-write lock, find the message again by id and update it
//!
//! Exhausting the attempts is logged and otherwise silent: the stored message
//! simply has no reverse translation.

use crate::config::ReverseConfig;
use crate::error::{ReverseError, StoreError};
use crate::message::RelayMessage;
use crate::store::{locate, read_messages, MessageStore};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReverseRequest {
    pub to_language: String,
    pub context: String,
    pub text: String,
}

/// A service that translates one message back, given recent context.
#[async_trait]
pub trait ReverseTranslator: Send + Sync {
    async fn translate(&self, request: &ReverseRequest) -> Result<String, ReverseError>;
}

/// JSON-over-HTTP reverse translation backend.
///
/// Request: `POST {to_language, context, text}`; response: `{translation}`.
pub struct HttpReverseTranslator {
    client: reqwest::Client,
    api_url: String,
    api_key: Option<String>,
}

impl HttpReverseTranslator {
    pub fn new(config: &ReverseConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url: config.api_url.clone(),
            api_key: config.api_key.clone(),
        }
    }
}

#[derive(Deserialize)]
struct ReverseResponse {
    translation: String,
}

/// A body that ends mid-document is reported as `Truncated`, distinct from
/// a well-formed but wrong body.
fn parse_response(body: &str) -> Result<String, ReverseError> {
    match serde_json::from_str::<ReverseResponse>(body) {
        Ok(response) => Ok(response.translation),
        Err(e) if e.is_eof() => Err(ReverseError::Truncated),
        Err(e) => Err(ReverseError::Decode(e)),
    }
}

#[async_trait]
impl ReverseTranslator for HttpReverseTranslator {
    async fn translate(&self, request: &ReverseRequest) -> Result<String, ReverseError> {
        let mut builder = self.client.post(&self.api_url).json(request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ReverseError::Status(status.as_u16()));
        }

        let body = response.text().await?;
        parse_response(&body)
    }
}

/// Attempt budget of one pipeline run.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub attempt_timeouts: Vec<Duration>,
    pub fallback_timeout: Duration,
    pub backoff: Duration,
}

impl From<&ReverseConfig> for RetryPolicy {
    fn from(config: &ReverseConfig) -> Self {
        Self {
            attempt_timeouts: config.attempt_timeouts(),
            fallback_timeout: config.fallback_timeout(),
            backoff: config.retry_backoff(),
        }
    }
}

/// Everything a room's reverse runs share.
pub struct ReverseContext {
    pub room_id: String,
    pub from_language: String,
    pub to_language: String,
    pub context_window: usize,
    pub policy: RetryPolicy,
    pub store: Arc<dyn MessageStore>,
    pub translator: Arc<dyn ReverseTranslator>,
    /// Serializes pipeline runs of the room
    pub queue_lock: Arc<Mutex<()>>,
    /// Serializes every store read-modify-write of the room
    pub write_lock: Arc<Mutex<()>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReverseOutcome {
    /// Stored and ready to broadcast
    Updated(RelayMessage),
    /// The message is no longer in the history window or the store
    NotFound,
    /// The message has no text to translate back
    Empty,
    Exhausted,
    Cancelled,
    StoreFailed,
}

/// Speaker tag and reverse target language for a message in `language`.
pub fn speaker_and_target<'a>(language: &str, from: &'a str, to: &'a str) -> (&'static str, &'a str) {
    if language == from {
        ("B:", to)
    } else {
        ("A:", from)
    }
}

/// One line per window entry: the entry's own text when it is in the trigger's
/// language, otherwise its reverse translation. Each line carries the speaker
/// tag stored with that entry; the trigger carries its new tag `user`. A
/// window holding only the trigger yields no context.
pub fn build_context(window: &[RelayMessage], trigger: &RelayMessage, user: &str) -> String {
    let lone_trigger = window.len() == 1;
    window
        .iter()
        .filter(|entry| !(lone_trigger && entry.id == trigger.id))
        .map(|entry| {
            let speaker = if entry.id == trigger.id { user } else { entry.user.as_str() };
            if entry.language == trigger.language {
                format!("{}{}", speaker, entry.translation)
            } else {
                format!("{}{}", speaker, entry.reverse_translation)
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

impl ReverseContext {
    /// Reverse-translate the stored message `message_id`.
    pub async fn run(&self, message_id: &str, cancel: &CancellationToken) -> ReverseOutcome {
        let _queue = tokio::select! {
            biased;
            _ = cancel.cancelled() => return ReverseOutcome::Cancelled,
            guard = self.queue_lock.lock() => guard,
        };

        let messages = match read_messages(self.store.as_ref(), &self.room_id).await {
            Ok(messages) => messages,
            Err(e) => {
                warn!(room_id = %self.room_id, "reverse translation could not read history: {}", e);
                return ReverseOutcome::StoreFailed;
            }
        };

        let start = messages.len().saturating_sub(self.context_window);
        let window: Vec<RelayMessage> = messages[start..].iter().map(|(_, m)| m.clone()).collect();
        let Some(trigger) = window.iter().find(|m| m.id == message_id).cloned() else {
            debug!(room_id = %self.room_id, message_id, "message left the context window");
            return ReverseOutcome::NotFound;
        };
        if trigger.translation.is_empty() {
            debug!(room_id = %self.room_id, message_id, "nothing to reverse-translate");
            return ReverseOutcome::Empty;
        }

        let (user, target) =
            speaker_and_target(&trigger.language, &self.from_language, &self.to_language);
        let request = ReverseRequest {
            to_language: target.to_string(),
            context: build_context(&window, &trigger, user),
            text: trigger.translation.clone(),
        };

        let reverse = match self.attempt(&request, cancel).await {
            Ok(Some(text)) => text,
            Ok(None) => {
                warn!(
                    room_id = %self.room_id,
                    message_id,
                    "reverse translation failed after {} attempts",
                    self.policy.attempt_timeouts.len()
                );
                return ReverseOutcome::Exhausted;
            }
            Err(outcome) => return outcome,
        };

        self.write_back(message_id, user, reverse, cancel).await
    }

    /// `Ok(None)` when every attempt failed.
    async fn attempt(
        &self,
        request: &ReverseRequest,
        cancel: &CancellationToken,
    ) -> Result<Option<String>, ReverseOutcome> {
        let attempts = self.policy.attempt_timeouts.len();

        for (i, timeout) in self.policy.attempt_timeouts.iter().enumerate() {
            match self.call(request, *timeout, cancel).await? {
                Ok(text) => return Ok(Some(text)),
                Err(ReverseError::Truncated) => {
                    warn!(room_id = %self.room_id, attempt = i + 1, "truncated response, retrying without context");
                    let fallback = ReverseRequest {
                        context: String::new(),
                        ..request.clone()
                    };
                    match self.call(&fallback, self.policy.fallback_timeout, cancel).await? {
                        Ok(text) => return Ok(Some(text)),
                        Err(e) => warn!(room_id = %self.room_id, attempt = i + 1, "contextless attempt failed: {}", e),
                    }
                }
                Err(e) => warn!(room_id = %self.room_id, attempt = i + 1, "reverse translation attempt failed: {}", e),
            }

            if i + 1 < attempts {
                let backoff = self.policy.backoff * (i as u32 + 1);
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(ReverseOutcome::Cancelled),
                    _ = tokio::time::sleep(backoff) => {}
                }
            }
        }

        Ok(None)
    }

    /// One bounded call. The outer `Err` means the session was cancelled.
    async fn call(
        &self,
        request: &ReverseRequest,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Result<String, ReverseError>, ReverseOutcome> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ReverseOutcome::Cancelled),
            result = tokio::time::timeout(timeout, self.translator.translate(request)) => {
                Ok(result.unwrap_or(Err(ReverseError::Timeout(timeout))))
            }
        }
    }

    async fn write_back(
        &self,
        message_id: &str,
        user: &str,
        reverse: String,
        cancel: &CancellationToken,
    ) -> ReverseOutcome {
        let _write = self.write_lock.lock().await;
        if cancel.is_cancelled() {
            return ReverseOutcome::Cancelled;
        }

        let result = self.store_reverse(message_id, user, reverse).await;

        match result {
            Ok(Some(message)) => {
                info!(room_id = %self.room_id, message_id, "reverse translation stored");
                ReverseOutcome::Updated(message)
            }
            Ok(None) => {
                debug!(room_id = %self.room_id, message_id, "message gone before reverse write-back");
                ReverseOutcome::NotFound
            }
            Err(e) => {
                warn!(room_id = %self.room_id, message_id, "reverse write-back failed: {}", e);
                ReverseOutcome::StoreFailed
            }
        }
    }

    /// Re-locate the message by id and fill in the reverse fields.
    async fn store_reverse(
        &self,
        message_id: &str,
        user: &str,
        reverse: String,
    ) -> Result<Option<RelayMessage>, StoreError> {
        let entries = self.store.read_all(&self.room_id).await?;
        let Some(index) = locate(&entries, message_id) else {
            return Ok(None);
        };

        let mut message: RelayMessage = serde_json::from_str(&entries[index])?;
        message.user = user.to_string();
        message.reverse_translation = reverse;
        self.store
            .replace_at(&self.room_id, index, message.to_json()?)
            .await?;
        Ok(Some(message))
    }
}
