//! # Translation Backend Wire Protocol
//!
//! How the relay talks to the streaming translation backend:
//!
//! - **Handshake**: a WebSocket URL carrying a short-lived HS256 token and the
//!   room's language pair as query parameters
//! - **Upstream**: binary frames of PCM audio, then a binary `END` sentinel on teardown
//! - **Downstream**: text frames with JSON transcript fragments, binary frames
//!   with synthesized audio, and close code 4001 for an unsupported language pair
//!
//! Every downstream message is decoded once into a `BackendFrame`.

use crate::config::TranslationConfig;
use crate::error::{ConnectError, FrameError};
use chrono::{DateTime, Utc};
use jsonwebtoken::{encode, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use tokio_tungstenite::tungstenite::Message;
use url::Url;

/// Close code the backend uses to reject a language pair.
pub const UNSUPPORTED_LANGUAGE_CLOSE: u16 = 4001;

/// Binary sentinel telling the backend the audio stream is over.
pub const END_OF_STREAM: &[u8] = b"END";

/// One incremental piece of translated text.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct TranscriptFragment {
    #[serde(default)]
    pub translation: String,

    #[serde(default)]
    pub part_finished: bool,

    #[serde(default)]
    pub language: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BackendFrame {
    Fragment(TranscriptFragment),
    Audio(Vec<u8>),
    /// Close frame with its code, if one was sent
    Closed(Option<u16>),
    /// Ping, pong and raw frames: nothing to do
    Keepalive,
}

/// Decode one message read from the backend socket.
pub fn decode_frame(message: Message) -> Result<BackendFrame, FrameError> {
    match message {
        Message::Text(text) => {
            if !text.starts_with('{') {
                return Err(FrameError::NotJson);
            }
            let fragment = serde_json::from_str::<TranscriptFragment>(&text)?;
            Ok(BackendFrame::Fragment(fragment))
        }
        Message::Binary(data) => Ok(BackendFrame::Audio(data)),
        Message::Close(frame) => Ok(BackendFrame::Closed(frame.map(|f| u16::from(f.code)))),
        Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => Ok(BackendFrame::Keepalive),
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    exp: i64,
}

/// Sign the backend access token, valid for `token_ttl_secs` from `now`.
pub fn sign_token(config: &TranslationConfig, now: DateTime<Utc>) -> Result<String, ConnectError> {
    let claims = Claims {
        sub: config.token_subject.clone(),
        exp: now.timestamp() + config.token_ttl_secs as i64,
    };
    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(config.jwt_secret.as_bytes()),
    )?;
    Ok(token)
}

/// The backend URL for one room session.
pub fn backend_url(
    config: &TranslationConfig,
    token: &str,
    from_language: &str,
    to_language: &str,
) -> Result<Url, ConnectError> {
    let url = Url::parse_with_params(
        &config.api_url,
        &[
            ("token", token),
            ("from_language", from_language),
            ("to_language", to_language),
            ("model", config.model.as_str()),
            ("mute", if config.mute { "True" } else { "False" }),
            ("multi", if config.multi { "true" } else { "false" }),
        ],
    )?;
    Ok(url)
}
