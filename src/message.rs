//! # Room Message Payloads
//!
//! JSON shapes that leave the relay: the assembled transcript message that is
//! stored per room and broadcast to every client, and the notice sent when the
//! backend rejects a language pair.
//!
//! ## Key Rust Concepts:
//! - **serde rename**: the wire format mixes snake_case and camelCase keys, so
//!   individual fields are renamed instead of the whole struct
//! - **#[serde(default)]**: entries written by older relays may lack newer
//!   fields and still decode

use serde::{Deserialize, Serialize};

/// One discrete transcript message, as stored in the room history and
/// broadcast to clients.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RelayMessage {
    /// UUID v4, unique within a room's history
    pub id: String,

    /// Accumulated translated text
    pub translation: String,

    /// Language reported by the backend for this message
    #[serde(default)]
    pub language: String,

    /// Set once the backend declared the utterance complete
    #[serde(default)]
    pub part_finished: bool,

    /// RFC 3339, only filled in on completion
    #[serde(default)]
    pub timestamp: String,

    /// Speaker tag (`"A:"` / `"B:"`), assigned by reverse translation
    #[serde(default)]
    pub user: String,

    #[serde(rename = "reverseTranslation", default)]
    pub reverse_translation: String,

    /// Always false; clients still read the key.
    #[serde(rename = "isReverseTranslation", default)]
    pub is_reverse_translation: bool,
}

impl RelayMessage {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Sent to every client of a room when the backend closes with the
/// unsupported-language code.
#[derive(Debug, Clone, Serialize)]
pub struct UnsupportedLanguageNotice {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub room_id: String,
    pub from_language: String,
    pub to_language: String,
    pub message: String,
    pub status: &'static str,
}

impl UnsupportedLanguageNotice {
    pub fn new(room_id: &str, from_language: &str, to_language: &str) -> Self {
        Self {
            kind: "language_unsupported",
            room_id: room_id.to_string(),
            from_language: from_language.to_string(),
            to_language: to_language.to_string(),
            message: format!(
                "Sorry, translation from {} to {} is not currently supported",
                from_language, to_language
            ),
            status: "unsupported",
        }
    }
}
