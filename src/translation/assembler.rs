//! # Transcript Assembly
//!
//! The backend streams translated text in small fragments. The assembler glues
//! them into messages:
//!
//! 1. Every fragment is appended to the running buffer and the whole message so
//!    far is broadcast, so clients see the text grow live.
//! 2. When a sentence boundary shows up in text not yet stored, the message is
//!    upserted into the room history (still open, same id).
//! 3. When the backend marks the part finished, the message gets a timestamp,
//!    is upserted as final, and the buffer starts over with a fresh id.
//!
//! The assembler itself is pure state; the connection reader performs the
//! broadcast and store writes it asks for.

use crate::message::RelayMessage;
use crate::translation::protocol::TranscriptFragment;
use crate::translation::segment::find_sentence_boundary;
use chrono::{DateTime, SecondsFormat, Utc};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssemblyAction {
    /// Live update only
    BroadcastOnly,
    /// A sentence completed: store the open message
    Upsert,
    /// The backend finished the part: store and reverse-translate
    UpsertFinal,
}

#[derive(Debug, Clone)]
pub struct Assembled {
    pub message: RelayMessage,
    pub action: AssemblyAction,
}

#[derive(Debug, Default)]
pub struct TranscriptAssembler {
    buffer: String,
    message_id: Option<String>,
    /// Byte offset up to which sentences were already stored
    scanned: usize,
}

impl TranscriptAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ingest(&mut self, fragment: TranscriptFragment, now: DateTime<Utc>) -> Assembled {
        self.buffer.push_str(&fragment.translation);
        let id = self
            .message_id
            .get_or_insert_with(|| Uuid::new_v4().to_string())
            .clone();

        let mut message = RelayMessage {
            id,
            translation: self.buffer.clone(),
            language: fragment.language,
            part_finished: fragment.part_finished,
            ..Default::default()
        };

        let action = if fragment.part_finished {
            message.timestamp = now.to_rfc3339_opts(SecondsFormat::Secs, true);
            self.reset();
            AssemblyAction::UpsertFinal
        } else {
            match find_sentence_boundary(&self.buffer, self.scanned) {
                Some(end) if end > self.scanned => {
                    self.scanned = end;
                    AssemblyAction::Upsert
                }
                _ => AssemblyAction::BroadcastOnly,
            }
        };

        Assembled { message, action }
    }

    /// Forget the message in progress.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.message_id = None;
        self.scanned = 0;
    }

    pub fn pending_text(&self) -> &str {
        &self.buffer
    }
}
