//! Room members as seen from the event loop: an id plus the sending half of
//! a bounded outbound queue.

use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use uuid::Uuid;

pub type ClientId = Uuid;

/// What the room fans out to its clients.
#[derive(Debug, Clone, PartialEq)]
pub enum RoomPayload {
    /// JSON, delivered as a WebSocket text frame
    Text(Arc<str>),
    /// PCM at the playback rate, delivered as a binary frame
    Audio(Arc<[u8]>),
}

impl RoomPayload {
    pub fn text(json: impl Into<Arc<str>>) -> Self {
        RoomPayload::Text(json.into())
    }

    pub fn audio(pcm: Vec<u8>) -> Self {
        RoomPayload::Audio(pcm.into())
    }
}

/// Owned by the room's event loop. Dropping it closes the client's queue.
#[derive(Debug)]
pub struct ClientHandle {
    pub id: ClientId,
    sender: mpsc::Sender<RoomPayload>,
}

impl ClientHandle {
    /// Non-blocking delivery. `Full` means the client is too slow.
    pub fn try_deliver(&self, payload: RoomPayload) -> Result<(), TrySendError<RoomPayload>> {
        self.sender.try_send(payload)
    }
}

/// A fresh client id with its queue.
pub fn client_channel(capacity: usize) -> (ClientHandle, mpsc::Receiver<RoomPayload>) {
    client_channel_with_id(Uuid::new_v4(), capacity)
}

pub fn client_channel_with_id(
    id: ClientId,
    capacity: usize,
) -> (ClientHandle, mpsc::Receiver<RoomPayload>) {
    let (sender, receiver) = mpsc::channel(capacity.max(1));
    (ClientHandle { id, sender }, receiver)
}
