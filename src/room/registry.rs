//! Room lookup by id. Rooms are created on first join, with the language
//! pair of that first joiner.

use crate::room::room::Room;
use crate::room::RelayContext;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub struct RoomRegistry {
    rooms: parking_lot::RwLock<HashMap<String, Arc<Room>>>,
    ctx: RelayContext,
    shutdown: CancellationToken,
}

impl RoomRegistry {
    pub fn new(ctx: RelayContext) -> Self {
        Self {
            rooms: parking_lot::RwLock::new(HashMap::new()),
            ctx,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn context(&self) -> &RelayContext {
        &self.ctx
    }

    /// The live room with this id, creating it when missing. A room whose
    /// event loop died is replaced.
    pub fn get_or_create(&self, room_id: &str, from_language: &str, to_language: &str) -> Arc<Room> {
        if let Some(room) = self.rooms.read().get(room_id) {
            if room.is_alive() {
                return Arc::clone(room);
            }
        }

        let mut rooms = self.rooms.write();
        if let Some(existing) = rooms.get(room_id) {
            if existing.is_alive() {
                return Arc::clone(existing);
            }
            warn!(room_id, "replacing dead room");
        }

        let room = Room::spawn(room_id, from_language, to_language, &self.ctx, &self.shutdown);
        rooms.insert(room_id.to_string(), Arc::clone(&room));
        room
    }

    pub fn get(&self, room_id: &str) -> Option<Arc<Room>> {
        self.rooms.read().get(room_id).cloned()
    }

    /// Operator close: drops the room's clients and stops its backend
    /// connection. `false` when neither the registry nor the monitor knows
    /// the room.
    pub fn force_close(&self, room_id: &str) -> bool {
        let known = self.ctx.monitor.force_close(room_id);
        match self.get(room_id) {
            Some(room) => {
                room.force_close();
                true
            }
            None => known,
        }
    }

    pub fn room_count(&self) -> usize {
        self.rooms.read().len()
    }

    /// Stop every room. Each room tears down its backend connection on its
    /// own supervisor task.
    pub fn shutdown(&self) {
        info!(rooms = self.room_count(), "shutting down rooms");
        self.shutdown.cancel();
        self.rooms.write().clear();
    }
}
