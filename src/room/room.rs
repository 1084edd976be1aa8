//! # Room Event Loop
//!
//! Membership changes and broadcasts of one room are handled by a single task,
//! so the member set is only ever touched from one place.
//!
//! ## Inputs (checked in this order each round):
//! 1. **lifetime** cancelled: the registry is shutting down
//! 2. **register**: a client joined
//! 3. **unregister**: a client left
//! 4. **close**: an operator force-closed the room
//! 5. **broadcast**: text or audio for every member
//!
//! ## Occupancy:
//! The first member starts the backend connection; the last one leaving tears
//! it down (the backend gets `END`, the history is cleared). A later join
//! starts a fresh session.
//!
//! ## Backpressure:
//! Each member has a bounded queue. A member whose queue is full when a
//! broadcast arrives is dropped from the room instead of stalling everyone.

use crate::audio::buffer::ClientAudioBuffer;
use crate::audio::processor::AudioProcessor;
use crate::config::AudioConfig;
use crate::monitor::{Monitor, TaskKind};
use crate::room::client::{ClientHandle, ClientId, RoomPayload};
use crate::room::RelayContext;
use crate::translation::connection::{ConnectionParts, TranslationConnection};
use crate::translation::reverse::{RetryPolicy, ReverseContext};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

pub struct Room {
    id: String,
    from_language: String,
    to_language: String,
    register_tx: mpsc::UnboundedSender<ClientHandle>,
    unregister_tx: mpsc::UnboundedSender<ClientId>,
    close_tx: mpsc::UnboundedSender<()>,
    broadcast_tx: mpsc::Sender<RoomPayload>,
    clients: watch::Receiver<Vec<ClientId>>,
    connection: Arc<TranslationConnection>,
    audio: Arc<AudioProcessor>,
    audio_config: AudioConfig,
    buffers: parking_lot::Mutex<HashMap<ClientId, ClientAudioBuffer>>,
    lifetime: CancellationToken,
    alive: AtomicBool,
    monitor: Arc<Monitor>,
}

struct Inbox {
    register_rx: mpsc::UnboundedReceiver<ClientHandle>,
    unregister_rx: mpsc::UnboundedReceiver<ClientId>,
    close_rx: mpsc::UnboundedReceiver<()>,
    broadcast_rx: mpsc::Receiver<RoomPayload>,
}

impl Room {
    /// Create the room and start its event loop. The language pair is fixed
    /// for the room's whole life.
    pub fn spawn(
        id: &str,
        from_language: &str,
        to_language: &str,
        ctx: &RelayContext,
        parent: &CancellationToken,
    ) -> Arc<Room> {
        let config = &ctx.config;
        let (register_tx, register_rx) = mpsc::unbounded_channel();
        let (unregister_tx, unregister_rx) = mpsc::unbounded_channel();
        let (close_tx, close_rx) = mpsc::unbounded_channel();
        let (broadcast_tx, broadcast_rx) = mpsc::channel(config.server.client_queue_capacity.max(1));
        let (clients_tx, clients) = watch::channel(Vec::new());

        let lifetime = parent.child_token();
        let audio = Arc::new(AudioProcessor::new(&config.audio));
        let write_lock = Arc::new(Mutex::new(()));

        let reverse = Arc::new(ReverseContext {
            room_id: id.to_string(),
            from_language: from_language.to_string(),
            to_language: to_language.to_string(),
            context_window: config.reverse.context_window,
            policy: RetryPolicy::from(&config.reverse),
            store: Arc::clone(&ctx.store),
            translator: Arc::clone(&ctx.translator),
            queue_lock: Arc::new(Mutex::new(())),
            write_lock: Arc::clone(&write_lock),
        });

        let connection = TranslationConnection::new(ConnectionParts {
            room_id: id.to_string(),
            from_language: from_language.to_string(),
            to_language: to_language.to_string(),
            config: config.translation.clone(),
            monitor: Arc::clone(&ctx.monitor),
            store: Arc::clone(&ctx.store),
            write_lock,
            reverse,
            audio: Arc::clone(&audio),
            broadcast: broadcast_tx.clone(),
            lifetime: lifetime.clone(),
        });

        let generation = ctx.monitor.register_room(id, "translation");

        let room = Arc::new(Room {
            id: id.to_string(),
            from_language: from_language.to_string(),
            to_language: to_language.to_string(),
            register_tx,
            unregister_tx,
            close_tx,
            broadcast_tx,
            clients,
            connection,
            audio,
            audio_config: config.audio.clone(),
            buffers: parking_lot::Mutex::new(HashMap::new()),
            lifetime,
            alive: AtomicBool::new(true),
            monitor: Arc::clone(&ctx.monitor),
        });

        info!(room_id = %id, from = %from_language, to = %to_language, "room created");

        let event_loop = EventLoop {
            room: Arc::clone(&room),
            members: HashMap::new(),
            clients_tx,
        };
        let handle = tokio::spawn(event_loop.run(Inbox {
            register_rx,
            unregister_rx,
            close_rx,
            broadcast_rx,
        }));

        let supervised = Arc::clone(&room);
        tokio::spawn(async move {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    error!(room_id = %supervised.id, "room event loop panicked");
                }
            }
            supervised.alive.store(false, Ordering::SeqCst);
            supervised.lifetime.cancel();
            supervised.connection.set_should_stop(true);
            supervised.connection.teardown().await;
            supervised.monitor.unregister_room(&supervised.id, generation);
            info!(room_id = %supervised.id, "room closed");
        });

        room
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn languages(&self) -> (&str, &str) {
        (&self.from_language, &self.to_language)
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst) && !self.lifetime.is_cancelled()
    }

    pub fn connection(&self) -> &Arc<TranslationConnection> {
        &self.connection
    }

    pub fn register(&self, handle: ClientHandle) {
        if self.register_tx.send(handle).is_err() {
            warn!(room_id = %self.id, "register after room closed");
        }
    }

    pub fn unregister(&self, client_id: ClientId) {
        let _ = self.unregister_tx.send(client_id);
    }

    /// Queue a payload for every member. Waits while the room's broadcast
    /// queue is full.
    pub async fn broadcast(&self, payload: RoomPayload) {
        if self.broadcast_tx.send(payload).await.is_err() {
            debug!(room_id = %self.id, "broadcast after room closed");
        }
    }

    /// Drop every member and stop the backend connection. The room itself
    /// stays usable.
    pub fn force_close(&self) {
        let _ = self.close_tx.send(());
    }

    /// Members as of the last processed membership change.
    pub fn client_ids(&self) -> Vec<ClientId> {
        self.clients.borrow().clone()
    }

    pub fn subscribe_clients(&self) -> watch::Receiver<Vec<ClientId>> {
        self.clients.clone()
    }

    /// Buffer a client's audio and pass complete frames on to the backend.
    /// Audio from a client the loop has not registered yet is dropped.
    pub async fn forward_audio(&self, client_id: ClientId, data: &[u8]) {
        let ready = {
            let mut buffers = self.buffers.lock();
            match buffers.get_mut(&client_id) {
                Some(buffer) => buffer.push(data),
                None => {
                    trace!(room_id = %self.id, %client_id, "audio from unregistered client dropped");
                    return;
                }
            }
        };
        let Some(frame) = ready else {
            return;
        };

        match self.audio.to_backend(&frame) {
            Ok(pcm) if !pcm.is_empty() => self.connection.send_audio(pcm).await,
            Ok(_) => {}
            Err(e) => warn!(room_id = %self.id, "failed to resample client audio: {}", e),
        }
    }
}

struct EventLoop {
    room: Arc<Room>,
    members: HashMap<ClientId, ClientHandle>,
    clients_tx: watch::Sender<Vec<ClientId>>,
}

impl EventLoop {
    async fn run(mut self, mut inbox: Inbox) {
        let _task = self.room.monitor.start_task(&self.room.id, TaskKind::RoomEventLoop);
        let lifetime = self.room.lifetime.clone();

        loop {
            tokio::select! {
                biased;
                _ = lifetime.cancelled() => break,
                Some(handle) = inbox.register_rx.recv() => self.on_register(handle),
                Some(client_id) = inbox.unregister_rx.recv() => self.on_unregister(client_id).await,
                Some(()) = inbox.close_rx.recv() => self.on_force_close().await,
                Some(payload) = inbox.broadcast_rx.recv() => self.on_broadcast(payload).await,
                else => break,
            }
        }

        self.members.clear();
        self.publish_members();
        debug!(room_id = %self.room.id, "room event loop stopped");
    }

    fn on_register(&mut self, handle: ClientHandle) {
        let client_id = handle.id;
        self.members.insert(client_id, handle);
        self.room
            .buffers
            .lock()
            .insert(client_id, ClientAudioBuffer::new(&self.room.audio_config));
        self.publish_members();
        info!(room_id = %self.room.id, %client_id, clients = self.members.len(), "client joined");

        let connection = &self.room.connection;
        connection.set_should_stop(false);
        connection.renew_session();
        connection.ensure_started();
    }

    async fn on_unregister(&mut self, client_id: ClientId) {
        if self.remove(client_id) {
            info!(room_id = %self.room.id, %client_id, clients = self.members.len(), "client left");
            self.stop_if_empty().await;
        }
    }

    async fn on_force_close(&mut self) {
        warn!(room_id = %self.room.id, clients = self.members.len(), "room force-closed");
        self.members.clear();
        self.room.buffers.lock().clear();
        self.publish_members();
        self.room.connection.set_should_stop(true);
        self.room.connection.teardown().await;
    }

    async fn on_broadcast(&mut self, payload: RoomPayload) {
        let mut dropped = Vec::new();
        for (client_id, handle) in &self.members {
            match handle.try_deliver(payload.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!(room_id = %self.room.id, %client_id, "client queue full, dropping client");
                    dropped.push(*client_id);
                }
                Err(TrySendError::Closed(_)) => dropped.push(*client_id),
            }
        }

        if dropped.is_empty() {
            return;
        }
        for client_id in dropped {
            self.remove(client_id);
        }
        self.stop_if_empty().await;
    }

    fn remove(&mut self, client_id: ClientId) -> bool {
        if self.members.remove(&client_id).is_none() {
            return false;
        }
        self.room.buffers.lock().remove(&client_id);
        self.publish_members();
        true
    }

    async fn stop_if_empty(&self) {
        if !self.members.is_empty() {
            return;
        }
        info!(room_id = %self.room.id, "last client left, stopping translation");
        self.room.connection.set_should_stop(true);
        self.room.connection.teardown().await;
    }

    fn publish_members(&self) {
        let ids: Vec<ClientId> = self.members.keys().copied().collect();
        self.room.monitor.update_client_count(&self.room.id, ids.len());
        self.clients_tx.send_replace(ids);
    }
}
