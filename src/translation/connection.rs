//! # Translation Connection
//!
//! One streaming WebSocket connection to the translation backend per room,
//! alive exactly while the room has clients.
//!
//! ## State machine:
//! ```text
//! Disconnected → Connecting → Connected → (Error | Closed) → Reconnecting → Connecting → ...
//!                    ↑   │                                        │
//!                    └───┘ connect failed (wait, retry)           └─ Stopped when the room
//!                                                                     emptied, the session was
//!                                                                     cancelled, or the backend
//!                                                                     closed with 4001
//! ```
//!
//! ## Concurrency:
//! - **Start guard**: a `reconnecting` flag makes concurrent start requests no-ops
//! - **Sink mutex**: the write half of the socket sits behind a tokio mutex,
//!   held across the send so audio frames and the `END` sentinel never interleave
//! - **Session token**: every task of the current occupancy (reader, reconnect
//!   waiter, reverse runs) watches one `CancellationToken`; teardown cancels it
//!
//! The reader task owns the read half and the transcript assembler. Text frames
//! are assembled and stored, audio frames are resampled for playback, and both
//! are published to the room's broadcast queue.

use crate::audio::processor::AudioProcessor;
use crate::config::TranslationConfig;
use crate::error::ConnectError;
use crate::message::UnsupportedLanguageNotice;
use crate::monitor::{Monitor, TaskKind};
use crate::room::client::RoomPayload;
use crate::store::{upsert_message, MessageStore};
use crate::translation::assembler::{Assembled, AssemblyAction, TranscriptAssembler};
use crate::translation::protocol::{
    backend_url, decode_frame, sign_token, BackendFrame, TranscriptFragment, END_OF_STREAM,
    UNSUPPORTED_LANGUAGE_CLOSE,
};
use crate::translation::reverse::{ReverseContext, ReverseOutcome};
use chrono::Utc;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

type BackendSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type BackendSink = SplitSink<BackendSocket, Message>;
type BackendStream = SplitStream<BackendSocket>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
    Closed,
    Reconnecting,
    Stopped,
}

/// Why the reader stopped.
#[derive(Debug)]
enum StreamEnd {
    Closed(Option<u16>),
    Error(String),
    Eof,
}

/// Everything a connection needs from its room.
pub struct ConnectionParts {
    pub room_id: String,
    pub from_language: String,
    pub to_language: String,
    pub config: TranslationConfig,
    pub monitor: Arc<Monitor>,
    pub store: Arc<dyn MessageStore>,
    pub write_lock: Arc<Mutex<()>>,
    pub reverse: Arc<ReverseContext>,
    pub audio: Arc<AudioProcessor>,
    pub broadcast: mpsc::Sender<RoomPayload>,
    /// Parent of every session token; cancelled when the room goes away
    pub lifetime: CancellationToken,
}

pub struct TranslationConnection {
    parts: ConnectionParts,
    sink: Mutex<Option<BackendSink>>,
    reconnecting: parking_lot::Mutex<bool>,
    should_stop: AtomicBool,
    session: parking_lot::Mutex<CancellationToken>,
    state: watch::Sender<ConnectionState>,
}

/// Holds the start flag; releasing it on drop covers every exit path.
struct StartGuard<'a>(&'a parking_lot::Mutex<bool>);

impl<'a> StartGuard<'a> {
    fn acquire(flag: &'a parking_lot::Mutex<bool>) -> Option<Self> {
        let mut starting = flag.lock();
        if *starting {
            return None;
        }
        *starting = true;
        Some(Self(flag))
    }
}

impl Drop for StartGuard<'_> {
    fn drop(&mut self) {
        *self.0.lock() = false;
    }
}

impl TranslationConnection {
    pub fn new(parts: ConnectionParts) -> Arc<Self> {
        let session = parts.lifetime.child_token();
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Arc::new(Self {
            parts,
            sink: Mutex::new(None),
            reconnecting: parking_lot::Mutex::new(false),
            should_stop: AtomicBool::new(false),
            session: parking_lot::Mutex::new(session),
            state,
        })
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub async fn is_connected(&self) -> bool {
        self.sink.lock().await.is_some()
    }

    pub fn should_stop(&self) -> bool {
        self.should_stop.load(Ordering::SeqCst)
    }

    pub fn set_should_stop(&self, stop: bool) {
        self.should_stop.store(stop, Ordering::SeqCst);
    }

    /// Token shared by the tasks of the current occupancy.
    pub fn session(&self) -> CancellationToken {
        self.session.lock().clone()
    }

    /// Mint a new session after a teardown cancelled the previous one.
    pub fn renew_session(&self) {
        let mut session = self.session.lock();
        if session.is_cancelled() && !self.parts.lifetime.is_cancelled() {
            *session = self.parts.lifetime.child_token();
            debug!(room_id = %self.parts.room_id, "translation session renewed");
        }
    }

    /// Start connecting unless a start is already running or a socket is up.
    pub fn ensure_started(self: &Arc<Self>) {
        if *self.reconnecting.lock() || self.state() == ConnectionState::Connected {
            return;
        }
        tokio::spawn(Arc::clone(self).connect_loop());
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(room_id = %self.parts.room_id, ?previous, ?state, "translation connection state");
        }
    }

    async fn open(&self, session: &CancellationToken) -> Result<BackendSocket, ConnectError> {
        let config = &self.parts.config;
        let token = sign_token(config, Utc::now())?;
        let url = backend_url(config, &token, &self.parts.from_language, &self.parts.to_language)?;
        tokio::select! {
            biased;
            _ = session.cancelled() => Err(ConnectError::Cancelled),
            result = connect_async(url.as_str()) => {
                let (socket, _response) = result?;
                Ok(socket)
            }
        }
    }

    /// Connect, retrying until it works or the session ends, then hand the
    /// read half to a reader task.
    async fn connect_loop(self: Arc<Self>) {
        let Some(_starting) = StartGuard::acquire(&self.reconnecting) else {
            debug!(room_id = %self.parts.room_id, "connection start already in progress");
            return;
        };
        let _task = self.parts.monitor.start_task(&self.parts.room_id, TaskKind::ConnectionStarter);

        if self.sink.lock().await.is_some() {
            return;
        }

        let room_id = self.parts.room_id.clone();

        loop {
            // re-read every round: a rejoin may have renewed the session
            // while this loop was waiting
            let session = self.session();
            if self.should_stop() || session.is_cancelled() {
                self.set_state(ConnectionState::Stopped);
                return;
            }
            self.set_state(ConnectionState::Connecting);

            match self.open(&session).await {
                Ok(socket) => {
                    let (mut sink, stream) = socket.split();
                    let mut slot = self.sink.lock().await;
                    if session.is_cancelled() || self.should_stop() {
                        drop(slot);
                        let _ = sink.close().await;
                        continue;
                    }
                    *slot = Some(sink);
                    drop(slot);

                    self.parts.monitor.update_connection(
                        &room_id,
                        true,
                        &self.parts.from_language,
                        &self.parts.to_language,
                    );
                    self.set_state(ConnectionState::Connected);
                    info!(
                        room_id = %room_id,
                        from = %self.parts.from_language,
                        to = %self.parts.to_language,
                        "translation backend connected"
                    );

                    tokio::spawn(Arc::clone(&self).read_loop(stream, session));
                    return;
                }
                Err(ConnectError::Cancelled) => continue,
                Err(e) => {
                    let retry = self.parts.config.connect_retry();
                    warn!(room_id = %room_id, "backend connection failed: {}, retrying in {:?}", e, retry);
                    self.parts.monitor.record_reconnect(&room_id);
                    self.set_state(ConnectionState::Reconnecting);

                    tokio::select! {
                        biased;
                        _ = session.cancelled() => {}
                        _ = tokio::time::sleep(retry) => {}
                    }
                }
            }
        }
    }

    async fn read_loop(self: Arc<Self>, mut stream: BackendStream, session: CancellationToken) {
        let _task = self.parts.monitor.start_task(&self.parts.room_id, TaskKind::TranslationReader);
        let mut assembler = TranscriptAssembler::new();

        let end = loop {
            let next = tokio::select! {
                biased;
                _ = session.cancelled() => return,
                next = stream.next() => next,
            };

            let message = match next {
                Some(Ok(message)) => message,
                Some(Err(e)) => break StreamEnd::Error(e.to_string()),
                None => break StreamEnd::Eof,
            };

            match &message {
                Message::Text(_) => self.parts.monitor.record_message(&self.parts.room_id, false),
                Message::Binary(_) => self.parts.monitor.record_message(&self.parts.room_id, true),
                _ => {}
            }

            match decode_frame(message) {
                Ok(BackendFrame::Fragment(fragment)) => {
                    self.handle_fragment(&mut assembler, fragment, &session).await
                }
                Ok(BackendFrame::Audio(data)) => self.handle_audio(&data).await,
                Ok(BackendFrame::Closed(code)) => break StreamEnd::Closed(code),
                Ok(BackendFrame::Keepalive) => {}
                Err(e) => warn!(room_id = %self.parts.room_id, "dropping backend frame: {}", e),
            }
        };

        self.on_stream_end(end, session).await;
    }

    async fn handle_fragment(
        &self,
        assembler: &mut TranscriptAssembler,
        fragment: TranscriptFragment,
        session: &CancellationToken,
    ) {
        let Assembled { message, action } = assembler.ingest(fragment, Utc::now());
        trace!(room_id = %self.parts.room_id, id = %message.id, ?action, "fragment assembled");

        match message.to_json() {
            Ok(json) => self.publish(RoomPayload::text(json)).await,
            Err(e) => {
                warn!(room_id = %self.parts.room_id, "failed to encode message: {}", e);
                return;
            }
        }

        if action == AssemblyAction::BroadcastOnly {
            return;
        }

        let stored = {
            let _write = self.parts.write_lock.lock().await;
            // teardown may have cleared the history while this waited
            if session.is_cancelled() {
                debug!(room_id = %self.parts.room_id, id = %message.id, "session ended, message not stored");
                return;
            }
            upsert_message(self.parts.store.as_ref(), &self.parts.room_id, &message).await
        };

        match stored {
            Ok(outcome) => {
                debug!(room_id = %self.parts.room_id, id = %message.id, ?outcome, "message stored");
                if action == AssemblyAction::UpsertFinal {
                    self.spawn_reverse(message.id, session.clone());
                }
            }
            Err(e) => warn!(room_id = %self.parts.room_id, id = %message.id, "failed to store message: {}", e),
        }
    }

    fn spawn_reverse(&self, message_id: String, session: CancellationToken) {
        let reverse = Arc::clone(&self.parts.reverse);
        let monitor = Arc::clone(&self.parts.monitor);
        let broadcast = self.parts.broadcast.clone();
        let room_id = self.parts.room_id.clone();

        tokio::spawn(async move {
            let _task = monitor.start_task(&room_id, TaskKind::ReverseTranslation);
            if let ReverseOutcome::Updated(message) = reverse.run(&message_id, &session).await {
                match message.to_json() {
                    Ok(json) => {
                        let _ = broadcast.send(RoomPayload::text(json)).await;
                    }
                    Err(e) => warn!(room_id = %room_id, "failed to encode reverse translation: {}", e),
                }
            }
        });
    }

    async fn handle_audio(&self, frame: &[u8]) {
        match self.parts.audio.from_backend(frame) {
            Ok(Some(pcm)) if !pcm.is_empty() => self.publish(RoomPayload::audio(pcm)).await,
            Ok(Some(_)) => {}
            Ok(None) => debug!(room_id = %self.parts.room_id, len = frame.len(), "skipping header-only audio frame"),
            Err(e) => warn!(room_id = %self.parts.room_id, "failed to resample backend audio: {}", e),
        }
    }

    async fn publish(&self, payload: RoomPayload) {
        if self.parts.broadcast.send(payload).await.is_err() {
            debug!(room_id = %self.parts.room_id, "room event loop is gone, payload dropped");
        }
    }

    async fn on_stream_end(self: Arc<Self>, end: StreamEnd, session: CancellationToken) {
        // teardown already cleaned up
        if session.is_cancelled() {
            return;
        }

        let room_id = self.parts.room_id.clone();
        if let Some(mut sink) = self.sink.lock().await.take() {
            let _ = sink.close().await;
        }
        self.parts.monitor.update_connection(
            &room_id,
            false,
            &self.parts.from_language,
            &self.parts.to_language,
        );

        match end {
            StreamEnd::Closed(Some(UNSUPPORTED_LANGUAGE_CLOSE)) => {
                warn!(
                    room_id = %room_id,
                    from = %self.parts.from_language,
                    to = %self.parts.to_language,
                    "backend rejected the language pair"
                );
                let notice = UnsupportedLanguageNotice::new(
                    &room_id,
                    &self.parts.from_language,
                    &self.parts.to_language,
                );
                match serde_json::to_string(&notice) {
                    Ok(json) => self.publish(RoomPayload::text(json)).await,
                    Err(e) => warn!(room_id = %room_id, "failed to encode notice: {}", e),
                }
                self.set_state(ConnectionState::Stopped);
                return;
            }
            StreamEnd::Closed(code) => {
                info!(room_id = %room_id, ?code, "backend closed the stream");
                self.set_state(ConnectionState::Closed);
            }
            StreamEnd::Eof => {
                info!(room_id = %room_id, "backend stream ended");
                self.set_state(ConnectionState::Closed);
            }
            StreamEnd::Error(e) => {
                warn!(room_id = %room_id, "backend read failed: {}", e);
                self.set_state(ConnectionState::Error);
            }
        }

        if self.should_stop() {
            self.set_state(ConnectionState::Stopped);
            return;
        }

        let connection = Arc::clone(&self);
        tokio::spawn(async move {
            let _task = connection.parts.monitor.start_task(&room_id, TaskKind::Reconnect);
            let delay = connection.parts.config.reconnect_delay();
            tokio::select! {
                biased;
                _ = session.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            if connection.should_stop() || session.is_cancelled() {
                return;
            }
            info!(room_id = %room_id, "reconnecting to translation backend");
            connection.ensure_started();
        });
    }

    /// Write one frame of backend-rate PCM. Dropped when no socket is up.
    pub async fn send_audio(&self, pcm: Vec<u8>) {
        let mut slot = self.sink.lock().await;
        match slot.as_mut() {
            Some(sink) => {
                if let Err(e) = sink.send(Message::Binary(pcm)).await {
                    warn!(room_id = %self.parts.room_id, "failed to send audio to backend: {}", e);
                }
            }
            None => trace!(room_id = %self.parts.room_id, "no backend socket, audio dropped"),
        }
    }

    /// Stop every session task, say goodbye to the backend and clear the
    /// room's history. Safe to call repeatedly.
    pub async fn teardown(&self) {
        self.session.lock().cancel();
        self.parts.monitor.update_connection(
            &self.parts.room_id,
            false,
            &self.parts.from_language,
            &self.parts.to_language,
        );

        let sink = self.sink.lock().await.take();
        if let Some(mut sink) = sink {
            if let Err(e) = sink.send(Message::Binary(END_OF_STREAM.to_vec())).await {
                debug!(room_id = %self.parts.room_id, "could not send end of stream: {}", e);
            }
            let _ = sink.close().await;
            info!(room_id = %self.parts.room_id, "translation backend disconnected");
        }
        self.set_state(ConnectionState::Stopped);

        {
            let _write = self.parts.write_lock.lock().await;
            if let Err(e) = self.parts.store.delete_all(&self.parts.room_id).await {
                warn!(room_id = %self.parts.room_id, "failed to clear room history: {}", e);
            }
        }
        self.parts.audio.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::store::{MemoryMessageStore, MessageStore};
    use crate::test_support::{fake_backend, next_peer, test_config, FixedTranslator};
    use crate::translation::reverse::RetryPolicy;
    use std::time::Duration;
    use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
    use tokio_tungstenite::tungstenite::protocol::CloseFrame;

    struct Harness {
        connection: Arc<TranslationConnection>,
        payloads: mpsc::Receiver<RoomPayload>,
        store: Arc<MemoryMessageStore>,
        monitor: Arc<Monitor>,
    }

    fn harness(config: AppConfig) -> Harness {
        let store = Arc::new(MemoryMessageStore::new());
        harness_over(config, store.clone(), store)
    }

    /// `store` is what the connection writes through; `memory` is where the
    /// entries end up.
    fn harness_over(
        config: AppConfig,
        memory: Arc<MemoryMessageStore>,
        store: Arc<dyn MessageStore>,
    ) -> Harness {
        let monitor = Monitor::new();
        monitor.register_room("r1", "translation");
        let (broadcast, payloads) = mpsc::channel(64);
        let write_lock = Arc::new(Mutex::new(()));

        let reverse = Arc::new(ReverseContext {
            room_id: "r1".to_string(),
            from_language: "en".to_string(),
            to_language: "es".to_string(),
            context_window: config.reverse.context_window,
            policy: RetryPolicy::from(&config.reverse),
            store: Arc::clone(&store),
            translator: Arc::new(FixedTranslator("Hola")),
            queue_lock: Arc::new(Mutex::new(())),
            write_lock: write_lock.clone(),
        });

        let connection = TranslationConnection::new(ConnectionParts {
            room_id: "r1".to_string(),
            from_language: "en".to_string(),
            to_language: "es".to_string(),
            config: config.translation.clone(),
            monitor: monitor.clone(),
            store,
            write_lock,
            reverse,
            audio: Arc::new(AudioProcessor::new(&config.audio)),
            broadcast,
            lifetime: CancellationToken::new(),
        });

        Harness { connection, payloads, store: memory, monitor }
    }

    /// Delays every history read, keeping an upsert in flight.
    struct SlowStore {
        inner: Arc<MemoryMessageStore>,
        delay: Duration,
    }

    #[async_trait::async_trait]
    impl MessageStore for SlowStore {
        async fn append(&self, room_id: &str, entry: String) -> Result<(), crate::error::StoreError> {
            self.inner.append(room_id, entry).await
        }

        async fn read_all(&self, room_id: &str) -> Result<Vec<String>, crate::error::StoreError> {
            tokio::time::sleep(self.delay).await;
            self.inner.read_all(room_id).await
        }

        async fn replace_at(
            &self,
            room_id: &str,
            index: usize,
            entry: String,
        ) -> Result<(), crate::error::StoreError> {
            self.inner.replace_at(room_id, index, entry).await
        }

        async fn delete_all(&self, room_id: &str) -> Result<(), crate::error::StoreError> {
            self.inner.delete_all(room_id).await
        }
    }

    async fn wait_for_state(connection: &TranslationConnection, want: ConnectionState) {
        let mut rx = connection.subscribe();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| *s == want))
            .await
            .expect("state never reached")
            .unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_starts_open_one_socket() {
        let (url, mut peers) = fake_backend().await;
        let h = harness(test_config(&url));

        h.connection.ensure_started();
        h.connection.ensure_started();
        h.connection.ensure_started();

        let _peer = next_peer(&mut peers).await;
        wait_for_state(&h.connection, ConnectionState::Connected).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(peers.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_connect_retries_until_backend_appears() {
        // reserve a port, then release it so the first attempts fail
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let h = harness(test_config(&format!("ws://{}/translate", addr)));
        h.connection.ensure_started();
        wait_for_state(&h.connection, ConnectionState::Reconnecting).await;

        let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let _ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        wait_for_state(&h.connection, ConnectionState::Connected).await;
        let status = h.monitor.room_status("r1").unwrap();
        assert!(status.connection.reconnect_count >= 1);
        assert!(status.connection.connected);
    }

    #[tokio::test]
    async fn test_teardown_sends_end_and_clears_history() {
        let (url, mut peers) = fake_backend().await;
        let h = harness(test_config(&url));
        h.store.append("r1", "{}".to_string()).await.unwrap();

        h.connection.ensure_started();
        let mut peer = next_peer(&mut peers).await;
        wait_for_state(&h.connection, ConnectionState::Connected).await;

        h.connection.teardown().await;
        h.connection.teardown().await;

        let frame = tokio::time::timeout(Duration::from_secs(5), peer.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(frame, Message::Binary(b"END".to_vec()));
        assert_eq!(h.connection.state(), ConnectionState::Stopped);
        assert!(!h.connection.is_connected().await);
        assert!(h.store.read_all("r1").await.unwrap().is_empty());
        assert!(h.connection.session().is_cancelled());

        h.connection.renew_session();
        assert!(!h.connection.session().is_cancelled());
    }

    #[tokio::test]
    async fn test_unsupported_language_stops_without_reconnect() {
        let (url, mut peers) = fake_backend().await;
        let mut h = harness(test_config(&url));

        h.connection.ensure_started();
        let mut peer = next_peer(&mut peers).await;
        peer.close(Some(CloseFrame {
            code: CloseCode::from(UNSUPPORTED_LANGUAGE_CLOSE),
            reason: "unsupported language".into(),
        }))
        .await
        .unwrap();

        let payload = tokio::time::timeout(Duration::from_secs(5), h.payloads.recv())
            .await
            .unwrap()
            .unwrap();
        let RoomPayload::Text(json) = payload else {
            panic!("expected notice");
        };
        let notice: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(notice["type"], "language_unsupported");
        assert_eq!(notice["from_language"], "en");

        wait_for_state(&h.connection, ConnectionState::Stopped).await;
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(peers.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_reconnects_after_backend_drop() {
        let (url, mut peers) = fake_backend().await;
        let h = harness(test_config(&url));

        h.connection.ensure_started();
        let mut first = next_peer(&mut peers).await;
        first.close(None).await.unwrap();
        drop(first);

        let _second = next_peer(&mut peers).await;
        wait_for_state(&h.connection, ConnectionState::Connected).await;
    }

    #[tokio::test]
    async fn test_should_stop_prevents_reconnect() {
        let (url, mut peers) = fake_backend().await;
        let h = harness(test_config(&url));

        h.connection.ensure_started();
        let mut first = next_peer(&mut peers).await;
        wait_for_state(&h.connection, ConnectionState::Connected).await;

        h.connection.set_should_stop(true);
        first.close(None).await.unwrap();

        wait_for_state(&h.connection, ConnectionState::Stopped).await;
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(peers.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_backend_audio_is_relayed_at_playback_rate() {
        let (url, mut peers) = fake_backend().await;
        let mut h = harness(test_config(&url));

        h.connection.ensure_started();
        let mut peer = next_peer(&mut peers).await;

        peer.send(Message::Binary(vec![0u8; 10])).await.unwrap();
        peer.send(Message::Binary(vec![0u8; 20 + 480 * 2])).await.unwrap();

        let payload = tokio::time::timeout(Duration::from_secs(5), h.payloads.recv())
            .await
            .unwrap()
            .unwrap();
        match payload {
            RoomPayload::Audio(pcm) => assert_eq!(pcm.len(), 960 * 2),
            other => panic!("expected audio, got {:?}", other),
        }

        wait_for_state(&h.connection, ConnectionState::Connected).await;
        let status = h.monitor.room_status("r1").unwrap();
        assert_eq!(status.connection.audio_packet_count, 2);
    }

    #[tokio::test]
    async fn test_client_audio_reaches_backend() {
        let (url, mut peers) = fake_backend().await;
        let h = harness(test_config(&url));

        // dropped: nothing connected yet
        h.connection.send_audio(vec![9, 9]).await;

        h.connection.ensure_started();
        let mut peer = next_peer(&mut peers).await;
        wait_for_state(&h.connection, ConnectionState::Connected).await;

        h.connection.send_audio(vec![1, 2, 3, 4]).await;
        let frame = tokio::time::timeout(Duration::from_secs(5), peer.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(frame, Message::Binary(vec![1, 2, 3, 4]));
    }

    #[tokio::test]
    async fn test_teardown_clears_history_written_concurrently() {
        let (url, mut peers) = fake_backend().await;
        let memory = Arc::new(MemoryMessageStore::new());
        let slow = Arc::new(SlowStore {
            inner: memory.clone(),
            delay: Duration::from_millis(300),
        });
        let mut h = harness_over(test_config(&url), memory.clone(), slow);

        h.connection.ensure_started();
        let mut peer = next_peer(&mut peers).await;
        wait_for_state(&h.connection, ConnectionState::Connected).await;

        peer.send(Message::Text(r#"{"translation":"Done.","part_finished":true,"language":"en"}"#.into()))
            .await
            .unwrap();

        // the live broadcast goes out first, then the store write starts
        tokio::time::timeout(Duration::from_secs(5), h.payloads.recv())
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        h.connection.teardown().await;
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(memory.read_all("r1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_write_after_teardown_is_skipped() {
        let (url, mut peers) = fake_backend().await;
        let h = harness(test_config(&url));

        h.connection.ensure_started();
        let _peer = next_peer(&mut peers).await;
        wait_for_state(&h.connection, ConnectionState::Connected).await;

        let session = h.connection.session();
        h.connection.teardown().await;

        let mut assembler = TranscriptAssembler::new();
        let fragment = TranscriptFragment {
            translation: "Late.".to_string(),
            part_finished: true,
            language: "en".to_string(),
        };
        h.connection.handle_fragment(&mut assembler, fragment, &session).await;
        assert!(h.store.read_all("r1").await.unwrap().is_empty());
    }
}
