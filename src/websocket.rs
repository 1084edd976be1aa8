//! # Room WebSocket Handler
//!
//! Browsers join a translation room through `GET /ws`:
//!
//! ```text
//! /ws?room_id=r1&from_language=en&to_language=es
//! ```
//!
//! ## WebSocket Protocol:
//! 1. **Join**: the query names the room and, for the first joiner, its
//!    language pair. A leading `/` on any parameter is ignored
//! 2. **Session gate**: the session cookie must name a known session (when enabled)
//! 3. **Audio**: binary frames are 16-bit mono PCM at the client rate and go to
//!    the room's translation backend
//! 4. **Results**: text frames are translated messages as JSON; binary frames
//!    are translated speech at the playback rate
//! 5. **Heartbeat**: the server pings every 30 s and drops clients silent for 60 s
//!
//! Text frames from the client carry no meaning and are ignored.
//!
//! ## Actor Model:
//! Each connection is one `ClientSession` actor. The room's event loop
//! delivers into the session's bounded queue, which the actor drains as a
//! stream. Audio from the browser goes through a small forwarding task so
//! frames reach the backend in order without blocking the actor.

use crate::error::AppError;
use crate::room::client::{client_channel, ClientHandle, ClientId, RoomPayload};
use crate::room::Room;
use crate::state::AppState;
use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

/// Audio frames a session may have in flight towards the backend.
const AUDIO_QUEUE_FRAMES: usize = 64;

#[derive(Debug, Default, Deserialize)]
pub struct JoinQuery {
    pub room_id: Option<String>,
    pub from_language: Option<String>,
    pub to_language: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinParams {
    pub room_id: String,
    pub from_language: String,
    pub to_language: String,
}

impl JoinQuery {
    pub fn into_params(self) -> Result<JoinParams, AppError> {
        Ok(JoinParams {
            room_id: required("room_id", self.room_id)?,
            from_language: required("from_language", self.from_language)?,
            to_language: required("to_language", self.to_language)?,
        })
    }
}

fn required(name: &str, value: Option<String>) -> Result<String, AppError> {
    let value = value.unwrap_or_default();
    let value = value.strip_prefix('/').unwrap_or(&value);
    if value.is_empty() {
        return Err(AppError::BadRequest(format!("missing query parameter: {}", name)));
    }
    Ok(value.to_string())
}

/// One browser attached to one room.
pub struct ClientSession {
    id: ClientId,
    room: Arc<Room>,
    state: web::Data<AppState>,

    /// Handed to the room when the actor starts
    handle: Option<ClientHandle>,
    inbox: Option<mpsc::Receiver<RoomPayload>>,

    audio_tx: Option<mpsc::Sender<Vec<u8>>>,

    last_heartbeat: Instant,
    heartbeat_interval: Duration,
    client_timeout: Duration,
}

impl ClientSession {
    pub fn new(room: Arc<Room>, state: web::Data<AppState>) -> Self {
        let server = &state.get_config().server;
        let (handle, inbox) = client_channel(server.client_queue_capacity);
        Self {
            id: handle.id,
            room,
            heartbeat_interval: Duration::from_secs(server.heartbeat_interval_secs),
            client_timeout: Duration::from_secs(server.client_timeout_secs),
            state,
            handle: Some(handle),
            inbox: Some(inbox),
            audio_tx: None,
            last_heartbeat: Instant::now(),
        }
    }

    fn start_audio_forwarder(&mut self) {
        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(AUDIO_QUEUE_FRAMES);
        let room = Arc::clone(&self.room);
        let client_id = self.id;
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                room.forward_audio(client_id, &frame).await;
            }
        });
        self.audio_tx = Some(tx);
    }

    fn on_audio(&mut self, data: &[u8], ctx: &mut ws::WebsocketContext<Self>) {
        let Some(tx) = &self.audio_tx else {
            return;
        };
        match tx.try_send(data.to_vec()) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!(room_id = %self.room.id(), client_id = %self.id, "audio queue full, frame dropped");
            }
            Err(TrySendError::Closed(_)) => ctx.stop(),
        }
    }
}

impl Actor for ClientSession {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        if let Some(handle) = self.handle.take() {
            self.room.register(handle);
        }
        if let Some(inbox) = self.inbox.take() {
            ctx.add_stream(ReceiverStream::new(inbox));
        }
        self.start_audio_forwarder();
        self.state.increment_active_sessions();

        ctx.run_interval(self.heartbeat_interval, |act, ctx| {
            if act.last_heartbeat.elapsed() > act.client_timeout {
                warn!(room_id = %act.room.id(), client_id = %act.id, "client heartbeat timed out");
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });

        info!(room_id = %self.room.id(), client_id = %self.id, "client connected");
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        self.audio_tx = None;
        self.room.unregister(self.id);
        self.state.decrement_active_sessions();
        info!(room_id = %self.room.id(), client_id = %self.id, "client disconnected");
    }
}

/// Payloads the room fans out. The stream ends when the room drops this
/// client, which closes the socket.
impl StreamHandler<RoomPayload> for ClientSession {
    fn handle(&mut self, payload: RoomPayload, ctx: &mut Self::Context) {
        match payload {
            RoomPayload::Text(json) => ctx.text(json.as_ref()),
            RoomPayload::Audio(pcm) => ctx.binary(pcm.to_vec()),
        }
    }

    fn finished(&mut self, ctx: &mut Self::Context) {
        debug!(room_id = %self.room.id(), client_id = %self.id, "room closed the client queue");
        ctx.close(None);
        ctx.stop();
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for ClientSession {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Binary(data)) => {
                self.last_heartbeat = Instant::now();
                self.on_audio(&data, ctx);
            }
            Ok(ws::Message::Text(_)) => {
                self.last_heartbeat = Instant::now();
                warn!(room_id = %self.room.id(), client_id = %self.id, "ignoring text frame from client");
            }
            Ok(ws::Message::Ping(data)) => {
                self.last_heartbeat = Instant::now();
                ctx.pong(&data);
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                debug!(room_id = %self.room.id(), client_id = %self.id, ?reason, "client closed");
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) | Ok(ws::Message::Nop) => {}
            Err(e) => {
                warn!(room_id = %self.room.id(), client_id = %self.id, "websocket protocol error: {}", e);
                ctx.stop();
            }
        }
    }
}

/// `GET /ws`: validate the join, check the session, then hand the socket to
/// a `ClientSession` bound to the room.
pub async fn room_websocket(
    req: HttpRequest,
    stream: web::Payload,
    query: web::Query<JoinQuery>,
    state: web::Data<AppState>,
) -> actix_web::Result<HttpResponse> {
    let params = query.into_inner().into_params()?;

    let cookie = req
        .cookie(&state.get_config().auth.cookie_name)
        .map(|c| c.value().to_string());
    state.gate.check(cookie.as_deref()).await.map_err(AppError::from)?;

    debug!(
        room_id = %params.room_id,
        peer = ?req.connection_info().peer_addr(),
        "websocket join request"
    );

    let room = state
        .registry
        .get_or_create(&params.room_id, &params.from_language, &params.to_language);
    let (from, to) = room.languages();
    if from != params.from_language || to != params.to_language {
        debug!(
            room_id = %params.room_id,
            requested_from = %params.from_language,
            requested_to = %params.to_language,
            "room keeps its existing language pair"
        );
    }

    ws::start(ClientSession::new(room, state), &req, stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::SessionGate;
    use crate::error::AuthError;
    use crate::state::tests::test_state;
    use actix_web::{test as actix_test, App};
    use async_trait::async_trait;

    fn query(room: &str, from: &str, to: &str) -> JoinQuery {
        JoinQuery {
            room_id: Some(room.to_string()),
            from_language: Some(from.to_string()),
            to_language: Some(to.to_string()),
        }
    }

    #[test]
    fn test_leading_slash_is_stripped() {
        let params = query("/r1", "/en", "/es").into_params().unwrap();
        assert_eq!(
            params,
            JoinParams {
                room_id: "r1".to_string(),
                from_language: "en".to_string(),
                to_language: "es".to_string(),
            }
        );
    }

    #[test]
    fn test_missing_parameters_are_rejected() {
        let mut q = query("r1", "en", "es");
        q.to_language = None;
        assert!(matches!(q.into_params(), Err(AppError::BadRequest(m)) if m.contains("to_language")));

        assert!(query("/", "en", "es").into_params().is_err());
        assert!(JoinQuery::default().into_params().is_err());
    }

    struct ClosedGate;

    #[async_trait]
    impl SessionGate for ClosedGate {
        async fn check(&self, _session_id: Option<&str>) -> Result<(), AuthError> {
            Err(AuthError::UnknownSession)
        }
    }

    #[actix_web::test]
    async fn test_join_without_room_is_bad_request() {
        let app = actix_test::init_service(
            App::new()
                .app_data(web::Data::new(test_state()))
                .route("/ws", web::get().to(room_websocket)),
        )
        .await;

        let req = actix_test::TestRequest::get().uri("/ws?from_language=en&to_language=es").to_request();
        assert_eq!(actix_test::call_service(&app, req).await.status(), 400);
    }

    #[actix_web::test]
    async fn test_unknown_session_is_unauthorized() {
        let mut state = test_state();
        state.gate = Arc::new(ClosedGate);
        let registry = Arc::clone(&state.registry);

        let app = actix_test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/ws", web::get().to(room_websocket)),
        )
        .await;

        let req = actix_test::TestRequest::get()
            .uri("/ws?room_id=r1&from_language=en&to_language=es")
            .to_request();
        assert_eq!(actix_test::call_service(&app, req).await.status(), 401);
        assert_eq!(registry.room_count(), 0);
    }
}
