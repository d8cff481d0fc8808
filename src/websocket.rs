//! # WebSocket Endpoints
//!
//! Two kinds of websocket connections terminate here:
//!
//! ## Media streams (`GET /voice/{role}/{session_id}`):
//! The telephony provider opens one per call leg. The `LegSocket` actor owns
//! the socket:
//! - inbound text frames are forwarded, untouched, to the leg's coordinator
//!   over an unbounded channel
//! - outbound frames arrive as `SendText` messages through `ActorLegSink`,
//!   the handle the call session keeps for the leg
//! - when the socket stops, the channel closes and the coordinator winds
//!   the leg down
//!
//! ## Transcript observers (`GET /transcriptions`):
//! Browser pages showing live transcripts. Each `TranscriptObserver`
//! subscribes to the transcript hub when it starts and unsubscribes when it
//! stops; it never expects anything from the page beyond pings.
//!
//! ## Rust Concepts:
//! Actors only process one message at a time, so neither actor needs a lock
//! around its own state. Other tasks reach an actor only through its `Addr`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::call::coordinator::serve_leg;
use crate::call::session::{LegRole, LegSink};
use crate::error::{AppError, BridgeError};
use crate::state::AppState;
use crate::transcript::{ObserverHandle, TranscriptHub};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

/// Write one text frame to the socket.
#[derive(Message)]
#[rtype(result = "()")]
struct SendText(String);

/// Close the socket.
#[derive(Message)]
#[rtype(result = "()")]
struct CloseSocket;

/// Send pings and stop the actor if the peer has gone quiet.
fn start_heartbeat<A>(ctx: &mut ws::WebsocketContext<A>, last_seen: fn(&A) -> Instant)
where
    A: Actor<Context = ws::WebsocketContext<A>>,
{
    ctx.run_interval(HEARTBEAT_INTERVAL, move |act, ctx| {
        if Instant::now().duration_since(last_seen(act)) > CLIENT_TIMEOUT {
            warn!("websocket heartbeat timeout, closing connection");
            ctx.stop();
            return;
        }
        ctx.ping(b"");
    });
}

/// Actor owning one telephony leg's media socket.
pub struct LegSocket {
    session_id: Uuid,
    role: LegRole,
    frames: Option<UnboundedSender<String>>,
    last_seen: Instant,
}

impl LegSocket {
    pub fn new(session_id: Uuid, role: LegRole, frames: UnboundedSender<String>) -> Self {
        Self {
            session_id,
            role,
            frames: Some(frames),
            last_seen: Instant::now(),
        }
    }

    fn forward(&mut self, text: String, ctx: &mut ws::WebsocketContext<Self>) {
        let delivered = self
            .frames
            .as_ref()
            .map(|frames| frames.send(text).is_ok())
            .unwrap_or(false);
        if !delivered {
            debug!(session_id = %self.session_id, role = %self.role, "leg coordinator gone, closing socket");
            ctx.stop();
        }
    }
}

impl Actor for LegSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(session_id = %self.session_id, role = %self.role, "media stream connected");
        start_heartbeat(ctx, |act: &Self| act.last_seen);
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        // Dropping the sender is what tells the coordinator the leg is gone
        self.frames.take();
        info!(session_id = %self.session_id, role = %self.role, "media stream closed");
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for LegSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        self.last_seen = Instant::now();
        match msg {
            Ok(ws::Message::Text(text)) => self.forward(text.to_string(), ctx),
            Ok(ws::Message::Binary(bytes)) => match String::from_utf8(bytes.to_vec()) {
                Ok(text) => self.forward(text, ctx),
                Err(_) => warn!(session_id = %self.session_id, role = %self.role, "ignoring non-UTF-8 binary frame"),
            },
            Ok(ws::Message::Ping(data)) => ctx.pong(&data),
            Ok(ws::Message::Pong(_)) => {}
            Ok(ws::Message::Close(reason)) => {
                debug!(session_id = %self.session_id, role = %self.role, ?reason, "close frame received");
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) | Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!(session_id = %self.session_id, role = %self.role, "websocket protocol error: {}", err);
                ctx.stop();
            }
        }
    }
}

impl Handler<SendText> for LegSocket {
    type Result = ();

    fn handle(&mut self, msg: SendText, ctx: &mut Self::Context) {
        ctx.text(msg.0);
    }
}

impl Handler<CloseSocket> for LegSocket {
    type Result = ();

    fn handle(&mut self, _msg: CloseSocket, ctx: &mut Self::Context) {
        ctx.close(Some(ws::CloseCode::Normal.into()));
        ctx.stop();
    }
}

/// The session's handle on a `LegSocket`.
///
/// `do_send` queues regardless of mailbox capacity, so a burst of outbound
/// audio blocks never blocks the bridge.
pub struct ActorLegSink {
    addr: Addr<LegSocket>,
}

impl ActorLegSink {
    pub fn new(addr: Addr<LegSocket>) -> Self {
        Self { addr }
    }
}

impl LegSink for ActorLegSink {
    fn send_text(&self, text: String) -> Result<(), BridgeError> {
        if !self.addr.connected() {
            return Err(BridgeError::TransportClosed("leg socket closed".to_string()));
        }
        self.addr.do_send(SendText(text));
        Ok(())
    }

    fn close(&self) {
        if self.addr.connected() {
            self.addr.do_send(CloseSocket);
        }
    }
}

/// Media stream endpoint for one leg of a session.
///
/// ## Responses:
/// - `400` for an unknown role
/// - `404` for an unknown session
/// - `409` when the leg is already attached or the session is ending
pub async fn media_stream(
    req: HttpRequest,
    stream: web::Payload,
    path: web::Path<(String, String)>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    let (role, session_id) = path.into_inner();
    let role: LegRole = role.parse().map_err(AppError::BadRequest)?;
    let session = state.sessions.find(&session_id)?;

    if session.is_completed() {
        return Err(AppError::Conflict(format!("session {session_id} is ending")));
    }
    if session.is_attached(role) {
        return Err(AppError::Conflict(format!("{role} leg is already attached")));
    }

    let (frames_tx, frames_rx) = tokio::sync::mpsc::unbounded_channel();
    let socket = LegSocket::new(session.id(), role, frames_tx);
    let (addr, response) = ws::WsResponseBuilder::new(socket, &req, stream)
        .start_with_addr()
        .map_err(|e| AppError::BadRequest(format!("websocket handshake: {e}")))?;

    if let Err(e) = session.attach_leg(role, Arc::new(ActorLegSink::new(addr.clone()))) {
        // Lost a race with another socket for the same leg
        warn!(session_id = %session.id(), role = %role, "{}", e);
        addr.do_send(CloseSocket);
        return Ok(response);
    }

    tokio::spawn(serve_leg(state.into_inner(), session, role, frames_rx));
    Ok(response)
}

/// Actor for one transcript observer page.
pub struct TranscriptObserver {
    hub: Arc<TranscriptHub>,
    subscription: Option<Uuid>,
    last_seen: Instant,
}

impl TranscriptObserver {
    pub fn new(hub: Arc<TranscriptHub>) -> Self {
        Self {
            hub,
            subscription: None,
            last_seen: Instant::now(),
        }
    }
}

struct ObserverAddr(Addr<TranscriptObserver>);

impl ObserverHandle for ObserverAddr {
    fn deliver(&self, message: &str) -> bool {
        if !self.0.connected() {
            return false;
        }
        self.0.do_send(SendText(message.to_string()));
        true
    }
}

impl Actor for TranscriptObserver {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        let id = self.hub.subscribe(Arc::new(ObserverAddr(ctx.address())));
        self.subscription = Some(id);
        start_heartbeat(ctx, |act: &Self| act.last_seen);
        info!(observer_id = %id, "transcript observer connected");
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        if let Some(id) = self.subscription.take() {
            self.hub.unsubscribe(&id);
            info!(observer_id = %id, "transcript observer disconnected");
        }
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for TranscriptObserver {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        self.last_seen = Instant::now();
        match msg {
            Ok(ws::Message::Ping(data)) => ctx.pong(&data),
            Ok(ws::Message::Close(reason)) => {
                ctx.close(reason);
                ctx.stop();
            }
            Ok(_) => {}
            Err(err) => {
                warn!("transcript observer protocol error: {}", err);
                ctx.stop();
            }
        }
    }
}

impl Handler<SendText> for TranscriptObserver {
    type Result = ();

    fn handle(&mut self, msg: SendText, ctx: &mut Self::Context) {
        ctx.text(msg.0);
    }
}

/// Live transcript feed for observer pages.
pub async fn transcription_stream(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    ws::start(TranscriptObserver::new(Arc::clone(&state.transcripts)), &req, stream)
        .map_err(|e| AppError::BadRequest(format!("websocket handshake: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use actix_web::{http::StatusCode, test, App};

    struct Silent;

    impl LegSink for Silent {
        fn send_text(&self, _text: String) -> Result<(), BridgeError> {
            Ok(())
        }
    }

    fn app_state() -> web::Data<AppState> {
        let mut config = AppConfig::default();
        config.pool.workers = 1;
        web::Data::new(AppState::new(config).unwrap())
    }

    #[actix_web::test]
    async fn test_media_stream_rejects_before_upgrade() {
        let state = app_state();
        let session = state.sessions.create("+1555", "+1666").unwrap();
        session.attach_leg(LegRole::Client, Arc::new(Silent)).unwrap();

        let app = test::init_service(
            App::new()
                .app_data(state.clone())
                .route("/voice/{role}/{session_id}", web::get().to(media_stream)),
        )
        .await;

        let unknown_session = test::TestRequest::get()
            .uri(&format!("/voice/client/{}", Uuid::new_v4()))
            .to_request();
        assert_eq!(test::call_service(&app, unknown_session).await.status(), StatusCode::NOT_FOUND);

        let bad_role = test::TestRequest::get()
            .uri(&format!("/voice/listener/{}", session.id()))
            .to_request();
        assert_eq!(test::call_service(&app, bad_role).await.status(), StatusCode::BAD_REQUEST);

        let duplicate = test::TestRequest::get()
            .uri(&format!("/voice/client/{}", session.id()))
            .to_request();
        assert_eq!(test::call_service(&app, duplicate).await.status(), StatusCode::CONFLICT);

        // Not a websocket upgrade request
        let plain = test::TestRequest::get()
            .uri(&format!("/voice/operator/{}", session.id()))
            .to_request();
        assert_eq!(test::call_service(&app, plain).await.status(), StatusCode::BAD_REQUEST);
        assert!(!session.is_attached(LegRole::Operator));
    }
}
