//! # Voice WebSocket Gateway
//!
//! One actor per connection on `/ws`. Each connection owns exactly one voice session,
//! created when the upgrade succeeds and removed when the actor stops.
//!
//! ## WebSocket Protocol:
//! - **Client → Server, text**: JSON control messages (`start`, `stop`, `reset`, `interrupt`)
//! - **Client → Server, binary**: audio frames (8-byte little-endian header + 16-bit PCM)
//! - **Server → Client, text**: JSON events, each carrying the `session_id`
//! - **Server → Client, binary**: raw 16-bit PCM of synthesized speech
//!
//! ## Key Rust Concepts:
//! - **Actor model**: The actor only translates between WebSocket messages and the session;
//!   all turn logic runs in the session's pipeline task
//! - **Two StreamHandlers**: One for incoming WebSocket messages, one for the session's
//!   outbound queue (attached with `ctx.add_stream`)
//! - **Non-blocking handlers**: Nothing here awaits; control and audio are queued with
//!   unbounded sends and `try_send`

use crate::adapters::Providers;
use crate::error::AppError;
use crate::pipeline::{parse_control, Outbound, OutboundReceiver, ServerEvent};
use crate::session::SessionHandle;
use crate::state::AppState;

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// WebSocket actor bridging one connection to one voice session.
pub struct VoiceWebSocket {
    session: Arc<SessionHandle>,
    state: web::Data<AppState>,

    /// Taken in `started` and attached to the actor context
    outbound: Option<OutboundReceiver>,

    last_heartbeat: Instant,
    ping_interval: Duration,
    client_timeout: Duration,
}

impl VoiceWebSocket {
    pub fn new(
        session: Arc<SessionHandle>,
        outbound: OutboundReceiver,
        state: web::Data<AppState>,
    ) -> Self {
        let config = state.get_config();
        Self {
            session,
            state,
            outbound: Some(outbound),
            last_heartbeat: Instant::now(),
            ping_interval: Duration::from_secs(config.websocket.ping_interval_secs),
            client_timeout: Duration::from_secs(config.websocket.client_timeout_secs),
        }
    }

    /// Ping the client periodically and drop it if it stops answering.
    fn start_heartbeat(&self, ctx: &mut ws::WebsocketContext<Self>) {
        ctx.run_interval(self.ping_interval, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > act.client_timeout {
                warn!(session_id = %act.session.id, "WebSocket heartbeat timeout, closing connection");
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });
    }

    fn handle_text(&mut self, text: &str, ctx: &mut ws::WebsocketContext<Self>) {
        match parse_control(text) {
            Ok(message) => self.session.handle_control(message),
            Err(err) => {
                warn!(session_id = %self.session.id, error = %err, "Rejected control message");
                let event = ServerEvent::Error {
                    session_id: self.session.id.clone(),
                    message: err.to_string(),
                };
                ctx.text(event.to_json());
            }
        }
    }

    fn handle_binary(&mut self, data: &[u8]) {
        if let Err(err) = self.session.handle_binary(data) {
            warn!(session_id = %self.session.id, error = %err, "Dropping malformed audio frame");
        }
    }
}

impl Actor for VoiceWebSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(session_id = %self.session.id, "WebSocket connection started");

        if let Some(outbound) = self.outbound.take() {
            ctx.add_stream(outbound.into_stream());
        }
        self.start_heartbeat(ctx);
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        if self.state.sessions.remove(&self.session.id) {
            self.state.record_session_closed();
        }
        info!(session_id = %self.session.id, "WebSocket connection stopped");
    }
}

/// Incoming WebSocket messages.
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for VoiceWebSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        self.last_heartbeat = Instant::now();

        match msg {
            Ok(ws::Message::Text(text)) => self.handle_text(&text, ctx),
            Ok(ws::Message::Binary(data)) => self.handle_binary(&data),
            Ok(ws::Message::Ping(data)) => ctx.pong(&data),
            Ok(ws::Message::Pong(_)) => {}
            Ok(ws::Message::Close(reason)) => {
                info!(session_id = %self.session.id, "WebSocket closed: {:?}", reason);
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!(session_id = %self.session.id, "Received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!(session_id = %self.session.id, "WebSocket protocol error: {}", err);
                ctx.stop();
            }
        }
    }
}

/// Session output, in pipeline order.
impl StreamHandler<Outbound> for VoiceWebSocket {
    fn handle(&mut self, item: Outbound, ctx: &mut Self::Context) {
        match item {
            Outbound::Event(event) => ctx.text(event.to_json()),
            Outbound::Audio { pcm, .. } => ctx.binary(pcm),
        }
    }

    fn finished(&mut self, ctx: &mut Self::Context) {
        debug!(session_id = %self.session.id, "Session pipeline ended, closing connection");
        ctx.close(Some(ws::CloseCode::Normal.into()));
        ctx.stop();
    }
}

/// WebSocket endpoint handler.
///
/// ## HTTP to WebSocket Upgrade:
/// The handshake is checked before a session is created, so a plain HTTP request never
/// consumes a session slot. A full registry answers 503 instead of upgrading.
pub async fn voice_websocket(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    debug!("New WebSocket connection request from: {:?}", req.connection_info().peer_addr());
    ws::handshake(&req)?;

    let config = state.get_config();
    let providers = Providers::from_config(&config).map_err(AppError::from)?;

    let (session, outbound) = match state
        .sessions
        .create(config.pipeline.to_pipeline_settings(), providers)
    {
        Ok(created) => created,
        Err(err) => {
            state.record_session_rejected();
            warn!("Rejecting WebSocket connection: {}", err);
            return Err(err.into());
        }
    };
    state.record_session_opened();

    let session_id = session.id.clone();
    let actor = VoiceWebSocket::new(session, outbound, state.clone());
    ws::start(actor, &req, stream).map_err(|err| {
        if state.sessions.remove(&session_id) {
            state.record_session_closed();
        }
        err
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use actix_web::{http::StatusCode, test, App};

    #[actix_web::test]
    async fn test_plain_http_request_does_not_create_session() {
        let state = web::Data::new(AppState::new(AppConfig::default()));
        let app = test::init_service(
            App::new()
                .app_data(state.clone())
                .route("/ws", web::get().to(voice_websocket)),
        )
        .await;

        let req = test::TestRequest::get().uri("/ws").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(state.sessions.is_empty());
    }

    #[actix_web::test]
    async fn test_full_registry_rejects_upgrade() {
        let mut config = AppConfig::default();
        config.session.max_concurrent_sessions = 0;
        let state = web::Data::new(AppState::new(config));
        let app = test::init_service(
            App::new()
                .app_data(state.clone())
                .route("/ws", web::get().to(voice_websocket)),
        )
        .await;

        let req = test::TestRequest::get()
            .uri("/ws")
            .insert_header(("upgrade", "websocket"))
            .insert_header(("connection", "upgrade"))
            .insert_header(("sec-websocket-version", "13"))
            .insert_header(("sec-websocket-key", "dGhlIHNhbXBsZSBub25jZQ=="))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(state.get_metrics_snapshot().sessions_rejected, 1);
    }
}
