//! # Voice Relay WebSocket Handler
//!
//! Clients connect to `/ws/voice` and hold one voice session per connection.
//! Each connection is an actor that owns a [`Session`] and translates between
//! client events and the session's engine.
//!
//! ## WebSocket Protocol:
//! 1. **Admission**: a bearer token in the `Authorization` header or the
//!    `token` query parameter (rejected with 401 before the upgrade when
//!    tokens are required)
//! 2. **start-voice**: spawns the engine, or re-binds to a session the same
//!    token parked under the same `sessionId`
//! 3. **session-ready**: sent once the engine signals readiness; audio and
//!    text sent earlier are dropped
//! 4. **audio-input / text-input / start-audio / end-audio / stop-voice**
//! 5. **Disconnect**: a session with an explicit `sessionId` that is still
//!    starting or live is parked with its engine running; anything else is
//!    stopped
//!
//! ## Message Format:
//! - **Client → Server**: `{"event": "audio-input", "data": {"data": "<base64>"}}`
//! - **Server → Client**: `{"event": "audio-chunk", "data": {"data": "<base64>"}}`

use crate::config::AppConfig;
use crate::engine::supervisor::{EngineEvent, EngineHandle, ProcessSupervisor, SessionLaunch};
use crate::error::{AppError, RelayError};
use crate::protocol::{ClientEvent, ServerEvent};
use crate::session::machine::{Session, DEFAULT_SESSION_ID};
use crate::state::{AppState, RelayMetrics};

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// WebSocket actor for one client connection.
pub struct VoiceRelay {
    connection_id: String,
    /// Admission token, empty for anonymous connections. Parked sessions
    /// are only visible to the owner that parked them.
    owner: String,
    session: Session<EngineHandle>,
    supervisor: ProcessSupervisor,
    state: AppState,
    config: AppConfig,
    last_heartbeat: Instant,
}

impl VoiceRelay {
    pub fn new(state: AppState, token: Option<String>) -> Self {
        let config = state.get_config();
        let connection_id = uuid::Uuid::new_v4().to_string();
        Self {
            session: Session::idle(connection_id.clone(), config.engine.ready_sentinel.clone()),
            supervisor: ProcessSupervisor::new(config.engine.clone(), state.metrics.clone()),
            connection_id,
            owner: token.unwrap_or_default(),
            state,
            config,
            last_heartbeat: Instant::now(),
        }
    }

    fn send_event(&self, ctx: &mut ws::WebsocketContext<Self>, event: &ServerEvent) {
        match event.to_json() {
            Ok(json) => ctx.text(json),
            Err(err) => error!(connection_id = %self.connection_id, error = %err, "Failed to encode client event"),
        }
    }

    fn send_error(&self, ctx: &mut ws::WebsocketContext<Self>, err: &RelayError) {
        warn!(connection_id = %self.connection_id, code = err.code(), "{}", err);
        self.send_event(ctx, &ServerEvent::error(err.to_string()));
    }

    fn handle_client_event(&mut self, event: ClientEvent, ctx: &mut ws::WebsocketContext<Self>) {
        let name = event.name();
        let result = match event {
            ClientEvent::StartVoice { voice_id, session_id } => {
                self.start_voice(voice_id, session_id, ctx);
                Ok(())
            }
            ClientEvent::StartAudio {} => self.session.start_audio(),
            ClientEvent::AudioInput { data } => self.session.submit_audio(data),
            ClientEvent::TextInput { text } => self.session.submit_text(text),
            ClientEvent::EndAudio {} => self.session.end_audio(),
            ClientEvent::StopVoice {} => {
                if !self.session.stop() {
                    debug!(connection_id = %self.connection_id, "stop-voice without a running session");
                }
                Ok(())
            }
        };

        match result {
            Ok(()) => {}
            Err(RelayError::NotReady) => {
                RelayMetrics::incr(&self.state.metrics.frames_dropped_not_ready);
                if self.session.report_not_ready() {
                    self.send_error(ctx, &RelayError::NotReady);
                } else {
                    debug!(connection_id = %self.connection_id, event = name, "Dropping event, session not ready");
                }
            }
            Err(err @ (RelayError::Backpressure | RelayError::WriteAfterClose)) => {
                debug!(connection_id = %self.connection_id, event = name, error = %err, "Frame not delivered to engine");
            }
            Err(err) => self.send_error(ctx, &err),
        }
    }

    fn start_voice(
        &mut self,
        voice_id: Option<String>,
        session_id: Option<String>,
        ctx: &mut ws::WebsocketContext<Self>,
    ) {
        let session_id = session_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_SESSION_ID.to_string());
        let requested_voice = voice_id.filter(|id| !id.trim().is_empty());

        if let Some(mut parked) = self.state.sessions.take(&self.owner, &session_id) {
            match &requested_voice {
                Some(voice) if voice.as_str() != parked.voice_id() => {
                    info!(
                        connection_id = %self.connection_id,
                        session_id = %session_id,
                        parked_voice = %parked.voice_id(),
                        requested_voice = %voice,
                        "Parked session uses another voice, starting a new one"
                    );
                    parked.stop();
                }
                _ => {
                    self.adopt(parked, ctx);
                    return;
                }
            }
        }

        let voice_id = requested_voice.unwrap_or_else(|| self.config.engine.default_voice_id.clone());

        let own = u64::from(self.session.has_engine());
        let limit = self.config.relay.max_concurrent_sessions;
        if self.state.metrics.live_engines().saturating_sub(own) >= limit as u64 {
            self.send_error(ctx, &RelayError::CapacityExceeded { limit });
            return;
        }

        let launch = SessionLaunch {
            session_id,
            voice_id,
            connection_id: self.connection_id.clone(),
        };
        let recipient = ctx.address().recipient();
        let supervisor = &self.supervisor;
        match self.session.start(launch, |launch| supervisor.spawn(launch, Some(recipient))) {
            Ok(outcome) => {
                if let Some(conflict) = outcome.replaced {
                    info!(connection_id = %self.connection_id, "{}", conflict);
                }
            }
            Err(err) => self.send_error(ctx, &err),
        }
    }

    /// Take over a parked session after a reconnect.
    fn adopt(&mut self, mut parked: Session<EngineHandle>, ctx: &mut ws::WebsocketContext<Self>) {
        if self.session.process_id() != parked.process_id() && self.session.stop() {
            let err = RelayError::SessionConflict {
                previous_session_id: self.session.session_id().to_string(),
            };
            info!(connection_id = %self.connection_id, "{}", err);
        }

        // Bind before catching up, so nothing the engine does from here on
        // can fall between the two.
        if let Some(link) = parked.link() {
            link.bind(ctx.address().recipient());
        }
        let reply = parked.resume(self.connection_id.clone());
        RelayMetrics::incr(&self.state.metrics.sessions_rebound);
        info!(
            connection_id = %self.connection_id,
            session_id = %parked.session_id(),
            process_id = ?parked.process_id(),
            state = %parked.state(),
            "Re-bound parked voice session"
        );

        self.session = parked;
        if let Some(reply) = reply {
            self.send_event(ctx, &reply);
        }
    }
}

/// Park a session whose client went away, so `owner` can pick it up again.
///
/// Only sessions started under an explicit id that are still starting or
/// live are parked. Anything else is stopped here. Returns true if the
/// session was parked.
pub fn park_session(state: &AppState, owner: &str, mut session: Session<EngineHandle>) -> bool {
    if !session.is_resumable() || session.session_id() == DEFAULT_SESSION_ID {
        if session.stop() {
            debug!(session_id = %session.session_id(), state = %session.state(), "Stopped session of closed connection");
        }
        return false;
    }
    if let Some(link) = session.link() {
        link.unbind();
    }
    if let Some(mut displaced) = state.sessions.park(owner, session) {
        warn!(session_id = %displaced.session_id(), "Parked session displaced by another with the same id");
        displaced.stop();
    }
    RelayMetrics::incr(&state.metrics.sessions_parked);
    true
}

/// Periodically stop sessions that stayed parked longer than `max_idle`.
pub async fn run_idle_reaper(state: AppState, max_idle: Duration) {
    let period = (max_idle / 4).max(Duration::from_secs(1));
    let mut interval = tokio::time::interval(period);
    loop {
        interval.tick().await;
        let pruned = state.sessions.prune_exited();
        let reaped = state.sessions.reap_idle(max_idle);
        for _ in 0..reaped {
            RelayMetrics::incr(&state.metrics.sessions_reaped);
        }
        if pruned + reaped > 0 {
            debug!(pruned, reaped, parked = state.sessions.len(), "Parked session sweep");
        }
    }
}

impl Actor for VoiceRelay {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        RelayMetrics::incr(&self.state.metrics.connections_opened);
        RelayMetrics::incr(&self.state.metrics.connections_active);
        info!(connection_id = %self.connection_id, "Voice connection opened");

        let interval = Duration::from_secs(self.config.relay.heartbeat_interval_secs);
        let timeout = Duration::from_secs(self.config.relay.client_timeout_secs);
        ctx.run_interval(interval, move |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > timeout {
                warn!(connection_id = %act.connection_id, "Voice connection heartbeat timeout, closing");
                ctx.stop();
            } else {
                ctx.ping(b"");
            }
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        RelayMetrics::decr(&self.state.metrics.connections_active);

        let idle = Session::idle(self.connection_id.clone(), self.config.engine.ready_sentinel.clone());
        let session = std::mem::replace(&mut self.session, idle);
        let session_id = session.session_id().to_string();
        let parked = park_session(&self.state, &self.owner, session);
        info!(connection_id = %self.connection_id, session_id = %session_id, parked, "Voice connection closed");
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for VoiceRelay {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => {
                self.last_heartbeat = Instant::now();
                match ClientEvent::parse(&text) {
                    Ok(event) => self.handle_client_event(event, ctx),
                    Err(err) => {
                        warn!(connection_id = %self.connection_id, error = %err, "Invalid client message");
                        self.send_event(ctx, &ServerEvent::error(format!("Invalid message: {}", err)));
                    }
                }
            }
            Ok(ws::Message::Binary(data)) => {
                warn!(connection_id = %self.connection_id, bytes = data.len(), "Ignoring binary message");
            }
            Ok(ws::Message::Ping(data)) => {
                self.last_heartbeat = Instant::now();
                ctx.pong(&data);
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!(connection_id = %self.connection_id, ?reason, "Voice connection closing");
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!(connection_id = %self.connection_id, "Received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!(connection_id = %self.connection_id, error = %err, "WebSocket protocol error");
                ctx.stop();
            }
        }
    }
}

impl Handler<EngineEvent> for VoiceRelay {
    type Result = ();

    fn handle(&mut self, event: EngineEvent, ctx: &mut Self::Context) {
        let reply = match event {
            EngineEvent::Output { process_id, output } => self.session.handle_output(process_id, output),
            EngineEvent::Exited { process_id, summary } => self.session.on_process_exit(process_id, summary),
        };
        if let Some(reply) = reply {
            self.send_event(ctx, &reply);
        }
    }
}

/// Pull the opaque admission token from `Authorization: Bearer` or `?token=`.
pub fn extract_token(req: &HttpRequest) -> Option<String> {
    let from_header = req
        .headers()
        .get(actix_web::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(|token| token.trim().to_string());

    let token = from_header.or_else(|| {
        web::Query::<HashMap<String, String>>::from_query(req.query_string())
            .ok()
            .and_then(|query| query.get("token").map(|token| token.trim().to_string()))
    });

    token.filter(|token| !token.is_empty())
}

/// WebSocket endpoint handler.
///
/// ## HTTP to WebSocket Upgrade:
/// Admission is checked on the plain HTTP request; only admitted requests are
/// upgraded and handed to a [`VoiceRelay`] actor.
pub async fn voice_websocket(
    req: HttpRequest,
    stream: web::Payload,
    app_state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    let require_token = app_state.get_config().relay.require_token;
    let token = extract_token(&req);
    if require_token && token.is_none() {
        warn!(peer = ?req.connection_info().peer_addr(), "Rejecting voice connection without token");
        return Err(AppError::Unauthorized("missing bearer token".to_string()).into());
    }

    debug!(peer = ?req.connection_info().peer_addr(), authenticated = token.is_some(), "Voice connection request");
    ws::start(VoiceRelay::new(app_state.get_ref().clone(), token), &req, stream)
}
