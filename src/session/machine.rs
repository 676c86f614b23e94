//! # Voice Session State Machine
//!
//! One [`Session`] per client connection. It owns the connection's engine
//! link and decides, for every client event and every line of engine output,
//! what may pass.
//!
//! ## Session Lifecycle:
//! ```text
//!   Idle ──start──▶ Starting ──readiness──▶ Ready ──first audio──▶ Active
//!                      │                      │                      │
//!                      │                      └──end-audio/stop──────┤
//!                      │                                             ▼
//!                      └────────────stop─────────────────────────▶ Stopping
//!   any state with an engine ──exit event──▶ Terminated
//! ```
//!
//! `Ready` and `Active` are both "live": the `ready` flag gates client audio
//! and text. Until it is set, client frames are dropped, never queued.
//!
//! ## Readiness:
//! The engine signals readiness either with a structured `text` frame or a
//! plain diagnostic line that contains the configured sentinel. Both arrive
//! as a [`ReadinessSignal`]; the first one wins and later ones are ignored.
//!
//! ## Exit events:
//! Each engine has its own process id. An exit carrying a superseded id (the
//! engine replaced by a restart) is ignored, so a late exit of an old engine
//! can never tear down its successor.

use crate::engine::frame::{EngineOutput, Frame};
use crate::engine::supervisor::{EngineHandle, ExitSummary, SessionLaunch};
use crate::error::RelayError;
use crate::protocol::ServerEvent;
use chrono::{DateTime, Utc};
use std::fmt;
use tracing::{debug, info, warn};

/// Session ids default to this when the client supplies none.
pub const DEFAULT_SESSION_ID: &str = "default";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Starting,
    Ready,
    Active,
    Stopping,
    Terminated,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Starting => "starting",
            SessionState::Ready => "ready",
            SessionState::Active => "active",
            SessionState::Stopping => "stopping",
            SessionState::Terminated => "terminated",
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(self, SessionState::Ready | SessionState::Active)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the engine announced it is ready.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadinessSignal {
    /// A structured `text` frame containing the sentinel.
    Structured(String),
    /// A plain stdout line containing the sentinel.
    Sentinel(String),
}

impl ReadinessSignal {
    /// The readiness signal carried by one line of engine output, if any.
    pub fn detect(output: &EngineOutput, sentinel: &str) -> Option<Self> {
        match output {
            EngineOutput::Frame(Frame::Text { data }) if data.contains(sentinel) => {
                Some(ReadinessSignal::Structured(data.clone()))
            }
            EngineOutput::Diagnostic(line) if line.contains(sentinel) => Some(ReadinessSignal::Sentinel(line.clone())),
            _ => None,
        }
    }
}

/// The parts of an engine the session needs. Implemented by
/// [`EngineHandle`]; tests substitute an in-memory link.
pub trait EngineLink {
    fn process_id(&self) -> u64;

    /// Hand a frame to the engine without waiting.
    fn send(&self, frame: Frame) -> Result<(), RelayError>;

    /// Request termination; exit is confirmed asynchronously.
    fn kill(&mut self);

    fn has_exited(&self) -> bool;

    fn exit_summary(&self) -> Option<ExitSummary>;

    /// First readiness signal the engine printed, whether or not a
    /// connection was listening at the time.
    fn observed_readiness(&self) -> Option<ReadinessSignal>;
}

impl EngineLink for EngineHandle {
    fn process_id(&self) -> u64 {
        EngineHandle::process_id(self)
    }

    fn send(&self, frame: Frame) -> Result<(), RelayError> {
        EngineHandle::send(self, frame)
    }

    fn kill(&mut self) {
        EngineHandle::kill(self)
    }

    fn has_exited(&self) -> bool {
        EngineHandle::has_exited(self)
    }

    fn exit_summary(&self) -> Option<ExitSummary> {
        EngineHandle::exit_summary(self)
    }

    fn observed_readiness(&self) -> Option<ReadinessSignal> {
        EngineHandle::observed_readiness(self)
    }
}

/// Per-session drop and forward counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionCounters {
    pub frames_forwarded: u64,
    pub refused_not_ready: u64,
    pub dropped_backpressure: u64,
    pub dropped_closed: u64,
}

/// Result of a successful [`Session::start`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartOutcome {
    pub process_id: u64,
    /// Set when a previous engine on this connection was killed to make room.
    pub replaced: Option<RelayError>,
}

/// One client's voice session.
pub struct Session<L: EngineLink> {
    session_id: String,
    connection_id: String,
    voice_id: String,
    state: SessionState,
    link: Option<L>,
    ready: bool,
    audio_started: bool,
    not_ready_reported: bool,
    ready_sentinel: String,
    counters: SessionCounters,
    created_at: DateTime<Utc>,
}

impl<L: EngineLink> fmt::Debug for Session<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("session_id", &self.session_id)
            .field("connection_id", &self.connection_id)
            .field("voice_id", &self.voice_id)
            .field("state", &self.state)
            .field("process_id", &self.process_id())
            .field("ready", &self.ready)
            .field("audio_started", &self.audio_started)
            .finish()
    }
}

impl<L: EngineLink> Session<L> {
    /// A session with no engine yet.
    pub fn idle(connection_id: impl Into<String>, ready_sentinel: impl Into<String>) -> Self {
        Self {
            session_id: DEFAULT_SESSION_ID.to_string(),
            connection_id: connection_id.into(),
            voice_id: String::new(),
            state: SessionState::Idle,
            link: None,
            ready: false,
            audio_started: false,
            not_ready_reported: false,
            ready_sentinel: ready_sentinel.into(),
            counters: SessionCounters::default(),
            created_at: Utc::now(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn voice_id(&self) -> &str {
        &self.voice_id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn audio_started(&self) -> bool {
        self.audio_started
    }

    pub fn counters(&self) -> SessionCounters {
        self.counters
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn link(&self) -> Option<&L> {
        self.link.as_ref()
    }

    pub fn process_id(&self) -> Option<u64> {
        self.link.as_ref().map(|link| link.process_id())
    }

    /// True while an engine is attached and has not exited.
    pub fn has_engine(&self) -> bool {
        self.link.as_ref().map_or(false, |link| !link.has_exited())
    }

    /// Whether a session left behind by its client can be picked up again:
    /// the engine is running and the session has not begun winding down.
    pub fn is_resumable(&self) -> bool {
        self.has_engine() && (self.state == SessionState::Starting || self.state.is_live())
    }

    /// Start a fresh engine for `launch`, killing any engine this session
    /// still holds first.
    ///
    /// `spawn` is only called after the previous engine has been asked to
    /// die. On failure the session ends up `Terminated`.
    pub fn start<F>(&mut self, launch: SessionLaunch, spawn: F) -> Result<StartOutcome, RelayError>
    where
        F: FnOnce(&SessionLaunch) -> Result<L, RelayError>,
    {
        let replaced = self.link.take().map(|mut previous| {
            warn!(
                connection_id = %self.connection_id,
                session_id = %self.session_id,
                process_id = previous.process_id(),
                "Replacing running voice session"
            );
            previous.kill();
            RelayError::SessionConflict {
                previous_session_id: self.session_id.clone(),
            }
        });

        self.session_id = launch.session_id.clone();
        self.connection_id = launch.connection_id.clone();
        self.voice_id = launch.voice_id.clone();
        self.ready = false;
        self.audio_started = false;
        self.not_ready_reported = false;
        self.counters = SessionCounters::default();
        self.created_at = Utc::now();
        self.state = SessionState::Starting;

        match spawn(&launch) {
            Ok(link) => {
                let process_id = link.process_id();
                self.link = Some(link);
                info!(
                    connection_id = %self.connection_id,
                    session_id = %self.session_id,
                    process_id,
                    "Voice session starting"
                );
                Ok(StartOutcome { process_id, replaced })
            }
            Err(err) => {
                self.state = SessionState::Terminated;
                warn!(session_id = %self.session_id, error = %err, "Voice session failed to start");
                Err(err)
            }
        }
    }

    /// Move this session to a new connection after a reconnect. Call it
    /// once the engine is bound to the new connection.
    ///
    /// Engine output is discarded while a session is parked, so this catches
    /// up on what was missed: an exit yields `session-ended`, a readiness
    /// signal (old or new) yields `session-ready`.
    pub fn resume(&mut self, connection_id: impl Into<String>) -> Option<ServerEvent> {
        self.connection_id = connection_id.into();
        self.not_ready_reported = false;

        let exited = self
            .link
            .as_ref()
            .and_then(|link| link.exit_summary().map(|summary| (link.process_id(), summary)));
        if let Some((process_id, summary)) = exited {
            return self.on_process_exit(process_id, summary);
        }

        if !self.ready {
            if let Some(signal) = self.link.as_ref().and_then(|link| link.observed_readiness()) {
                self.on_readiness(signal);
            }
        }
        self.ready.then_some(ServerEvent::SessionReady {})
    }

    /// Apply a readiness signal. Returns true only for the first one.
    pub fn on_readiness(&mut self, signal: ReadinessSignal) -> bool {
        if self.ready || self.state != SessionState::Starting {
            debug!(session_id = %self.session_id, ?signal, "Ignoring repeated readiness signal");
            return false;
        }
        self.ready = true;
        self.not_ready_reported = false;
        self.state = SessionState::Ready;
        info!(session_id = %self.session_id, ?signal, "Voice session ready");
        true
    }

    /// Turn one line of engine output into at most one client event.
    pub fn handle_output(&mut self, process_id: u64, output: EngineOutput) -> Option<ServerEvent> {
        if self.process_id() != Some(process_id) {
            debug!(session_id = %self.session_id, process_id, "Dropping output from superseded engine");
            return None;
        }

        if !self.ready {
            if let Some(signal) = ReadinessSignal::detect(&output, &self.ready_sentinel) {
                return self.on_readiness(signal).then_some(ServerEvent::SessionReady {});
            }
        }

        match output {
            EngineOutput::Frame(Frame::Text { data }) => Some(ServerEvent::TextMessage { text: data }),
            EngineOutput::Frame(Frame::Audio { data }) => Some(ServerEvent::AudioChunk { data }),
            EngineOutput::Frame(Frame::Error { text }) => {
                warn!(session_id = %self.session_id, process_id, "Engine error: {}", text);
                Some(ServerEvent::Error { message: text })
            }
            EngineOutput::Frame(Frame::Debug { text }) => {
                debug!(target: "engine", session_id = %self.session_id, process_id, "{}", text);
                None
            }
            EngineOutput::Frame(frame) => {
                debug!(session_id = %self.session_id, frame = frame.kind(), "Ignoring control frame from engine");
                None
            }
            EngineOutput::Diagnostic(line) => {
                debug!(target: "engine", session_id = %self.session_id, process_id, "{}", line);
                None
            }
        }
    }

    /// Forward one captured audio chunk, sending `start_audio` first if this
    /// is the session's first audio.
    pub fn submit_audio(&mut self, data: String) -> Result<(), RelayError> {
        self.ensure_accepting()?;
        self.ensure_audio_started()?;
        self.forward(Frame::Audio { data })?;
        self.state = SessionState::Active;
        Ok(())
    }

    pub fn submit_text(&mut self, text: String) -> Result<(), RelayError> {
        self.ensure_accepting()?;
        self.forward(Frame::Text { data: text })
    }

    /// Explicit start-of-audio from the client. Idempotent.
    pub fn start_audio(&mut self) -> Result<(), RelayError> {
        self.ensure_accepting()?;
        self.ensure_audio_started()
    }

    /// The client finished speaking. No further audio is accepted.
    pub fn end_audio(&mut self) -> Result<(), RelayError> {
        self.ensure_accepting()?;
        let sent = self.forward(Frame::EndAudio);
        self.state = SessionState::Stopping;
        sent
    }

    /// Kill the engine. Returns false if there was nothing to stop.
    pub fn stop(&mut self) -> bool {
        match self.link.as_mut() {
            Some(link) => {
                link.kill();
                if self.state != SessionState::Terminated {
                    self.state = SessionState::Stopping;
                }
                info!(session_id = %self.session_id, process_id = link.process_id(), "Voice session stopping");
                true
            }
            None => false,
        }
    }

    /// Apply an engine exit. Exits of superseded engines return `None` and
    /// change nothing.
    pub fn on_process_exit(&mut self, process_id: u64, summary: ExitSummary) -> Option<ServerEvent> {
        if self.process_id() != Some(process_id) {
            debug!(session_id = %self.session_id, process_id, "Ignoring exit of superseded engine");
            return None;
        }

        let was_stopping = self.state == SessionState::Stopping;
        self.link = None;
        self.ready = false;
        self.audio_started = false;
        self.not_ready_reported = false;
        self.state = SessionState::Terminated;

        let reason = if summary.killed {
            "stopped".to_string()
        } else if summary.success && was_stopping {
            "completed".to_string()
        } else {
            RelayError::ProcessCrash { code: summary.code }.to_string()
        };
        info!(session_id = %self.session_id, process_id, %reason, "Voice session ended");
        Some(ServerEvent::SessionEnded { reason })
    }

    /// True the first time a not-ready refusal should be surfaced to the
    /// client since the session last became ready (or started).
    pub fn report_not_ready(&mut self) -> bool {
        if self.not_ready_reported {
            return false;
        }
        self.not_ready_reported = true;
        true
    }

    fn ensure_accepting(&mut self) -> Result<(), RelayError> {
        if self.ready && self.state.is_live() && self.link.is_some() {
            return Ok(());
        }
        self.counters.refused_not_ready += 1;
        Err(RelayError::NotReady)
    }

    fn ensure_audio_started(&mut self) -> Result<(), RelayError> {
        if self.audio_started {
            return Ok(());
        }
        self.forward(Frame::StartAudio)?;
        self.audio_started = true;
        Ok(())
    }

    fn forward(&mut self, frame: Frame) -> Result<(), RelayError> {
        let link = self.link.as_ref().ok_or(RelayError::WriteAfterClose)?;
        match link.send(frame) {
            Ok(()) => {
                self.counters.frames_forwarded += 1;
                Ok(())
            }
            Err(err) => {
                match err {
                    RelayError::Backpressure => self.counters.dropped_backpressure += 1,
                    RelayError::WriteAfterClose => self.counters.dropped_closed += 1,
                    _ => {}
                }
                Err(err)
            }
        }
    }
}
