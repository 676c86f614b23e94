//! # Error Handling
//!
//! Two families of errors live here:
//!
//! - [`AppError`]: failures of the HTTP surface, today only a refused
//!   WebSocket upgrade. These become JSON error responses through
//!   `ResponseError`.
//! - [`RelayError`]: everything that can go wrong between a client connection,
//!   its session and the engine subprocess. None of these may take the relay
//!   down; each one is either surfaced to the client as an `error` event or
//!   handled locally and logged.
//!
//! ## Relay error policy:
//! | Variant            | Handling                                          |
//! |--------------------|---------------------------------------------------|
//! | `Spawn`            | session fails, client receives an `error` event    |
//! | `FrameParse`       | line degrades to diagnostic text, logged only     |
//! | `NotReady`         | frame dropped, client told once per not-ready run |
//! | `WriteAfterClose`  | frame dropped, logged                             |
//! | `Backpressure`     | frame dropped, logged and counted                 |
//! | `SessionConflict`  | previous engine is killed, new session proceeds   |
//! | `ProcessCrash`     | client receives `session-ended`, flags reset      |
//! | `CapacityExceeded` | start refused, client receives an `error` event   |

use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

/// Errors returned by HTTP handlers.
///
/// ## Error Categories:
/// - **Unauthorized**: missing or blank admission token (401)
#[derive(Debug)]
pub enum AppError {
    Unauthorized(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Unauthorized(msg) => write!(f, "Unauthorized: {}", msg),
        }
    }
}

/// Converts errors into the JSON body every endpoint shares:
///
/// ```json
/// {
///   "error": {
///     "type": "unauthorized",
///     "message": "missing bearer token",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        let (status, error_type, message) = match self {
            AppError::Unauthorized(msg) => (
                actix_web::http::StatusCode::UNAUTHORIZED,
                "unauthorized",
                msg.clone(),
            ),
        };

        HttpResponse::build(status).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

/// Errors raised inside the voice relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    /// The engine subprocess could not be started.
    Spawn(String),
    /// A stdout line was not a recognised frame.
    FrameParse(String),
    /// Audio or text arrived before the engine signalled readiness.
    NotReady,
    /// The engine's stdin is gone (process exited or pipe closed).
    WriteAfterClose,
    /// The engine's stdin queue is full; the frame was dropped.
    Backpressure,
    /// A new session was requested while another one was live.
    SessionConflict { previous_session_id: String },
    /// The engine exited while the session was live.
    ProcessCrash { code: Option<i32> },
    /// The relay is already running its maximum number of engines.
    CapacityExceeded { limit: usize },
}

impl RelayError {
    /// Short machine-readable code, used in logs and metrics labels.
    pub fn code(&self) -> &'static str {
        match self {
            RelayError::Spawn(_) => "spawn_error",
            RelayError::FrameParse(_) => "frame_parse_error",
            RelayError::NotReady => "not_ready",
            RelayError::WriteAfterClose => "write_after_close",
            RelayError::Backpressure => "backpressure",
            RelayError::SessionConflict { .. } => "session_conflict",
            RelayError::ProcessCrash { .. } => "process_crash",
            RelayError::CapacityExceeded { .. } => "capacity_exceeded",
        }
    }
}

impl fmt::Display for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayError::Spawn(msg) => write!(f, "Failed to start voice engine: {}", msg),
            RelayError::FrameParse(msg) => write!(f, "Unrecognised engine output: {}", msg),
            RelayError::NotReady => write!(f, "Voice session is not ready yet"),
            RelayError::WriteAfterClose => write!(f, "Cannot send, voice engine is not accepting input"),
            RelayError::Backpressure => write!(f, "Voice engine input queue is full"),
            RelayError::SessionConflict { previous_session_id } => {
                write!(f, "Session {} was replaced by a new session", previous_session_id)
            }
            RelayError::ProcessCrash { code: Some(code) } => {
                write!(f, "Voice engine exited with status {}", code)
            }
            RelayError::ProcessCrash { code: None } => {
                write!(f, "Voice engine was terminated by a signal")
            }
            RelayError::CapacityExceeded { limit } => {
                write!(f, "Maximum concurrent voice sessions ({}) reached", limit)
            }
        }
    }
}

impl std::error::Error for RelayError {}
