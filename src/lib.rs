//! # sim-voice-backend
//!
//! Real-time voice session relay: browser clients hold a live audio/text
//! conversation with a speech engine that runs as one subprocess per session.
//!
//! ## Modules:
//! - **config**: layered configuration (defaults, `config.toml`, environment)
//! - **error**: HTTP and relay error types
//! - **state**: shared state and relay counters
//! - **engine**: engine frames, line codec and process supervisor
//! - **session**: per-connection state machine and parked-session registry
//! - **protocol**: client wire events
//! - **websocket**: the `/ws/voice` relay actor
//! - **audio**: client capture and playback pipeline
//! - **health** / **handlers**: diagnostics endpoints

pub mod audio;
pub mod config;
pub mod engine;
pub mod error;
pub mod handlers;
pub mod health;
pub mod protocol;
pub mod session;
pub mod state;
pub mod websocket;
