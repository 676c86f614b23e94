//! # Voice Sessions
//!
//! - `machine`: the per-connection session state machine
//! - `registry`: sessions parked after their client disconnected

pub mod machine;
pub mod registry;

pub use machine::{EngineLink, ReadinessSignal, Session, SessionState, StartOutcome};
pub use registry::SessionRegistry;
