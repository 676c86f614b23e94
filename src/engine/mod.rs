//! # Speech Engine Plumbing
//!
//! - `frame`: the newline-delimited JSON frames exchanged with the engine
//! - `supervisor`: starting, feeding, draining and killing engine processes

pub mod frame;
pub mod supervisor;

pub use frame::{EngineOutput, Frame, FrameCodec};
pub use supervisor::{EngineEvent, EngineHandle, ExitSummary, ProcessSupervisor, SessionLaunch};
