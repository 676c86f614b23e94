//! # Client Audio Pipeline
//!
//! The client half of a voice session, kept as library code so it can be
//! driven by any front end (browser bridge, native client, tests).
//!
//! ## Key Components:
//! - **capture**: microphone buffers → 16 kHz PCM frames → `audio-input` events
//! - **playback**: `audio-chunk` events → jitter buffer → WAV clips → output
//! - **wav**: the 44-byte RIFF header used for playback clips
//!
//! ## Audio Format Requirements:
//! - **Encoding**: 16-bit signed little-endian PCM, mono, base64 on the wire
//! - **Capture rate**: 16 kHz (`audio.input_sample_rate`)
//! - **Playback rate**: 24 kHz (`audio.output_sample_rate`)

pub mod capture;
pub mod playback;
pub mod wav;
