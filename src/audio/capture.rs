//! # Client Capture Pipeline
//!
//! Turns microphone buffers into outbound `audio-input` events.
//!
//! ## Per buffer:
//! 1. Resample from the device rate to the wire rate (16 kHz) if they differ
//! 2. Convert float samples to 16-bit PCM with hard clamping
//! 3. Accumulate and cut into fixed-size frames (`chunk_samples`)
//! 4. Base64-encode each frame and hand it to the [`FrameSender`]
//!
//! `start-audio` goes out exactly once, lazily, before the first frame.
//!
//! ## Teardown order:
//! remaining samples, end-of-audio, processing node, input node, media
//! tracks, audio context. Every step runs even if an earlier one failed.

use crate::config::AudioConfig;
use crate::protocol::ClientEvent;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use byteorder::{ByteOrder, LittleEndian};
use std::fmt;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    /// The outbound connection refused the event.
    Send(String),
    /// An audio graph node could not be torn down.
    Teardown(String),
    /// Audio arrived after `stop`.
    Stopped,
}

impl fmt::Display for CaptureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaptureError::Send(msg) => write!(f, "Failed to send audio event: {}", msg),
            CaptureError::Teardown(msg) => write!(f, "Audio teardown step failed: {}", msg),
            CaptureError::Stopped => write!(f, "Capture pipeline already stopped"),
        }
    }
}

impl std::error::Error for CaptureError {}

/// Outbound side of the client connection.
pub trait FrameSender {
    fn send(&mut self, event: ClientEvent) -> Result<(), CaptureError>;
}

/// Handles to the capture audio graph, released on stop.
pub trait CaptureGraph {
    fn disconnect_processor(&mut self) -> Result<(), CaptureError>;
    fn disconnect_source(&mut self) -> Result<(), CaptureError>;
    fn stop_tracks(&mut self) -> Result<(), CaptureError>;
    fn close_context(&mut self) -> Result<(), CaptureError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownStep {
    FlushAudio,
    EndAudio,
    DisconnectProcessor,
    DisconnectSource,
    StopTracks,
    CloseContext,
}

/// What `stop` managed to do.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct TeardownReport {
    pub completed: Vec<TeardownStep>,
    pub failed: Vec<(TeardownStep, CaptureError)>,
}

impl TeardownReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureConfig {
    pub device_sample_rate: u32,
    pub wire_sample_rate: u32,
    pub chunk_samples: usize,
}

impl CaptureConfig {
    pub fn from_audio(audio: &AudioConfig, device_sample_rate: u32) -> Self {
        Self {
            device_sample_rate,
            wire_sample_rate: audio.input_sample_rate,
            chunk_samples: audio.capture_chunk_samples.max(1),
        }
    }
}

/// Streaming linear-interpolation resampler.
///
/// Output positions are tracked in whole-stream sample counts, so a stream
/// cut into buffers resamples exactly like the same stream in one piece. An
/// output that needs the next buffer's first sample waits for it.
#[derive(Debug, Clone)]
pub struct LinearResampler {
    from_rate: u32,
    to_rate: u32,
    /// Outputs produced so far.
    produced: u64,
    /// Inputs consumed so far.
    consumed: u64,
    /// Last sample of the previous buffer.
    last: Option<f32>,
}

impl LinearResampler {
    pub fn new(from_rate: u32, to_rate: u32) -> Self {
        Self {
            from_rate,
            to_rate,
            produced: 0,
            consumed: 0,
            last: None,
        }
    }

    pub fn is_passthrough(&self) -> bool {
        self.from_rate == self.to_rate || self.from_rate == 0 || self.to_rate == 0
    }

    pub fn process(&mut self, input: &[f32]) -> Vec<f32> {
        if self.is_passthrough() {
            return input.to_vec();
        }
        if input.is_empty() {
            return Vec::new();
        }

        let from = u64::from(self.from_rate);
        let to = u64::from(self.to_rate);
        let end = self.consumed + input.len() as u64;
        let mut output = Vec::with_capacity((input.len() as u64 * to / from) as usize + 1);

        loop {
            let position = self.produced * from;
            let idx = position / to;
            if idx + 1 >= end {
                break;
            }
            let frac = (position % to) as f32 / to as f32;
            let a = self.sample_at(input, idx);
            let b = self.sample_at(input, idx + 1);
            output.push(a + (b - a) * frac);
            self.produced += 1;
        }

        self.consumed = end;
        self.last = input.last().copied();
        output
    }

    fn sample_at(&self, input: &[f32], idx: u64) -> f32 {
        if idx < self.consumed {
            self.last.unwrap_or(0.0)
        } else {
            input[(idx - self.consumed) as usize]
        }
    }
}

/// Convert float samples to 16-bit PCM, clamping to [-1.0, 1.0] first.
pub fn float_to_pcm16(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|&sample| {
            let s = sample.clamp(-1.0, 1.0);
            if s < 0.0 {
                (s * 32768.0) as i16
            } else {
                (s * 32767.0) as i16
            }
        })
        .collect()
}

/// Base64 of little-endian 16-bit PCM.
pub fn encode_pcm16(samples: &[i16]) -> String {
    let mut bytes = vec![0u8; samples.len() * 2];
    LittleEndian::write_i16_into(samples, &mut bytes);
    STANDARD.encode(bytes)
}

pub struct CapturePipeline<S: FrameSender, G: CaptureGraph> {
    config: CaptureConfig,
    resampler: LinearResampler,
    sender: S,
    graph: G,
    pending: Vec<i16>,
    audio_started: bool,
    stopped: bool,
    frames_sent: u64,
}

impl<S: FrameSender, G: CaptureGraph> CapturePipeline<S, G> {
    pub fn new(config: CaptureConfig, sender: S, graph: G) -> Self {
        Self {
            resampler: LinearResampler::new(config.device_sample_rate, config.wire_sample_rate),
            config,
            sender,
            graph,
            pending: Vec::new(),
            audio_started: false,
            stopped: false,
            frames_sent: 0,
        }
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent
    }

    pub fn pending_samples(&self) -> usize {
        self.pending.len()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    pub fn sender(&self) -> &S {
        &self.sender
    }

    pub fn graph(&self) -> &G {
        &self.graph
    }

    /// Process one captured buffer. Returns how many frames were sent.
    pub fn on_buffer(&mut self, samples: &[f32]) -> Result<usize, CaptureError> {
        if self.stopped {
            return Err(CaptureError::Stopped);
        }

        if !self.audio_started {
            self.sender.send(ClientEvent::StartAudio {})?;
            self.audio_started = true;
            debug!("Capture started, sent start-audio");
        }

        let resampled = self.resampler.process(samples);
        self.pending.extend(float_to_pcm16(&resampled));

        let chunk = self.config.chunk_samples;
        let mut sent = 0;
        while self.pending.len() >= chunk {
            let frame: Vec<i16> = self.pending.drain(..chunk).collect();
            self.send_frame(&frame)?;
            sent += 1;
        }
        Ok(sent)
    }

    /// Flush, signal end of audio and release the graph. Safe to call twice;
    /// the second call does nothing.
    pub fn stop(&mut self) -> TeardownReport {
        let mut report = TeardownReport::default();
        if self.stopped {
            return report;
        }
        self.stopped = true;

        let remainder = std::mem::take(&mut self.pending);
        if self.audio_started && !remainder.is_empty() {
            let result = self.send_frame(&remainder);
            record(&mut report, TeardownStep::FlushAudio, result);
        }
        let result = self.sender.send(ClientEvent::EndAudio {});
        record(&mut report, TeardownStep::EndAudio, result);

        let result = self.graph.disconnect_processor();
        record(&mut report, TeardownStep::DisconnectProcessor, result);
        let result = self.graph.disconnect_source();
        record(&mut report, TeardownStep::DisconnectSource, result);
        let result = self.graph.stop_tracks();
        record(&mut report, TeardownStep::StopTracks, result);
        let result = self.graph.close_context();
        record(&mut report, TeardownStep::CloseContext, result);

        report
    }

    fn send_frame(&mut self, frame: &[i16]) -> Result<(), CaptureError> {
        self.sender.send(ClientEvent::AudioInput {
            data: encode_pcm16(frame),
        })?;
        self.frames_sent += 1;
        Ok(())
    }
}

fn record(report: &mut TeardownReport, step: TeardownStep, result: Result<(), CaptureError>) {
    match result {
        Ok(()) => report.completed.push(step),
        Err(err) => {
            warn!(?step, error = %err, "Capture teardown step failed");
            report.failed.push((step, err));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine as _;

    #[derive(Default)]
    struct RecordingSender {
        events: Vec<ClientEvent>,
        refuse_audio: bool,
    }

    impl FrameSender for RecordingSender {
        fn send(&mut self, event: ClientEvent) -> Result<(), CaptureError> {
            if self.refuse_audio && matches!(event, ClientEvent::AudioInput { .. }) {
                return Err(CaptureError::Send("socket buffer full".to_string()));
            }
            self.events.push(event);
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingGraph {
        calls: Vec<TeardownStep>,
        fail_on: Option<TeardownStep>,
    }

    impl RecordingGraph {
        fn step(&mut self, step: TeardownStep) -> Result<(), CaptureError> {
            self.calls.push(step);
            if self.fail_on == Some(step) {
                return Err(CaptureError::Teardown(format!("{:?} failed", step)));
            }
            Ok(())
        }
    }

    impl CaptureGraph for RecordingGraph {
        fn disconnect_processor(&mut self) -> Result<(), CaptureError> {
            self.step(TeardownStep::DisconnectProcessor)
        }

        fn disconnect_source(&mut self) -> Result<(), CaptureError> {
            self.step(TeardownStep::DisconnectSource)
        }

        fn stop_tracks(&mut self) -> Result<(), CaptureError> {
            self.step(TeardownStep::StopTracks)
        }

        fn close_context(&mut self) -> Result<(), CaptureError> {
            self.step(TeardownStep::CloseContext)
        }
    }

    fn pipeline(chunk_samples: usize, graph: RecordingGraph) -> CapturePipeline<RecordingSender, RecordingGraph> {
        let config = CaptureConfig {
            device_sample_rate: 16000,
            wire_sample_rate: 16000,
            chunk_samples,
        };
        CapturePipeline::new(config, RecordingSender::default(), graph)
    }

    fn decode(event: &ClientEvent) -> Vec<i16> {
        match event {
            ClientEvent::AudioInput { data } => {
                let bytes = STANDARD.decode(data).unwrap();
                let mut samples = vec![0i16; bytes.len() / 2];
                LittleEndian::read_i16_into(&bytes, &mut samples);
                samples
            }
            other => panic!("expected audio-input, got {:?}", other),
        }
    }

    #[test]
    fn test_float_to_pcm16_clamps() {
        assert_eq!(
            float_to_pcm16(&[2.0, -2.0, 1.0, -1.0, 0.0, 0.5]),
            vec![32767, -32768, 32767, -32768, 0, 16383]
        );
    }

    #[test]
    fn test_resample_lengths() {
        let input: Vec<f32> = (0..48).map(|i| i as f32 / 48.0).collect();
        let out = LinearResampler::new(48000, 16000).process(&input);
        assert_eq!(out.len(), 16);
        assert!((out[1] - input[3]).abs() < 1e-6);

        let mut up = LinearResampler::new(8000, 16000);
        assert_eq!(up.process(&[0.0, 1.0]), vec![0.0, 0.5]);
        assert_eq!(up.process(&[1.0, 0.0]), vec![1.0, 1.0, 1.0, 0.5]);

        assert_eq!(LinearResampler::new(16000, 16000).process(&[0.25]), vec![0.25]);
    }

    #[test]
    fn test_resampler_carries_phase_across_buffers() {
        let input: Vec<f32> = (0..4410).map(|i| (i as f32 * 0.05).sin()).collect();
        let whole = LinearResampler::new(44100, 16000).process(&input);

        let mut split = LinearResampler::new(44100, 16000);
        let mut pieces = Vec::new();
        for chunk in input.chunks(128) {
            pieces.extend(split.process(chunk));
        }

        assert_eq!(pieces, whole);
        assert!(whole.len() >= 1599);
    }

    #[test]
    fn test_start_audio_sent_once_and_frames_paced() {
        let mut capture = pipeline(4, RecordingGraph::default());

        assert_eq!(capture.on_buffer(&[0.0; 6]).unwrap(), 1);
        assert_eq!(capture.pending_samples(), 2);
        assert_eq!(capture.on_buffer(&[0.0; 3]).unwrap(), 1);
        assert_eq!(capture.pending_samples(), 1);

        let events = &capture.sender().events;
        assert_eq!(events[0], ClientEvent::StartAudio {});
        assert_eq!(events.iter().filter(|e| **e == ClientEvent::StartAudio {}).count(), 1);
        assert_eq!(decode(&events[1]).len(), 4);
        assert_eq!(capture.frames_sent(), 2);
    }

    #[test]
    fn test_frames_preserve_capture_order() {
        let mut capture = pipeline(2, RecordingGraph::default());
        capture.on_buffer(&[0.5, -0.5, 1.0]).unwrap();
        capture.on_buffer(&[-1.0]).unwrap();

        let events = &capture.sender().events;
        assert_eq!(decode(&events[1]), vec![16383, -16384]);
        assert_eq!(decode(&events[2]), vec![32767, -32768]);
    }

    #[test]
    fn test_stop_flushes_then_tears_down_in_order() {
        let mut capture = pipeline(4, RecordingGraph::default());
        capture.on_buffer(&[0.1; 5]).unwrap();

        let report = capture.stop();
        assert!(report.is_clean());
        assert_eq!(
            report.completed,
            vec![
                TeardownStep::FlushAudio,
                TeardownStep::EndAudio,
                TeardownStep::DisconnectProcessor,
                TeardownStep::DisconnectSource,
                TeardownStep::StopTracks,
                TeardownStep::CloseContext,
            ]
        );

        let events = &capture.sender().events;
        assert_eq!(decode(&events[2]).len(), 1);
        assert_eq!(events.last(), Some(&ClientEvent::EndAudio {}));
        assert_eq!(capture.on_buffer(&[0.0]), Err(CaptureError::Stopped));
        assert_eq!(capture.stop(), TeardownReport::default());
    }

    #[test]
    fn test_failed_step_does_not_block_later_steps() {
        let graph = RecordingGraph {
            fail_on: Some(TeardownStep::DisconnectSource),
            ..Default::default()
        };
        let mut capture = pipeline(4, graph);

        let report = capture.stop();
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, TeardownStep::DisconnectSource);
        assert_eq!(
            capture.graph().calls,
            vec![
                TeardownStep::DisconnectProcessor,
                TeardownStep::DisconnectSource,
                TeardownStep::StopTracks,
                TeardownStep::CloseContext,
            ]
        );
        assert_eq!(capture.sender().events, vec![ClientEvent::EndAudio {}]);
    }

    #[test]
    fn test_failed_flush_still_ends_audio() {
        let mut capture = pipeline(4, RecordingGraph::default());
        capture.on_buffer(&[0.1; 2]).unwrap();
        capture.sender.refuse_audio = true;

        let report = capture.stop();
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, TeardownStep::FlushAudio);
        assert_eq!(report.completed[0], TeardownStep::EndAudio);
        assert_eq!(report.completed.len(), 5);
        assert_eq!(
            capture.sender().events,
            vec![ClientEvent::StartAudio {}, ClientEvent::EndAudio {}]
        );
    }
}
