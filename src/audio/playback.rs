//! # Client Playback Jitter Buffer
//!
//! Engine audio arrives as irregular base64 chunks. Playing each one as it
//! lands produces gaps and clicks, so chunks are collected and played as
//! larger clips.
//!
//! ## Flush rules:
//! - at least `min_chunks` buffered: play now
//! - otherwise: play once `flush_delay` has passed since the first chunk
//! - while a clip is playing nothing is flushed; when it completes, enough
//!   buffered chunks chain straight into the next clip, fewer wait the delay
//!
//! A chunk that does not decode (bad base64, or an odd number of PCM bytes
//! overall) clears the whole buffer. So does an output failure.

use crate::audio::wav::wrap_pcm16_mono;
use crate::config::AudioConfig;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use futures_util::future::BoxFuture;
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackError {
    /// A buffered chunk was not valid 16-bit PCM.
    Decode(String),
    /// The output device failed to play a clip.
    Output(String),
}

impl fmt::Display for PlaybackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlaybackError::Decode(msg) => write!(f, "Failed to decode audio chunk: {}", msg),
            PlaybackError::Output(msg) => write!(f, "Audio output failed: {}", msg),
        }
    }
}

impl std::error::Error for PlaybackError {}

/// Where finished clips go. `play` resolves when the clip has finished.
pub trait AudioOutput {
    fn play(&self, wav: Vec<u8>) -> BoxFuture<'static, Result<(), PlaybackError>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JitterConfig {
    pub sample_rate: u32,
    pub flush_delay: Duration,
    pub min_chunks: usize,
}

impl Default for JitterConfig {
    fn default() -> Self {
        Self {
            sample_rate: 24000,
            flush_delay: Duration::from_millis(120),
            min_chunks: 4,
        }
    }
}

impl JitterConfig {
    pub fn from_audio(audio: &AudioConfig) -> Self {
        Self {
            sample_rate: audio.output_sample_rate,
            flush_delay: Duration::from_millis(audio.playback_flush_delay_ms),
            min_chunks: audio.playback_min_chunks.max(1),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlaybackStats {
    pub clips_played: u64,
    pub chunks_played: u64,
    pub decode_errors: u64,
    pub output_errors: u64,
}

pub struct JitterBuffer {
    config: JitterConfig,
    chunks: Vec<String>,
    deadline: Option<Instant>,
    playing: bool,
    stats: PlaybackStats,
}

impl JitterBuffer {
    pub fn new(config: JitterConfig) -> Self {
        Self {
            config,
            chunks: Vec::new(),
            deadline: None,
            playing: false,
            stats: PlaybackStats::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn is_playing(&self) -> bool {
        self.playing
    }

    pub fn stats(&self) -> PlaybackStats {
        self.stats
    }

    /// When the buffer wants to be polled next, if ever.
    pub fn next_deadline(&self) -> Option<Instant> {
        if self.playing {
            None
        } else {
            self.deadline
        }
    }

    /// Add a chunk. Returns a clip if the chunk count threshold was reached.
    pub fn push(&mut self, chunk: String, now: Instant) -> Result<Option<Vec<u8>>, PlaybackError> {
        self.chunks.push(chunk);
        if self.playing {
            return Ok(None);
        }
        if self.chunks.len() >= self.config.min_chunks {
            return self.flush().map(Some);
        }
        if self.deadline.is_none() {
            self.deadline = Some(now + self.config.flush_delay);
        }
        Ok(None)
    }

    /// Flush if the delay has run out.
    pub fn poll(&mut self, now: Instant) -> Result<Option<Vec<u8>>, PlaybackError> {
        match self.deadline {
            Some(deadline) if !self.playing && now >= deadline && !self.chunks.is_empty() => {
                self.flush().map(Some)
            }
            _ => Ok(None),
        }
    }

    /// The current clip finished. Chains the next one if enough is buffered.
    pub fn on_playback_complete(&mut self, now: Instant) -> Result<Option<Vec<u8>>, PlaybackError> {
        self.playing = false;
        self.stats.clips_played += 1;
        if self.chunks.len() >= self.config.min_chunks {
            return self.flush().map(Some);
        }
        self.deadline = if self.chunks.is_empty() {
            None
        } else {
            Some(now + self.config.flush_delay)
        };
        Ok(None)
    }

    /// The current clip failed. Everything buffered is dropped.
    pub fn on_playback_error(&mut self, err: &PlaybackError) {
        warn!(error = %err, dropped = self.chunks.len(), "Playback failed, clearing buffer");
        self.stats.output_errors += 1;
        self.clear();
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
        self.deadline = None;
        self.playing = false;
    }

    fn flush(&mut self) -> Result<Vec<u8>, PlaybackError> {
        let chunks = std::mem::take(&mut self.chunks);
        self.deadline = None;

        let mut pcm = Vec::new();
        for chunk in &chunks {
            if let Err(err) = STANDARD.decode_vec(chunk.as_bytes(), &mut pcm) {
                return Err(self.decode_failure(err.to_string()));
            }
        }
        if pcm.len() % 2 != 0 {
            return Err(self.decode_failure(format!("odd PCM length {}", pcm.len())));
        }

        self.playing = true;
        self.stats.chunks_played += chunks.len() as u64;
        debug!(chunks = chunks.len(), bytes = pcm.len(), "Flushing playback clip");
        Ok(wrap_pcm16_mono(&pcm, self.config.sample_rate))
    }

    fn decode_failure(&mut self, msg: String) -> PlaybackError {
        self.stats.decode_errors += 1;
        self.clear();
        let err = PlaybackError::Decode(msg);
        warn!(error = %err, "Dropping buffered audio");
        err
    }
}

/// Drive a [`JitterBuffer`] from a chunk channel until the channel closes and
/// everything buffered has been played.
pub async fn run_playback<O: AudioOutput>(
    mut chunks: mpsc::Receiver<String>,
    output: O,
    config: JitterConfig,
) -> PlaybackStats {
    let mut buffer = JitterBuffer::new(config);
    let mut current: Option<BoxFuture<'static, Result<(), PlaybackError>>> = None;
    let mut open = true;

    loop {
        if !open && current.is_none() && buffer.is_empty() {
            break;
        }

        let deadline = buffer.next_deadline();
        let playing = async {
            match current.as_mut() {
                Some(clip) => clip.await,
                None => std::future::pending().await,
            }
        };

        let clip = tokio::select! {
            chunk = chunks.recv(), if open => match chunk {
                Some(chunk) => buffer.push(chunk, Instant::now()),
                None => {
                    open = false;
                    Ok(None)
                }
            },
            result = playing => {
                current = None;
                match result {
                    Ok(()) => buffer.on_playback_complete(Instant::now()),
                    Err(err) => {
                        buffer.on_playback_error(&err);
                        Ok(None)
                    }
                }
            },
            _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                buffer.poll(Instant::now())
            },
        };

        match clip {
            Ok(Some(wav)) => current = Some(output.play(wav)),
            Ok(None) => {}
            Err(err) => debug!(error = %err, "Playback clip skipped"),
        }
    }

    buffer.stats()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::wav::WAV_HEADER_LEN;
    use std::sync::{Arc, Mutex};

    fn chunk(samples: usize) -> String {
        STANDARD.encode(vec![1u8; samples * 2])
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_for_delay_below_threshold() {
        let mut buffer = JitterBuffer::new(JitterConfig::default());
        let t0 = Instant::now();

        for _ in 0..3 {
            assert_eq!(buffer.push(chunk(10), t0).unwrap(), None);
        }
        assert_eq!(buffer.next_deadline(), Some(t0 + Duration::from_millis(120)));
        assert_eq!(buffer.poll(t0 + Duration::from_millis(100)).unwrap(), None);

        let wav = buffer.poll(t0 + Duration::from_millis(120)).unwrap().unwrap();
        assert_eq!(wav.len(), WAV_HEADER_LEN + 60);
        assert!(buffer.is_empty());
        assert!(buffer.is_playing());
    }

    #[tokio::test(start_paused = true)]
    async fn test_threshold_flushes_immediately() {
        let mut buffer = JitterBuffer::new(JitterConfig::default());
        let now = Instant::now();
        for _ in 0..3 {
            buffer.push(chunk(4), now).unwrap();
        }
        let wav = buffer.push(chunk(4), now).unwrap().unwrap();
        assert_eq!(wav.len(), WAV_HEADER_LEN + 32);
    }

    #[tokio::test(start_paused = true)]
    async fn test_completion_chains_or_rearms() {
        let mut buffer = JitterBuffer::new(JitterConfig::default());
        let now = Instant::now();
        for _ in 0..4 {
            buffer.push(chunk(2), now).unwrap();
        }
        assert!(buffer.is_playing());

        for _ in 0..4 {
            assert_eq!(buffer.push(chunk(2), now).unwrap(), None);
        }
        assert_eq!(buffer.next_deadline(), None);
        assert!(buffer.on_playback_complete(now).unwrap().is_some());

        buffer.push(chunk(2), now).unwrap();
        let later = now + Duration::from_millis(50);
        assert_eq!(buffer.on_playback_complete(later).unwrap(), None);
        assert_eq!(buffer.next_deadline(), Some(later + Duration::from_millis(120)));
        assert_eq!(buffer.stats().clips_played, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bad_chunk_clears_buffer() {
        let mut buffer = JitterBuffer::new(JitterConfig::default());
        let now = Instant::now();
        buffer.push(chunk(2), now).unwrap();
        buffer.push("!!not base64!!".to_string(), now).unwrap();
        buffer.push(chunk(2), now).unwrap();

        assert!(matches!(
            buffer.push(chunk(2), now),
            Err(PlaybackError::Decode(_))
        ));
        assert!(buffer.is_empty());
        assert!(!buffer.is_playing());
        assert_eq!(buffer.next_deadline(), None);
        assert_eq!(buffer.stats().decode_errors, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_odd_length_is_decode_error() {
        let mut buffer = JitterBuffer::new(JitterConfig::default());
        let now = Instant::now();
        buffer.push(STANDARD.encode([1u8, 2, 3]), now).unwrap();
        assert!(matches!(
            buffer.poll(now + Duration::from_millis(120)),
            Err(PlaybackError::Decode(_))
        ));
        assert!(buffer.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_output_error_clears_buffer() {
        let mut buffer = JitterBuffer::new(JitterConfig::default());
        let now = Instant::now();
        for _ in 0..5 {
            buffer.push(chunk(2), now).unwrap();
        }
        assert_eq!(buffer.len(), 1);
        buffer.on_playback_error(&PlaybackError::Output("device lost".to_string()));
        assert!(buffer.is_empty());
        assert!(!buffer.is_playing());
        assert_eq!(buffer.stats().output_errors, 1);
    }

    #[derive(Clone)]
    struct RecordingOutput {
        clips: Arc<Mutex<Vec<usize>>>,
        clip_duration: Duration,
    }

    impl AudioOutput for RecordingOutput {
        fn play(&self, wav: Vec<u8>) -> BoxFuture<'static, Result<(), PlaybackError>> {
            let clips = self.clips.clone();
            let duration = self.clip_duration;
            Box::pin(async move {
                clips.lock().unwrap().push(wav.len() - WAV_HEADER_LEN);
                tokio::time::sleep(duration).await;
                Ok(())
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduler_plays_everything_in_clips() {
        let (tx, rx) = mpsc::channel(32);
        let output = RecordingOutput {
            clips: Arc::new(Mutex::new(Vec::new())),
            clip_duration: Duration::from_millis(200),
        };
        let task = tokio::spawn(run_playback(rx, output.clone(), JitterConfig::default()));

        for _ in 0..6 {
            tx.send(chunk(10)).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        tx.send(chunk(10)).await.unwrap();
        drop(tx);

        let stats = task.await.unwrap();
        assert_eq!(stats.chunks_played, 7);
        assert_eq!(stats.decode_errors, 0);

        let clips = output.clips.lock().unwrap().clone();
        assert_eq!(clips.iter().sum::<usize>(), 7 * 20);
        assert_eq!(clips[0], 4 * 20);
        assert_eq!(clips.len() as u64, stats.clips_played);
    }
}
