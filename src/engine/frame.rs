//! # Engine Frames and Line Codec
//!
//! The relay talks to the engine subprocess with newline-delimited JSON, one
//! object per line, discriminated by a `type` field:
//!
//! ```text
//! {"type":"start_audio"}
//! {"type":"audio","data":"<base64 pcm>"}
//! {"type":"text","data":"hello"}
//! {"type":"end_audio"}
//! ```
//!
//! The engine answers with the same shapes, plus `debug` and `error`
//! diagnostics. Anything on stdout that is not a recognised frame is kept as
//! plain diagnostic text: engines print their readiness phrase that way.
//!
//! [`FrameCodec`] never assumes a read lines up with a line boundary. It keeps
//! the unterminated tail of each chunk and completes it with the next one.

use crate::error::RelayError;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// One message on the relay/engine channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// Base64-encoded 16-bit little-endian mono PCM.
    Audio { data: String },
    /// Conversation text. Engines write the payload under `text`, the relay
    /// writes it under `data`; both are accepted.
    Text {
        #[serde(alias = "text")]
        data: String,
    },
    Debug { text: String },
    Error { text: String },
    StartAudio,
    EndAudio,
}

impl Frame {
    /// Serialize to one JSON line including the trailing newline.
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    /// Parse one line as a frame. Surrounding whitespace is allowed.
    pub fn parse_line(line: &str) -> Result<Frame, RelayError> {
        serde_json::from_str(line).map_err(|err| RelayError::FrameParse(err.to_string()))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Audio { .. } => "audio",
            Frame::Text { .. } => "text",
            Frame::Debug { .. } => "debug",
            Frame::Error { .. } => "error",
            Frame::StartAudio => "start_audio",
            Frame::EndAudio => "end_audio",
        }
    }
}

/// One decoded unit of engine stdout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineOutput {
    Frame(Frame),
    /// A line that is not a frame: plain text, malformed JSON or an unknown
    /// frame type. Kept verbatim apart from the line terminator.
    Diagnostic(String),
}

impl EngineOutput {
    /// Classify a single complete line (without its terminator).
    pub fn from_line(line: &str) -> Self {
        match Frame::parse_line(line) {
            Ok(frame) => EngineOutput::Frame(frame),
            Err(err) => {
                // Plain text is expected; only JSON that failed to parse is worth a note.
                if line.trim_start().starts_with('{') {
                    debug!(target: "engine", code = err.code(), "{}", err);
                }
                EngineOutput::Diagnostic(line.to_string())
            }
        }
    }
}

/// Default upper bound for a single stdout line.
pub const DEFAULT_MAX_LINE_BYTES: usize = 4 * 1024 * 1024;

/// Incremental newline splitter and frame classifier for engine stdout.
#[derive(Debug)]
pub struct FrameCodec {
    pending: Vec<u8>,
    max_line_bytes: usize,
    /// Set while skipping the rest of an over-long line.
    discarding: bool,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LINE_BYTES)
    }
}

impl FrameCodec {
    pub fn new(max_line_bytes: usize) -> Self {
        Self {
            pending: Vec::new(),
            max_line_bytes,
            discarding: false,
        }
    }

    /// Bytes currently held for an unterminated line.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Feed one chunk and return every output completed by it, in order.
    pub fn decode(&mut self, chunk: &[u8]) -> Vec<EngineOutput> {
        let mut outputs = Vec::new();
        let mut rest = chunk;

        while let Some(pos) = rest.iter().position(|&b| b == b'\n') {
            let (head, tail) = rest.split_at(pos);
            rest = &tail[1..];

            if self.discarding {
                self.discarding = false;
                self.pending.clear();
                continue;
            }

            if self.pending.is_empty() {
                Self::emit(head, &mut outputs);
            } else {
                self.pending.extend_from_slice(head);
                let line = std::mem::take(&mut self.pending);
                Self::emit(&line, &mut outputs);
            }
        }

        if !rest.is_empty() && !self.discarding {
            if self.pending.len() + rest.len() > self.max_line_bytes {
                let held = self.pending.len() + rest.len();
                self.pending.clear();
                self.discarding = true;
                outputs.push(EngineOutput::Diagnostic(format!(
                    "[discarded engine line longer than {} bytes ({} bytes buffered)]",
                    self.max_line_bytes, held
                )));
            } else {
                self.pending.extend_from_slice(rest);
            }
        }

        outputs
    }

    /// Flush an unterminated final line at end of stream.
    pub fn finish(&mut self) -> Option<EngineOutput> {
        self.discarding = false;
        if self.pending.is_empty() {
            return None;
        }
        let line = std::mem::take(&mut self.pending);
        let mut outputs = Vec::with_capacity(1);
        Self::emit(&line, &mut outputs);
        outputs.pop()
    }

    fn emit(raw: &[u8], outputs: &mut Vec<EngineOutput>) {
        let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
        let line = String::from_utf8_lossy(raw);
        if line.trim().is_empty() {
            return;
        }
        outputs.push(EngineOutput::from_line(&line));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const SAMPLE: &str = concat!(
        "{\"type\":\"text\",\"text\":\"Nova Sonic ready!\"}\n",
        "starting up, almost ready\n",
        "{\"type\":\"audio\",\"data\":\"AAECAwQF\"}\r\n",
        "\n",
        "{\"type\":\"debug\",\"text\":\"Processing audio chunk, size: 8\"}\n",
        "{\"type\":\"mystery\",\"value\":1}\n",
        "{\"type\":\"audio\",\"data\":\"BgcICQ==\"}\n",
        "{\"type\":\"error\",\"text\":\"Audio chunk error: timeout\"}\n",
        "{\"type\":\"end_audio\"}\n",
        "{not json\n",
        "h\u{e9}llo w\u{f6}rld\n",
    );

    fn decode_all(codec: &mut FrameCodec, chunks: &[&[u8]]) -> Vec<EngineOutput> {
        let mut outputs = Vec::new();
        for chunk in chunks {
            outputs.extend(codec.decode(chunk));
        }
        outputs.extend(codec.finish());
        outputs
    }

    #[test]
    fn test_classifies_frames_and_diagnostics() {
        let mut codec = FrameCodec::default();
        let outputs = decode_all(&mut codec, &[SAMPLE.as_bytes()]);

        assert_eq!(outputs.len(), 10);
        assert_eq!(
            outputs[0],
            EngineOutput::Frame(Frame::Text { data: "Nova Sonic ready!".to_string() })
        );
        assert_eq!(
            outputs[1],
            EngineOutput::Diagnostic("starting up, almost ready".to_string())
        );
        assert_eq!(
            outputs[2],
            EngineOutput::Frame(Frame::Audio { data: "AAECAwQF".to_string() })
        );
        assert!(matches!(outputs[4], EngineOutput::Diagnostic(ref raw) if raw.contains("mystery")));
        assert_eq!(outputs[7], EngineOutput::Frame(Frame::EndAudio));
        assert_eq!(outputs[8], EngineOutput::Diagnostic("{not json".to_string()));
        assert_eq!(outputs[9], EngineOutput::Diagnostic("h\u{e9}llo w\u{f6}rld".to_string()));
    }

    #[test]
    fn test_holds_partial_line_until_terminated() {
        let mut codec = FrameCodec::default();
        assert!(codec.decode(b"{\"type\":\"audio\",\"da").is_empty());
        assert!(codec.pending_len() > 0);
        let outputs = codec.decode(b"ta\":\"AAAA\"}\n{\"type\"");
        assert_eq!(outputs, vec![EngineOutput::Frame(Frame::Audio { data: "AAAA".to_string() })]);
        assert_eq!(codec.finish(), Some(EngineOutput::Diagnostic("{\"type\"".to_string())));
        assert_eq!(codec.finish(), None);
    }

    #[test]
    fn test_split_inside_utf8_sequence() {
        let line = "caf\u{e9} ready\n".as_bytes();
        let split = line.iter().position(|&b| b == 0xc3).unwrap() + 1;
        let mut codec = FrameCodec::default();
        let outputs = decode_all(&mut codec, &[&line[..split], &line[split..]]);
        assert_eq!(outputs, vec![EngineOutput::Diagnostic("caf\u{e9} ready".to_string())]);
    }

    #[test]
    fn test_overlong_line_is_discarded_once() {
        let mut codec = FrameCodec::new(16);
        let mut outputs = codec.decode(b"0123456789");
        outputs.extend(codec.decode(b"0123456789"));
        outputs.extend(codec.decode(b"more junk\n{\"type\":\"end_audio\"}\n"));

        assert_eq!(outputs.len(), 2);
        assert!(matches!(outputs[0], EngineOutput::Diagnostic(ref msg) if msg.starts_with("[discarded")));
        assert_eq!(outputs[1], EngineOutput::Frame(Frame::EndAudio));
        assert_eq!(codec.pending_len(), 0);
    }

    #[test]
    fn test_diagnostic_lines_keep_their_whitespace() {
        let mut codec = FrameCodec::default();
        let input: &[u8] = b"  indented trace\t\r\n   \n  {\"type\":\"end_audio\"}  \n";
        let outputs = decode_all(&mut codec, &[input]);
        assert_eq!(
            outputs,
            vec![
                EngineOutput::Diagnostic("  indented trace\t".to_string()),
                EngineOutput::Frame(Frame::EndAudio),
            ]
        );
    }

    #[test]
    fn test_unknown_frame_is_parse_error() {
        assert!(matches!(
            Frame::parse_line("{\"type\":\"mystery\"}"),
            Err(RelayError::FrameParse(_))
        ));
        assert_eq!(Frame::parse_line(" {\"type\":\"start_audio\"} "), Ok(Frame::StartAudio));
    }

    #[test]
    fn test_encodes_single_line_frames() {
        assert_eq!(Frame::StartAudio.to_line().unwrap(), "{\"type\":\"start_audio\"}\n");
        assert_eq!(
            Frame::Text { data: "hi\nthere".to_string() }.to_line().unwrap(),
            "{\"type\":\"text\",\"data\":\"hi\\nthere\"}\n"
        );
        let line = Frame::Audio { data: "AAAA".to_string() }.to_line().unwrap();
        assert_eq!(line.matches('\n').count(), 1);
    }

    proptest! {
        #[test]
        fn prop_chunk_boundaries_do_not_change_output(cuts in proptest::collection::vec(0usize..SAMPLE.len(), 0..12)) {
            let bytes = SAMPLE.as_bytes();
            let expected = decode_all(&mut FrameCodec::default(), &[bytes]);

            let mut cuts = cuts;
            cuts.sort_unstable();
            cuts.dedup();
            let mut chunks: Vec<&[u8]> = Vec::new();
            let mut start = 0;
            for cut in cuts {
                chunks.push(&bytes[start..cut]);
                start = cut;
            }
            chunks.push(&bytes[start..]);

            let actual = decode_all(&mut FrameCodec::default(), &chunks);
            prop_assert_eq!(actual, expected);
        }
    }
}
