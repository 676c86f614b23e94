//! # Client Wire Protocol
//!
//! Every WebSocket text message is one JSON envelope:
//!
//! ```json
//! {"event": "audio-input", "data": {"data": "<base64 pcm>"}}
//! ```
//!
//! Events without a payload may omit `data` or send `{}` / `null`.

use serde::{Deserialize, Serialize};

/// Events sent by the browser client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientEvent {
    StartVoice {
        #[serde(rename = "voiceId", default, skip_serializing_if = "Option::is_none")]
        voice_id: Option<String>,
        #[serde(rename = "sessionId", default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
    StartAudio {},
    AudioInput { data: String },
    TextInput { text: String },
    EndAudio {},
    StopVoice {},
}

impl ClientEvent {
    /// Parse one client message, tolerating a missing or `null` payload.
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        let mut value: serde_json::Value = serde_json::from_str(text)?;
        if let Some(envelope) = value.as_object_mut() {
            let empty = envelope.get("data").map_or(true, |data| data.is_null());
            if empty {
                envelope.insert("data".to_string(), serde_json::json!({}));
            }
        }
        serde_json::from_value(value)
    }

    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::StartVoice { .. } => "start-voice",
            ClientEvent::StartAudio {} => "start-audio",
            ClientEvent::AudioInput { .. } => "audio-input",
            ClientEvent::TextInput { .. } => "text-input",
            ClientEvent::EndAudio {} => "end-audio",
            ClientEvent::StopVoice {} => "stop-voice",
        }
    }
}

/// Events sent to the browser client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
    SessionReady {},
    AudioChunk { data: String },
    TextMessage { text: String },
    Error { message: String },
    SessionEnded { reason: String },
}

impl ServerEvent {
    pub fn error(message: impl Into<String>) -> Self {
        ServerEvent::Error {
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
