//! # Wire Messages
//!
//! JSON messages exchanged on the two kinds of sockets a bridge holds.
//!
//! ## Translation service socket:
//! Every message is `{"message_type": ..., "data": ...}`.
//! - Outbound: `set_task` (pipeline settings), `input_audio_data` (base64
//!   PCM), `end_task`
//! - Inbound: `current_task` (settings acknowledged), `output_audio_data`
//!   (base64 PCM), `*_transcription` (text + language), `error`
//!
//! The service sometimes sends `data` as a JSON-encoded string; `parse`
//! unwraps that second layer.
//!
//! ## Telephony media stream:
//! Inbound events are tagged by `event` (`connected`, `start`, `media`,
//! `stop`, `mark`). Outbound audio is a `media` event addressed to the
//! receiving leg's `streamSid`.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::BridgeError;

/// Messages the bridge sends to the translation service.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "message_type", content = "data", rename_all = "snake_case")]
pub enum ServiceRequest {
    SetTask(Value),
    InputAudioData { data: String },
    EndTask { force: bool },
}

impl ServiceRequest {
    /// Wrap raw PCM bytes as an `input_audio_data` message.
    pub fn audio(pcm: &[u8]) -> Self {
        ServiceRequest::InputAudioData {
            data: BASE64.encode(pcm),
        }
    }

    pub fn to_json(&self) -> Result<String, BridgeError> {
        serde_json::to_string(self).map_err(|e| BridgeError::Protocol(e.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranscriptionKind {
    Partial,
    Validated,
    Translated,
    /// Any other `*transcription*` message, e.g. partial translations
    Other,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptionUpdate {
    pub kind: TranscriptionKind,
    pub text: String,
    pub language: String,
}

/// Messages received from the translation service.
#[derive(Debug, Clone, PartialEq)]
pub enum ServiceEvent {
    TaskConfirmed,
    OutputAudio(Vec<u8>),
    Transcription(TranscriptionUpdate),
    Error(String),
    Other(String),
}

impl ServiceEvent {
    pub fn parse(text: &str) -> Result<Self, BridgeError> {
        let mut message: Value =
            serde_json::from_str(text).map_err(|e| BridgeError::Protocol(e.to_string()))?;

        let nested = match message.get("data") {
            Some(Value::String(inner)) => Some(
                serde_json::from_str::<Value>(inner)
                    .map_err(|e| BridgeError::Protocol(format!("nested data: {e}")))?,
            ),
            _ => None,
        };
        if let Some(nested) = nested {
            message["data"] = nested;
        }

        let message_type = message
            .get("message_type")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let data = message.get("data").cloned().unwrap_or(Value::Null);

        let event = match message_type.as_str() {
            "current_task" => ServiceEvent::TaskConfirmed,
            "output_audio_data" => {
                let encoded = data.get("data").and_then(Value::as_str).unwrap_or_default();
                let audio = BASE64
                    .decode(encoded)
                    .map_err(|e| BridgeError::Protocol(format!("output audio: {e}")))?;
                ServiceEvent::OutputAudio(audio)
            }
            "error" => ServiceEvent::Error(data.to_string()),
            t if t.contains("transcription") => {
                let kind = match t {
                    "partial_transcription" => TranscriptionKind::Partial,
                    "validated_transcription" => TranscriptionKind::Validated,
                    "translated_transcription" => TranscriptionKind::Translated,
                    _ => TranscriptionKind::Other,
                };
                let transcription = data.get("transcription").cloned().unwrap_or(Value::Null);
                let field = |name: &str| {
                    transcription
                        .get(name)
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string()
                };
                ServiceEvent::Transcription(TranscriptionUpdate {
                    kind,
                    text: field("text"),
                    language: field("language"),
                })
            }
            other => ServiceEvent::Other(other.to_string()),
        };
        Ok(event)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamStart {
    #[serde(rename = "streamSid")]
    pub stream_sid: String,
    #[serde(rename = "callSid", default)]
    pub call_sid: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MediaPayload {
    pub payload: String,
}

/// Events a telephony leg sends on its media stream.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum LegEvent {
    Connected,
    Start { start: StreamStart },
    Media { media: MediaPayload },
    Stop,
    Mark,
    #[serde(other)]
    Unknown,
}

impl LegEvent {
    pub fn parse(text: &str) -> Result<Self, BridgeError> {
        serde_json::from_str(text).map_err(|e| BridgeError::Protocol(e.to_string()))
    }
}

impl MediaPayload {
    pub fn decode(&self) -> Result<Vec<u8>, BridgeError> {
        BASE64
            .decode(&self.payload)
            .map_err(|e| BridgeError::Protocol(format!("media payload: {e}")))
    }
}

#[derive(Serialize)]
struct OutboundMedia<'a> {
    event: &'static str,
    #[serde(rename = "streamSid")]
    stream_sid: &'a str,
    media: OutboundPayload,
}

#[derive(Serialize)]
struct OutboundPayload {
    payload: String,
}

/// A `media` event carrying mu-law audio to the leg with `stream_sid`.
pub fn media_message(stream_sid: &str, mulaw: &[u8]) -> Result<String, BridgeError> {
    serde_json::to_string(&OutboundMedia {
        event: "media",
        stream_sid,
        media: OutboundPayload {
            payload: BASE64.encode(mulaw),
        },
    })
    .map_err(|e| BridgeError::Protocol(e.to_string()))
}
