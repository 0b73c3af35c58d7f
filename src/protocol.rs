//! Client-facing WebSocket protocol
//!
//! # Client → server
//!
//! - Binary messages: PCM16 audio frames
//! - Text messages: `{"type":"start_recording"}`, `{"type":"stop_recording"}`,
//!   `{"type":"generate_tts","text":"..."}`. The bare words `start_recording`
//!   and `stop_recording` are accepted too.
//!
//! # Server → client
//!
//! JSON objects tagged by `type`, see [`ServerMessage`]. Audio is base64.

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::capabilities::Service;
use crate::error::{ErrorKind, SessionError};

/// Control messages from the client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    StartRecording,
    StopRecording,
    GenerateTts { text: String },
}

impl ClientMessage {
    /// Parse a text frame from the client
    pub fn parse(text: &str) -> Result<Self, SessionError> {
        let trimmed = text.trim();
        match trimmed {
            "start_recording" => return Ok(ClientMessage::StartRecording),
            "stop_recording" => return Ok(ClientMessage::StopRecording),
            "" => return Err(SessionError::Validation("empty control message".to_string())),
            _ => {}
        }

        let msg: ClientMessage = serde_json::from_str(trimmed).map_err(|e| {
            SessionError::Validation(format!("unrecognized control message: {}", e))
        })?;

        if let ClientMessage::GenerateTts { text } = &msg {
            if text.trim().is_empty() {
                return Err(SessionError::Validation(
                    "generate_tts requires non-empty text".to_string(),
                ));
            }
        }
        Ok(msg)
    }
}

/// Everything the connection reader hands to a session
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Audio(Vec<u8>),
    Control(ClientMessage),
    /// Text frame that failed to parse
    Invalid(String),
}

impl Inbound {
    pub fn from_text(text: &str) -> Self {
        match ClientMessage::parse(text) {
            Ok(msg) => Inbound::Control(msg),
            Err(e) => Inbound::Invalid(e.to_string()),
        }
    }
}

/// Outbound events, in generation order per session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Status {
        message: String,
    },
    Transcription {
        text: String,
        is_final: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        confidence: Option<f32>,
    },
    TurnDetection {
        text: String,
        duration_ms: u64,
    },
    LlmResponseStart {
        turn_id: Uuid,
    },
    LlmChunk {
        turn_id: Uuid,
        index: usize,
        text: String,
    },
    LlmResponseEnd {
        turn_id: Uuid,
        text: String,
    },
    StreamingAudio {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        turn_id: Option<Uuid>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        index: Option<usize>,
        /// Base64-encoded audio bytes
        audio: String,
        is_fallback: bool,
    },
    ServiceStatus {
        service: Service,
        connected: bool,
        message: String,
    },
    Error {
        kind: ErrorKind,
        message: String,
    },
}

impl ServerMessage {
    pub fn status(message: impl Into<String>) -> Self {
        ServerMessage::Status {
            message: message.into(),
        }
    }

    pub fn audio(turn_id: Option<Uuid>, index: Option<usize>, bytes: &[u8], is_fallback: bool) -> Self {
        ServerMessage::StreamingAudio {
            turn_id,
            index,
            audio: STANDARD.encode(bytes),
            is_fallback,
        }
    }

    pub fn error(err: &SessionError) -> Self {
        ServerMessage::Error {
            kind: err.kind(),
            message: err.to_string(),
        }
    }

    pub fn service_status(service: Service, connected: bool, message: impl Into<String>) -> Self {
        ServerMessage::ServiceStatus {
            service,
            connected,
            message: message.into(),
        }
    }

    /// Event name, for logging
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::Status { .. } => "status",
            ServerMessage::Transcription { .. } => "transcription",
            ServerMessage::TurnDetection { .. } => "turn_detection",
            ServerMessage::LlmResponseStart { .. } => "llm_response_start",
            ServerMessage::LlmChunk { .. } => "llm_chunk",
            ServerMessage::LlmResponseEnd { .. } => "llm_response_end",
            ServerMessage::StreamingAudio { .. } => "streaming_audio",
            ServerMessage::ServiceStatus { .. } => "service_status",
            ServerMessage::Error { .. } => "error",
        }
    }

    /// Decode the audio payload of a `streaming_audio` event
    pub fn audio_bytes(&self) -> Option<Vec<u8>> {
        match self {
            ServerMessage::StreamingAudio { audio, .. } => STANDARD.decode(audio).ok(),
            _ => None,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
