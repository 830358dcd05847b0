//! Realtime API protocol types
//!
//! JSON message types exchanged with the realtime service over WebSocket.
//!
//! # Protocol Overview
//!
//! 1. Connect to `wss://…/v1/realtime?model=<model>`
//! 2. Send `session.update` (handshake) with the session configuration
//! 3. Receive `session.created` carrying the remote session id
//! 4. Stream audio via `input_audio_buffer.append`
//! 5. Everything else the server sends is forwarded opaquely

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Session configuration sent in `session.update`
///
/// Every field is optional so the same type doubles as a partial update:
/// `merge` copies only the fields that are set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Output modalities, e.g. `["text", "audio"]`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modalities: Option<Vec<String>>,

    /// Voice used for audio output
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,

    /// System instructions for the remote model
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,

    /// Input audio format - "pcm16" for raw PCM
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_audio_format: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_audio_format: Option<String>,

    /// Input audio transcription settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_audio_transcription: Option<TranscriptionConfig>,

    /// Turn detection - None leaves the server default in place
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn_detection: Option<TurnDetection>,
}

impl SessionConfig {
    /// Speech-to-speech translation preset used for the handshake
    pub fn translation() -> Self {
        Self {
            model: None,
            modalities: Some(vec!["text".to_string(), "audio".to_string()]),
            voice: Some("alloy".to_string()),
            instructions: None,
            input_audio_format: Some("pcm16".to_string()),
            output_audio_format: Some("pcm16".to_string()),
            input_audio_transcription: Some(TranscriptionConfig {
                model: "whisper-1".to_string(),
            }),
            turn_detection: Some(TurnDetection::server_vad()),
        }
    }

    /// Copy every field that is set in `patch` over this config
    pub fn merge(&mut self, patch: SessionConfig) {
        if patch.model.is_some() {
            self.model = patch.model;
        }
        if patch.modalities.is_some() {
            self.modalities = patch.modalities;
        }
        if patch.voice.is_some() {
            self.voice = patch.voice;
        }
        if patch.instructions.is_some() {
            self.instructions = patch.instructions;
        }
        if patch.input_audio_format.is_some() {
            self.input_audio_format = patch.input_audio_format;
        }
        if patch.output_audio_format.is_some() {
            self.output_audio_format = patch.output_audio_format;
        }
        if patch.input_audio_transcription.is_some() {
            self.input_audio_transcription = patch.input_audio_transcription;
        }
        if patch.turn_detection.is_some() {
            self.turn_detection = patch.turn_detection;
        }
    }
}

/// Transcription model configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptionConfig {
    pub model: String,
}

/// Turn detection parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnDetection {
    /// Type of turn detection ("server_vad")
    #[serde(rename = "type")]
    pub detection_type: String,

    /// Activation threshold (0.0 - 1.0)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix_padding_ms: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub silence_duration_ms: Option<u32>,
}

impl TurnDetection {
    pub fn server_vad() -> Self {
        Self {
            detection_type: "server_vad".to_string(),
            threshold: Some(0.5),
            prefix_padding_ms: Some(300),
            silence_duration_ms: Some(500),
        }
    }
}

/// Session information returned by the server
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RemoteSession {
    /// Remote-assigned session ID
    pub id: String,

    #[serde(default)]
    pub model: String,

    #[serde(default)]
    pub modalities: Vec<String>,
}

/// Error information from the server
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ErrorInfo {
    /// Error kind
    #[serde(rename = "type", default)]
    pub error_type: String,

    #[serde(default)]
    pub code: Option<String>,

    /// Human-readable message
    #[serde(default)]
    pub message: String,

    /// Offending parameter, if any
    #[serde(default)]
    pub param: Option<String>,
}

// ============================================================================
// Client Messages (sent TO the service)
// ============================================================================

/// Messages sent from client to the realtime service
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Update session configuration (also the connect handshake)
    #[serde(rename = "session.update")]
    SessionUpdate { session: SessionConfig },

    /// Append audio data to the input buffer
    #[serde(rename = "input_audio_buffer.append")]
    AudioAppend {
        /// Base64-encoded PCM16 audio data
        audio: String,
    },

    /// Commit the audio buffer for processing
    #[serde(rename = "input_audio_buffer.commit")]
    AudioCommit,

    /// Clear the audio buffer
    #[serde(rename = "input_audio_buffer.clear")]
    AudioClear,
}

impl ClientMessage {
    pub fn session_update(session: SessionConfig) -> Self {
        Self::SessionUpdate { session }
    }

    /// Create an audio append message from raw PCM16 little-endian bytes
    pub fn audio_append(bytes: &[u8]) -> Self {
        Self::AudioAppend {
            audio: STANDARD.encode(bytes),
        }
    }

    pub fn audio_commit() -> Self {
        Self::AudioCommit
    }

    pub fn audio_clear() -> Self {
        Self::AudioClear
    }
}

// ============================================================================
// Server Messages (received FROM the service)
// ============================================================================

/// Messages received from the realtime service
///
/// Only the kinds this client acts on are modelled; everything else is kept
/// verbatim in `Other` and forwarded to event handlers.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    /// Session was created; carries the remote session id
    SessionCreated { session: RemoteSession },

    /// Session configuration was accepted
    SessionUpdated { session: RemoteSession },

    /// An error occurred on the server side
    Error { error: ErrorInfo },

    /// Any other message kind
    Other { kind: String, payload: Value },
}

#[derive(Deserialize)]
struct SessionEnvelope {
    session: RemoteSession,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ErrorInfo,
}

impl ServerMessage {
    /// Parse one inbound text frame
    pub fn parse(text: &str) -> Result<Self, String> {
        let value: Value = serde_json::from_str(text).map_err(|e| e.to_string())?;
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| "message has no \"type\" field".to_string())?
            .to_string();

        match kind.as_str() {
            "session.created" => {
                let envelope: SessionEnvelope =
                    serde_json::from_value(value).map_err(|e| e.to_string())?;
                Ok(ServerMessage::SessionCreated {
                    session: envelope.session,
                })
            }
            "session.updated" => {
                let envelope: SessionEnvelope =
                    serde_json::from_value(value).map_err(|e| e.to_string())?;
                Ok(ServerMessage::SessionUpdated {
                    session: envelope.session,
                })
            }
            "error" => {
                let envelope: ErrorEnvelope =
                    serde_json::from_value(value).map_err(|e| e.to_string())?;
                Ok(ServerMessage::Error {
                    error: envelope.error,
                })
            }
            _ => Ok(ServerMessage::Other {
                kind,
                payload: value,
            }),
        }
    }

    /// The wire `type` of this message
    pub fn kind(&self) -> &str {
        match self {
            ServerMessage::SessionCreated { .. } => "session.created",
            ServerMessage::SessionUpdated { .. } => "session.updated",
            ServerMessage::Error { .. } => "error",
            ServerMessage::Other { kind, .. } => kind,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, ServerMessage::Error { .. })
    }

    pub fn error_info(&self) -> Option<&ErrorInfo> {
        match self {
            ServerMessage::Error { error } => Some(error),
            _ => None,
        }
    }

    /// Extract session ID if this is a session created/updated message
    pub fn session_id(&self) -> Option<&str> {
        match self {
            ServerMessage::SessionCreated { session } => Some(&session.id),
            ServerMessage::SessionUpdated { session } => Some(&session.id),
            _ => None,
        }
    }
}
