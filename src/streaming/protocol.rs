//! OpenAI Realtime API message types (transcription sessions)
//!
//! The session runs with server-side VAD so every spoken turn is committed by
//! the server and produces its own `completed` event. The client only ever
//! appends audio.

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};

pub const REALTIME_API_URL: &str =
    "wss://api.openai.com/v1/realtime?model=gpt-4o-realtime-preview-2024-12-17";

/// Sample rate the Realtime API expects for pcm16 input
pub const REALTIME_SAMPLE_RATE: u32 = 24_000;

const DEFAULT_TRANSCRIPTION_MODEL: &str = "whisper-1";

/// Silence that ends a turn
const DEFAULT_SILENCE_MS: u32 = 600;
const DEFAULT_PREFIX_PADDING_MS: u32 = 300;
const DEFAULT_VAD_THRESHOLD: f32 = 0.5;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modalities: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_audio_format: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_audio_transcription: Option<TranscriptionConfig>,

    /// `None` serializes as `null`, which disables server turn detection
    pub turn_detection: Option<TurnDetection>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::continuous(DEFAULT_TRANSCRIPTION_MODEL)
    }
}

impl SessionConfig {
    /// Always-on transcription: server VAD splits the audio into turns.
    pub fn continuous(model: &str) -> Self {
        Self {
            modalities: Some(vec!["text".to_string()]),
            input_audio_format: Some("pcm16".to_string()),
            input_audio_transcription: Some(TranscriptionConfig {
                model: model.to_string(),
            }),
            turn_detection: Some(TurnDetection::server_vad()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptionConfig {
    pub model: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnDetection {
    #[serde(rename = "type")]
    pub detection_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prefix_padding_ms: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub silence_duration_ms: Option<u32>,
}

impl TurnDetection {
    pub fn server_vad() -> Self {
        Self {
            detection_type: "server_vad".to_string(),
            threshold: Some(DEFAULT_VAD_THRESHOLD),
            prefix_padding_ms: Some(DEFAULT_PREFIX_PADDING_MS),
            silence_duration_ms: Some(DEFAULT_SILENCE_MS),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionInfo {
    pub id: String,
    #[serde(default)]
    pub model: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ErrorInfo {
    #[serde(rename = "type", default)]
    pub error_type: String,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: String,
}

impl ErrorInfo {
    /// Credential problems are not worth retrying quickly.
    pub fn is_auth(&self) -> bool {
        matches!(
            self.code.as_deref(),
            Some("invalid_api_key") | Some("insufficient_quota")
        ) || self.error_type == "authentication_error"
    }
}

/// Messages sent to the Realtime API
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "session.update")]
    SessionUpdate { session: SessionConfig },

    /// Base64 little-endian PCM16
    #[serde(rename = "input_audio_buffer.append")]
    AudioAppend { audio: String },
}

impl ClientMessage {
    pub fn session_update(session: SessionConfig) -> Self {
        Self::SessionUpdate { session }
    }

    pub fn audio_append(samples: &[i16]) -> Self {
        let bytes: Vec<u8> = samples.iter().flat_map(|&s| s.to_le_bytes()).collect();
        Self::AudioAppend {
            audio: STANDARD.encode(&bytes),
        }
    }
}

/// Messages received from the Realtime API
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "session.created")]
    SessionCreated { session: SessionInfo },

    #[serde(rename = "session.updated")]
    SessionUpdated { session: SessionInfo },

    #[serde(rename = "error")]
    Error { error: ErrorInfo },

    #[serde(rename = "conversation.item.input_audio_transcription.delta")]
    TranscriptDelta {
        #[serde(default)]
        item_id: Option<String>,
        delta: String,
    },

    #[serde(rename = "conversation.item.input_audio_transcription.completed")]
    TranscriptCompleted {
        #[serde(default)]
        item_id: Option<String>,
        transcript: String,
    },

    /// Transcription of one turn failed; the session itself stays up
    #[serde(rename = "conversation.item.input_audio_transcription.failed")]
    TranscriptFailed {
        #[serde(default)]
        item_id: Option<String>,
        #[serde(default)]
        error: ErrorInfo,
    },

    #[serde(rename = "input_audio_buffer.speech_started")]
    SpeechStarted {
        #[serde(default)]
        audio_start_ms: Option<u64>,
    },

    #[serde(rename = "input_audio_buffer.speech_stopped")]
    SpeechStopped {
        #[serde(default)]
        audio_end_ms: Option<u64>,
    },

    /// Anything else (response events, rate limits, ...)
    #[serde(other)]
    Unknown,
}
