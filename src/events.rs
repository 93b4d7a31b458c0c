//! Shared data model for the recognition pipeline
//!
//! State enums published on the bus, the transcript event every backend
//! produces, and the tagged `VoiceEvent` union consumed by subscribers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;

/// Lifecycle of the capture pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecognitionState {
    #[default]
    Inactive,
    /// Armed: waiting on permission or for the backend to come up
    Active,
    Listening,
    Processing,
    Error,
}

impl RecognitionState {
    /// True while a backend is (or is about to be) capturing.
    pub fn is_running(&self) -> bool {
        matches!(
            self,
            RecognitionState::Active | RecognitionState::Listening | RecognitionState::Processing
        )
    }
}

impl std::fmt::Display for RecognitionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecognitionState::Inactive => write!(f, "inactive"),
            RecognitionState::Active => write!(f, "active"),
            RecognitionState::Listening => write!(f, "listening"),
            RecognitionState::Processing => write!(f, "processing"),
            RecognitionState::Error => write!(f, "error"),
        }
    }
}

/// Lifecycle of a single wake → command episode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WakeWordState {
    #[default]
    Inactive,
    Detected,
    ListeningForCommand,
}

/// Microphone access as last observed by the permission gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MicPermission {
    #[default]
    Unknown,
    Prompt,
    Granted,
    Denied,
}

/// A transcription result from either backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptEvent {
    pub text: String,
    /// ASR confidence in 0.0..=1.0
    pub confidence: f32,
    pub is_final: bool,
    pub timestamp: DateTime<Utc>,
}

impl TranscriptEvent {
    pub fn interim(text: impl Into<String>, confidence: f32) -> Self {
        Self {
            text: text.into(),
            confidence: confidence.clamp(0.0, 1.0),
            is_final: false,
            timestamp: Utc::now(),
        }
    }

    pub fn final_result(text: impl Into<String>, confidence: f32) -> Self {
        Self {
            is_final: true,
            ..Self::interim(text, confidence)
        }
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// Events delivered to external subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VoiceEvent {
    WakeWordDetected,
    CommandDetected {
        command: String,
    },
    InterimTranscript {
        text: String,
        confidence: f32,
        #[serde(rename = "isFinal")]
        is_final: bool,
    },
    Error {
        kind: ErrorKind,
        message: String,
        recoverable: bool,
    },
    StateChange {
        state: RecognitionState,
    },
    /// Microphone access is missing; the host should guide the user to grant it
    PermissionRequired,
}

impl std::fmt::Display for VoiceEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VoiceEvent::WakeWordDetected => write!(f, "WAKE_WORD_DETECTED"),
            VoiceEvent::CommandDetected { command } => write!(f, "COMMAND_DETECTED ({})", command),
            VoiceEvent::InterimTranscript { text, is_final, .. } => {
                write!(f, "TRANSCRIPT{} ({})", if *is_final { "" } else { "~" }, text)
            }
            VoiceEvent::Error {
                kind, recoverable, ..
            } => write!(
                f,
                "ERROR ({:?}, {})",
                kind,
                if *recoverable { "retrying" } else { "terminal" }
            ),
            VoiceEvent::StateChange { state } => write!(f, "STATE_CHANGE ({})", state),
            VoiceEvent::PermissionRequired => write!(f, "PERMISSION_REQUIRED"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization() {
        let event = VoiceEvent::CommandDetected {
            command: "request backup".to_string(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"command_detected\""));
        assert!(json.contains("request backup"));
    }

    #[test]
    fn test_interim_transcript_uses_is_final_key() {
        let event = VoiceEvent::InterimTranscript {
            text: "hey".to_string(),
            confidence: 0.5,
            is_final: false,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"isFinal\":false"));
    }

    #[test]
    fn test_event_deserialization() {
        let json = r#"{"type":"permission_required"}"#;
        let event: VoiceEvent = serde_json::from_str(json).unwrap();
        assert!(matches!(event, VoiceEvent::PermissionRequired));
    }

    #[test]
    fn transcript_confidence_is_clamped() {
        let t = TranscriptEvent::final_result("hey lark", 1.7);
        assert_eq!(t.confidence, 1.0);
        assert!(t.is_final);
    }

    #[test]
    fn running_states() {
        assert!(!RecognitionState::Inactive.is_running());
        assert!(RecognitionState::Active.is_running());
        assert!(RecognitionState::Processing.is_running());
        assert!(!RecognitionState::Error.is_running());
    }
}
