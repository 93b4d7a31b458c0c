//! Audio capture and encoding
//!
//! Microphone input runs through CPAL on a dedicated thread; frames cross into
//! async code over a bounded channel. Batch transcription windows are encoded
//! to WAV in memory with hound and gated with WebRTC VAD.

pub mod capture;
pub mod encoder;
pub mod vad;

use thiserror::Error;

use crate::error::ErrorKind;

pub use capture::{AudioSource, CaptureGuard, CaptureStream, DeviceLease, Frame, MicrophoneSource};
pub use encoder::AudioCaptureEncoder;

/// Errors that can occur during audio capture and encoding.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum AudioError {
    #[error("No audio input device found")]
    NoInputDevice,

    #[error("No supported audio configuration")]
    NoSupportedConfig,

    #[error("Audio input device is already in use")]
    DeviceBusy,

    #[error("Microphone access denied: {0}")]
    PermissionDenied(String),

    #[error("Failed to create audio stream: {0}")]
    StreamCreationFailed(String),

    #[error("Failed to encode WAV: {0}")]
    EncodeFailed(String),

    #[error("Unsupported audio format: {0}")]
    UnsupportedFormat(String),
}

impl From<&AudioError> for ErrorKind {
    fn from(err: &AudioError) -> Self {
        match err {
            AudioError::NoInputDevice | AudioError::NoSupportedConfig => ErrorKind::DeviceNotFound,
            AudioError::DeviceBusy => ErrorKind::DeviceBusy,
            AudioError::PermissionDenied(_) => ErrorKind::PermissionDenied,
            AudioError::StreamCreationFailed(_)
            | AudioError::EncodeFailed(_)
            | AudioError::UnsupportedFormat(_) => ErrorKind::Unknown,
        }
    }
}

impl From<AudioError> for crate::error::VoiceError {
    fn from(err: AudioError) -> Self {
        crate::error::VoiceError::backend(ErrorKind::from(&err), err.to_string())
    }
}
