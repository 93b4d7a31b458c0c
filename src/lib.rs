//! Wake-phrase voice command front end.
//!
//! Audio flows from a capture source into a transcription backend (streaming
//! over the OpenAI Realtime API, or batch windows posted to a Whisper-style
//! endpoint). Transcripts are fed as events into a pure state machine that
//! spots the wake phrase, segments commands and decides retries. Effects run
//! on a single runner; everything observable goes out through the event bus.
//!
//! [`VoiceService`] is the entry point.

pub mod audio;
pub mod backoff;
pub mod bus;
pub mod connectivity;
pub mod diagnostics;
pub mod effects;
pub mod error;
pub mod events;
pub mod permission;
pub mod segmenter;
pub mod service;
pub mod settings;
pub mod state_machine;
pub mod streaming;
pub mod transcription;
pub mod wake_word;

pub use audio::{AudioCaptureEncoder, AudioError, AudioSource, MicrophoneSource};
pub use backoff::{BackoffPolicy, RetryTracker};
pub use bus::{EventBus, StateSubscription, Subscription};
pub use connectivity::ConnectivityProbe;
pub use diagnostics::{Diagnostics, ErrorEntry, ErrorLog};
pub use error::{ErrorKind, VoiceError};
pub use events::{MicPermission, RecognitionState, TranscriptEvent, VoiceEvent, WakeWordState};
pub use permission::{DevicePermissionProvider, PermissionGate, PermissionProvider};
pub use segmenter::CommandSegmenter;
pub use service::{ServiceDeps, VoiceService};
pub use settings::{OptionsUpdate, VoiceSettings};
pub use streaming::{RealtimeEngine, StreamingEngine};
pub use transcription::{
    BackendFactory, BackendKind, BatchTranscriber, DefaultBackendFactory, TranscriptionBackend,
    WhisperClient,
};
pub use wake_word::WakeWordMatcher;
