//! Continuous speech-to-text over the OpenAI Realtime API
//!
//! ```text
//! CaptureStream ──▶ AudioStreamer ──▶ RealtimeSession (WebSocket)
//!                                           │
//!                           server messages ▼
//!                                   TranscriptAggregator ──▶ EngineUpdate
//! ```
//!
//! The engine makes a single connection attempt and reports failures through
//! its update channel; restarting is left to the recognition state machine.

mod audio_streamer;
mod engine;
mod protocol;
mod realtime_client;
mod transcript_aggregator;

use futures_util::future::BoxFuture;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::audio::Frame;
use crate::error::ErrorKind;

pub use audio_streamer::{downsample, AudioStreamer, StreamerConfig};
pub use engine::{RealtimeEngine, STREAMING_CONFIDENCE};
pub use protocol::{ClientMessage, ServerMessage, SessionConfig, REALTIME_API_URL};
pub use realtime_client::{get_api_key, RealtimeSession};
pub use transcript_aggregator::TranscriptAggregator;

#[derive(Debug, Clone, Error)]
pub enum StreamingError {
    #[error("OpenAI API key not configured. Set OPENAI_API_KEY environment variable.")]
    MissingApiKey,

    #[error("Failed to connect to Realtime API: {0}")]
    ConnectionFailed(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Realtime protocol error: {0}")]
    ProtocolError(String),

    #[error("WebSocket disconnected: {0}")]
    Disconnected(String),

    #[error("Failed to send audio: {0}")]
    SendFailed(String),
}

impl From<&StreamingError> for ErrorKind {
    fn from(err: &StreamingError) -> Self {
        match err {
            StreamingError::ConnectionFailed(_)
            | StreamingError::Disconnected(_)
            | StreamingError::SendFailed(_) => ErrorKind::NetworkError,
            StreamingError::MissingApiKey
            | StreamingError::AuthenticationFailed(_)
            | StreamingError::ProtocolError(_) => ErrorKind::Unknown,
        }
    }
}

/// What a streaming engine reports back while a session is open.
#[derive(Debug, Clone)]
pub enum EngineUpdate {
    /// Text of the turn in progress
    Partial(String),
    /// A completed turn
    Final(String),
    Failed(StreamingError),
    /// The server side went away without an error
    Ended,
}

/// A continuous recognizer fed with mono PCM frames.
///
/// `open` resolves once the engine is ready to accept audio. The session
/// stays up until `frames` closes or the update receiver is dropped.
pub trait StreamingEngine: Send + Sync + 'static {
    fn open(
        &self,
        frames: mpsc::Receiver<Frame>,
        sample_rate: u32,
    ) -> BoxFuture<'static, Result<mpsc::Receiver<EngineUpdate>, StreamingError>>;
}
