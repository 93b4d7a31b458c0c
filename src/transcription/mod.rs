//! Transcription backends
//!
//! Two interchangeable recognizers sit behind [`TranscriptionBackend`]:
//! [`StreamingRecognizer`] (continuous, online) and [`BatchRecognizer`]
//! (windowed WAV clips, works offline). Both report back through a
//! [`BackendSink`], which tags every event with the generation the backend
//! was started under so the state machine can drop stale results.

mod batch;
mod streaming;
mod whisper;

use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::audio::AudioSource;
use crate::error::{ErrorKind, VoiceError};
use crate::events::TranscriptEvent;
use crate::settings::VoiceSettings;
use crate::state_machine::Event;
use crate::streaming::StreamingEngine;

pub use batch::{BatchConfig, BatchRecognizer};
pub use streaming::StreamingRecognizer;
pub use whisper::{
    BatchTranscriber, BatchTranscript, TranscriptionError, WhisperClient,
    OPENAI_NO_SPEECH_MAX_TEXT_LEN, OPENAI_NO_SPEECH_PROB_THRESHOLD,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Streaming,
    Batch,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Streaming => write!(f, "streaming"),
            BackendKind::Batch => write!(f, "batch"),
        }
    }
}

/// Streaming needs the network; everything else falls back to batch.
pub fn select_backend(online: bool, offline_mode: bool) -> BackendKind {
    if online && !offline_mode {
        BackendKind::Streaming
    } else {
        BackendKind::Batch
    }
}

/// The only path from a running backend back into the state loop.
///
/// Every method returns `false` once the state loop has gone away.
#[derive(Debug, Clone)]
pub struct BackendSink {
    generation: u64,
    tx: mpsc::Sender<Event>,
}

impl BackendSink {
    pub fn new(generation: u64, tx: mpsc::Sender<Event>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Capture is open and audio is flowing.
    pub async fn ready(&self) -> bool {
        self.send(Event::BackendReady {
            generation: self.generation,
        })
        .await
    }

    pub async fn transcript(&self, transcript: TranscriptEvent) -> bool {
        self.send(Event::Transcript {
            generation: self.generation,
            transcript,
        })
        .await
    }

    pub async fn error(&self, kind: ErrorKind, message: impl Into<String>) -> bool {
        self.send(Event::BackendError {
            generation: self.generation,
            kind,
            message: message.into(),
        })
        .await
    }

    /// The backend stopped producing without an error.
    pub async fn ended(&self) -> bool {
        self.send(Event::BackendEnded {
            generation: self.generation,
        })
        .await
    }

    async fn send(&self, event: Event) -> bool {
        self.tx.send(event).await.is_ok()
    }
}

/// A recognizer that owns the microphone while started.
///
/// `start` must release any capture it already holds before opening a new
/// one. Failures after `start` returns are reported through the sink.
pub trait TranscriptionBackend: Send {
    fn kind(&self) -> BackendKind;
    fn start(&mut self, sink: BackendSink) -> Result<(), VoiceError>;
    /// Release the device and stop reporting. Idempotent.
    fn stop(&mut self);
}

/// Builds fresh backend instances; used on first start and on re-initialization.
pub trait BackendFactory: Send + Sync + 'static {
    fn create(&self, kind: BackendKind) -> Box<dyn TranscriptionBackend>;
}

/// Factory over the real microphone and engines.
pub struct DefaultBackendFactory {
    source: Arc<dyn AudioSource>,
    engine: Option<Arc<dyn StreamingEngine>>,
    transcriber: Arc<dyn BatchTranscriber>,
    batch: BatchConfig,
}

impl DefaultBackendFactory {
    pub fn new(
        source: Arc<dyn AudioSource>,
        engine: Option<Arc<dyn StreamingEngine>>,
        transcriber: Arc<dyn BatchTranscriber>,
        settings: &VoiceSettings,
    ) -> Self {
        Self {
            source,
            engine,
            transcriber,
            batch: BatchConfig {
                window: settings.batch_window(),
                vad_enabled: settings.batch_vad_enabled,
            },
        }
    }
}

impl BackendFactory for DefaultBackendFactory {
    fn create(&self, kind: BackendKind) -> Box<dyn TranscriptionBackend> {
        match (kind, &self.engine) {
            (BackendKind::Streaming, Some(engine)) => Box::new(StreamingRecognizer::new(
                self.source.clone(),
                engine.clone(),
            )),
            (BackendKind::Streaming, None) => {
                log::warn!("No streaming engine configured, using batch backend");
                self.batch_recognizer()
            }
            (BackendKind::Batch, _) => self.batch_recognizer(),
        }
    }
}

impl DefaultBackendFactory {
    fn batch_recognizer(&self) -> Box<dyn TranscriptionBackend> {
        Box::new(BatchRecognizer::new(
            self.source.clone(),
            self.transcriber.clone(),
            self.batch.clone(),
        ))
    }
}
