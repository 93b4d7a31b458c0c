use std::sync::Arc;
use tokio::task::JoinHandle;

use super::{BackendKind, BackendSink, TranscriptionBackend};
use crate::audio::{AudioSource, CaptureGuard};
use crate::error::{ErrorKind, VoiceError};
use crate::events::TranscriptEvent;
use crate::streaming::{EngineUpdate, StreamingEngine, STREAMING_CONFIDENCE};

/// Continuous recognizer: microphone frames go straight to a streaming engine.
pub struct StreamingRecognizer {
    source: Arc<dyn AudioSource>,
    engine: Arc<dyn StreamingEngine>,
    capture: Option<CaptureGuard>,
    pump: Option<JoinHandle<()>>,
}

impl StreamingRecognizer {
    pub fn new(source: Arc<dyn AudioSource>, engine: Arc<dyn StreamingEngine>) -> Self {
        Self {
            source,
            engine,
            capture: None,
            pump: None,
        }
    }
}

impl TranscriptionBackend for StreamingRecognizer {
    fn kind(&self) -> BackendKind {
        BackendKind::Streaming
    }

    fn start(&mut self, sink: BackendSink) -> Result<(), VoiceError> {
        self.stop();

        let stream = self.source.open()?;
        let (frames, sample_rate, guard) = stream.into_parts();
        log::info!(
            "Streaming recognizer: capture open on {} at {}Hz (generation {})",
            self.source.name(),
            sample_rate,
            sink.generation()
        );

        let session = self.engine.open(frames, sample_rate);
        self.capture = Some(guard);
        self.pump = Some(tokio::spawn(async move {
            let mut updates = match session.await {
                Ok(updates) => updates,
                Err(e) => {
                    log::warn!("Streaming recognizer: engine failed to open: {}", e);
                    sink.error(ErrorKind::from(&e), e.to_string()).await;
                    return;
                }
            };
            if !sink.ready().await {
                return;
            }

            while let Some(update) = updates.recv().await {
                let delivered = match update {
                    EngineUpdate::Partial(text) => {
                        sink.transcript(TranscriptEvent::interim(text, STREAMING_CONFIDENCE))
                            .await
                    }
                    EngineUpdate::Final(text) => {
                        sink.transcript(TranscriptEvent::final_result(text, STREAMING_CONFIDENCE))
                            .await
                    }
                    EngineUpdate::Failed(e) => {
                        sink.error(ErrorKind::from(&e), e.to_string()).await;
                        return;
                    }
                    EngineUpdate::Ended => break,
                };
                if !delivered {
                    return;
                }
            }

            log::info!("Streaming recognizer: engine stream ended");
            sink.ended().await;
        }));
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        // Dropping the guard closes the frame channel, which ends the engine session
        if self.capture.take().is_some() {
            log::info!("Streaming recognizer: capture released");
        }
    }
}

impl Drop for StreamingRecognizer {
    fn drop(&mut self) {
        self.stop();
    }
}
