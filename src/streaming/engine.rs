use futures_util::future::BoxFuture;
use tokio::sync::mpsc;

use super::audio_streamer::{AudioStreamer, StreamerConfig};
use super::protocol::{ServerMessage, SessionConfig, REALTIME_API_URL};
use super::realtime_client::RealtimeSession;
use super::transcript_aggregator::TranscriptAggregator;
use super::{EngineUpdate, StreamingEngine, StreamingError};
use crate::audio::Frame;

/// Realtime transcription reports no confidence; use a fixed one
pub const STREAMING_CONFIDENCE: f32 = 0.9;

const UPDATE_CAPACITY: usize = 64;

/// `StreamingEngine` backed by the OpenAI Realtime API.
#[derive(Debug, Clone)]
pub struct RealtimeEngine {
    url: String,
    api_key: String,
    model: String,
}

impl RealtimeEngine {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            url: REALTIME_API_URL.to_string(),
            api_key: api_key.into(),
            model: "whisper-1".to_string(),
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }
}

impl StreamingEngine for RealtimeEngine {
    fn open(
        &self,
        frames: mpsc::Receiver<Frame>,
        sample_rate: u32,
    ) -> BoxFuture<'static, Result<mpsc::Receiver<EngineUpdate>, StreamingError>> {
        let url = self.url.clone();
        let api_key = self.api_key.clone();
        let config = SessionConfig::continuous(&self.model);

        Box::pin(async move {
            let mut session = RealtimeSession::connect(&url, &api_key, config).await?;
            let incoming = session.take_incoming_receiver().ok_or_else(|| {
                StreamingError::ProtocolError("incoming receiver already taken".to_string())
            })?;

            let (tx, rx) = mpsc::channel(UPDATE_CAPACITY);

            let streamer = AudioStreamer::new(
                session,
                frames,
                StreamerConfig {
                    source_sample_rate: sample_rate,
                    ..Default::default()
                },
            );
            let failure_tx = tx.clone();
            tokio::spawn(async move {
                if let Err(e) = streamer.run().await {
                    log::warn!("Realtime: audio streaming failed: {}", e);
                    let _ = failure_tx.send(EngineUpdate::Failed(e)).await;
                }
            });

            tokio::spawn(translate_messages(incoming, tx));
            Ok(rx)
        })
    }
}

/// Map server messages onto engine updates until either side goes away.
async fn translate_messages(
    mut incoming: mpsc::Receiver<ServerMessage>,
    tx: mpsc::Sender<EngineUpdate>,
) {
    let mut aggregator = TranscriptAggregator::new();

    while let Some(msg) = incoming.recv().await {
        let update = match msg {
            ServerMessage::TranscriptDelta { item_id, delta } => {
                let text = aggregator.process_delta(item_id.as_deref(), &delta);
                if text.trim().is_empty() {
                    continue;
                }
                EngineUpdate::Partial(text.trim().to_string())
            }
            ServerMessage::TranscriptCompleted { transcript, .. } => {
                let text = aggregator.process_completed(&transcript);
                if text.is_empty() {
                    continue;
                }
                EngineUpdate::Final(text)
            }
            ServerMessage::TranscriptFailed { error, .. } => {
                // One lost turn; the session is still usable
                log::warn!("Realtime: turn transcription failed: {}", error.message);
                aggregator.reset();
                continue;
            }
            ServerMessage::Error { error } => {
                let err = if error.is_auth() {
                    StreamingError::AuthenticationFailed(error.message)
                } else {
                    StreamingError::ProtocolError(error.message)
                };
                let _ = tx.send(EngineUpdate::Failed(err)).await;
                return;
            }
            _ => continue,
        };

        if tx.send(update).await.is_err() {
            return;
        }
    }

    let _ = tx.send(EngineUpdate::Ended).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delta(item: &str, text: &str) -> ServerMessage {
        ServerMessage::TranscriptDelta {
            item_id: Some(item.to_string()),
            delta: text.to_string(),
        }
    }

    #[tokio::test]
    async fn translates_turns_then_reports_end() {
        let (in_tx, in_rx) = mpsc::channel(16);
        let (out_tx, mut out_rx) = mpsc::channel(16);
        let task = tokio::spawn(translate_messages(in_rx, out_tx));

        in_tx.send(delta("a", "hey ")).await.unwrap();
        in_tx.send(delta("a", "lark")).await.unwrap();
        in_tx
            .send(ServerMessage::TranscriptCompleted {
                item_id: Some("a".into()),
                transcript: "Hey lark.".into(),
            })
            .await
            .unwrap();
        drop(in_tx);
        task.await.unwrap();

        let mut updates = Vec::new();
        while let Some(u) = out_rx.recv().await {
            updates.push(u);
        }
        assert!(matches!(&updates[0], EngineUpdate::Partial(t) if t == "hey"));
        assert!(matches!(&updates[1], EngineUpdate::Partial(t) if t == "hey lark"));
        assert!(matches!(&updates[2], EngineUpdate::Final(t) if t == "Hey lark."));
        assert!(matches!(updates[3], EngineUpdate::Ended));
        assert_eq!(updates.len(), 4);
    }

    #[tokio::test]
    async fn server_error_fails_session() {
        let (in_tx, in_rx) = mpsc::channel(4);
        let (out_tx, mut out_rx) = mpsc::channel(4);
        in_tx
            .send(ServerMessage::Error {
                error: Default::default(),
            })
            .await
            .unwrap();
        translate_messages(in_rx, out_tx).await;

        assert!(matches!(
            out_rx.recv().await,
            Some(EngineUpdate::Failed(StreamingError::ProtocolError(_)))
        ));
    }
}
