//! Whisper-compatible HTTP client for one-shot transcription
//!
//! Posts a WAV clip to any OpenAI-compatible `/audio/transcriptions`
//! endpoint. The default endpoint is a local whisper server, so the batch
//! path keeps working without internet access.

use futures_util::future::BoxFuture;
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

use crate::error::ErrorKind;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Confidence reported when the server returns no segment scores
const DEFAULT_CONFIDENCE: f32 = 0.8;

pub const OPENAI_NO_SPEECH_PROB_THRESHOLD: f32 = 0.8;
pub const OPENAI_NO_SPEECH_MAX_TEXT_LEN: usize = 12;

#[derive(Debug, Clone, Error)]
pub enum TranscriptionError {
    #[error("Failed to build HTTP client: {0}")]
    ClientInit(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Transcription API error ({status}): {message}")]
    ApiError { status: u16, message: String },

    #[error("Failed to parse API response: {0}")]
    ParseError(String),
}

impl From<&TranscriptionError> for ErrorKind {
    fn from(err: &TranscriptionError) -> Self {
        match err {
            TranscriptionError::NetworkError(_) => ErrorKind::NetworkError,
            // Rate limits and server trouble clear up on their own
            TranscriptionError::ApiError { status, .. } if *status == 429 || *status >= 500 => {
                ErrorKind::NetworkError
            }
            _ => ErrorKind::Unknown,
        }
    }
}

/// Result of transcribing one clip.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchTranscript {
    pub text: String,
    pub confidence: f32,
    /// Highest per-segment no-speech probability, when the server reports one
    pub no_speech_prob: Option<f32>,
}

impl BatchTranscript {
    /// Whisper hallucinates short phrases on silence; trust its no-speech flag for those.
    pub fn is_no_speech(&self) -> bool {
        self.no_speech_prob
            .is_some_and(|p| p >= OPENAI_NO_SPEECH_PROB_THRESHOLD)
            && self.text.trim().len() <= OPENAI_NO_SPEECH_MAX_TEXT_LEN
    }

    /// The trimmed text, unless the clip was empty or flagged as no speech.
    pub fn accepted_text(&self) -> Option<&str> {
        let text = self.text.trim();
        if text.is_empty() || self.is_no_speech() {
            None
        } else {
            Some(text)
        }
    }
}

/// One-shot transcription of an encoded WAV clip.
pub trait BatchTranscriber: Send + Sync + 'static {
    fn transcribe(&self, wav: Vec<u8>) -> BoxFuture<'static, Result<BatchTranscript, TranscriptionError>>;
}

#[derive(Debug, Deserialize)]
struct VerboseResponse {
    text: String,
    #[serde(default)]
    segments: Vec<Segment>,
}

#[derive(Debug, Deserialize)]
struct Segment {
    #[serde(default)]
    avg_logprob: Option<f32>,
    #[serde(default)]
    no_speech_prob: Option<f32>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

impl From<VerboseResponse> for BatchTranscript {
    fn from(response: VerboseResponse) -> Self {
        let logprobs: Vec<f32> = response
            .segments
            .iter()
            .filter_map(|s| s.avg_logprob)
            .collect();
        let confidence = if logprobs.is_empty() {
            DEFAULT_CONFIDENCE
        } else {
            logprobs.iter().map(|lp| lp.exp()).sum::<f32>() / logprobs.len() as f32
        };
        let no_speech_prob = response
            .segments
            .iter()
            .filter_map(|s| s.no_speech_prob)
            .max_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        Self {
            text: response.text,
            confidence: confidence.clamp(0.0, 1.0),
            no_speech_prob,
        }
    }
}

/// Multipart client for `/audio/transcriptions`.
#[derive(Debug, Clone)]
pub struct WhisperClient {
    endpoint: String,
    model: String,
    api_key: Option<String>,
    client: Client,
}

impl WhisperClient {
    pub fn new(
        endpoint: impl Into<String>,
        model: impl Into<String>,
        api_key: Option<String>,
    ) -> Result<Self, TranscriptionError> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| TranscriptionError::ClientInit(e.to_string()))?;
        Ok(Self {
            endpoint: endpoint.into(),
            model: model.into(),
            api_key: api_key.filter(|k| !k.is_empty()),
            client,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn post(&self, wav: Vec<u8>) -> Result<BatchTranscript, TranscriptionError> {
        log::info!(
            "Transcribing {} byte clip via {}",
            wav.len(),
            self.endpoint
        );

        let file_part = Part::bytes(wav)
            .file_name("clip.wav")
            .mime_str("audio/wav")
            .map_err(|e| TranscriptionError::ParseError(e.to_string()))?;
        let form = Form::new()
            .part("file", file_part)
            .text("model", self.model.clone())
            .text("response_format", "verbose_json")
            .text("temperature", "0");

        let mut request = self.client.post(&self.endpoint).multipart(form);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| TranscriptionError::NetworkError(e.to_string()))?;
        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ApiErrorResponse>(&body)
                .map(|r| r.error.message)
                .unwrap_or(body);
            log::error!("Transcription API error ({}): {}", status.as_u16(), message);
            return Err(TranscriptionError::ApiError {
                status: status.as_u16(),
                message,
            });
        }

        let parsed: VerboseResponse = response
            .json()
            .await
            .map_err(|e| TranscriptionError::ParseError(e.to_string()))?;
        let transcript = BatchTranscript::from(parsed);
        log::info!(
            "Transcription successful: {} chars (confidence={:.2}, no_speech_prob={:?})",
            transcript.text.len(),
            transcript.confidence,
            transcript.no_speech_prob
        );
        Ok(transcript)
    }
}

impl BatchTranscriber for WhisperClient {
    fn transcribe(&self, wav: Vec<u8>) -> BoxFuture<'static, Result<BatchTranscript, TranscriptionError>> {
        let client = self.clone();
        Box::pin(async move { client.post(wav).await })
    }
}
